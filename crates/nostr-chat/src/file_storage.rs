//! Plain-text conversation log: one tab-separated record per line,
//! `timestamp \t short-id \t short-pubkey \t display-name \t escaped-content`.

use crate::storage::ConversationLog;
use crate::types::{ChatMessage, RoomRef};
use crate::utils::short_id;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const SHORT_LEN: usize = 8;
const TAIL_CHUNK: u64 = 8 * 1024;

pub struct FileConversationLog {
    base_path: PathBuf,
}

impl FileConversationLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        fs::create_dir_all(&base_path)
            .map_err(|e| Error::Storage(format!("Failed to create log directory: {}", e)))?;
        Ok(Self { base_path })
    }

    pub fn room_path(&self, room: &RoomRef) -> PathBuf {
        let sanitized = room.reference().replace(['/', '\\', ':', '\''], "_");
        self.base_path
            .join(room.kind().as_str())
            .join(format!("{}.log", sanitized))
    }
}

impl ConversationLog for FileConversationLog {
    fn append(&self, room: &RoomRef, message: &ChatMessage, display_name: &str) -> Result<()> {
        let path = self.room_path(room);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("Failed to create log directory: {}", e)))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to open log: {}", e)))?;
        writeln!(file, "{}", format_record(message, display_name))
            .map_err(|e| Error::Storage(format!("Failed to write log: {}", e)))?;
        Ok(())
    }

    fn load_recent(&self, room: &RoomRef, max: usize) -> Result<Vec<ChatMessage>> {
        let path = self.room_path(room);
        if max == 0 || !path.exists() {
            return Ok(Vec::new());
        }
        let lines = tail_lines(&path, max)?;
        let mut messages = Vec::with_capacity(lines.len());
        for line in lines {
            match parse_record(&line, room) {
                Some(message) => messages.push(message),
                None => tracing::warn!(path = %path.display(), "skipping malformed log record"),
            }
        }
        Ok(messages)
    }
}

/// Escape backslashes, then newlines, so the content fits on one line.
pub fn escape_content(content: &str) -> String {
    content.replace('\\', "\\\\").replace('\n', "\\n")
}

pub fn unescape_content(escaped: &str) -> String {
    let mut out = String::with_capacity(escaped.len());
    let mut chars = escaped.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

pub fn format_record(message: &ChatMessage, display_name: &str) -> String {
    let timestamp = DateTime::from_timestamp(message.timestamp as i64, 0)
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_default();
    let name = display_name.replace(['\t', '\n', '\r'], " ");
    format!(
        "{}\t{}\t{}\t{}\t{}",
        timestamp,
        short_id(&message.event_id, SHORT_LEN),
        short_id(&message.pubkey, SHORT_LEN),
        name,
        escape_content(&message.content)
    )
}

pub fn parse_record(line: &str, room: &RoomRef) -> Option<ChatMessage> {
    let mut fields = line.splitn(5, '\t');
    let timestamp = fields.next()?;
    let event_id = fields.next()?;
    let pubkey = fields.next()?;
    let name = fields.next()?;
    let content = fields.next()?;

    let timestamp = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc()
        .timestamp();

    Some(ChatMessage {
        author: name.to_string(),
        pubkey: pubkey.to_string(),
        content: unescape_content(content),
        timestamp: u64::try_from(timestamp).ok()?,
        event_id: event_id.to_string(),
        room: room.clone(),
        is_mine: false,
    })
}

/// Last `max` lines of a file, read backwards in fixed-size chunks.
fn tail_lines(path: &Path, max: usize) -> Result<Vec<String>> {
    let mut file =
        File::open(path).map_err(|e| Error::Storage(format!("Failed to open log: {}", e)))?;
    let mut pos = file.metadata()?.len();
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;

    // One newline more than needed guarantees `max` complete lines after the cut
    while pos > 0 && newlines <= max {
        let read = TAIL_CHUNK.min(pos);
        pos -= read;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; read as usize];
        file.read_exact(&mut chunk)?;
        newlines += chunk.iter().filter(|b| **b == b'\n').count();
        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines: Vec<&str> = text.split('\n').collect();
    if pos > 0 && !lines.is_empty() {
        // Partial first line
        lines.remove(0);
    }
    let lines: Vec<&str> = lines.into_iter().filter(|l| !l.is_empty()).collect();
    let start = lines.len().saturating_sub(max);
    Ok(lines[start..].iter().map(|l| l.to_string()).collect())
}
