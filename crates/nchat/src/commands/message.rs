use anyhow::{Context, Result};
use nostr::ToBech32;
use nostr_chat::identifier::resolve_identifier;
use nostr_chat::utils::now_seconds;
use nostr_chat::{
    wrap_message, ChatMessage, ConversationLog, FileConversationLog, RelayPool, RoomRef,
};
use serde::Serialize;
use std::path::Path;

use super::room::{parse_room_target, resolve_room};
use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct SendResult {
    recipient: String,
    event_id: String,
    recipient_relays: Vec<String>,
    own_relays: Vec<String>,
}

#[derive(Serialize)]
struct HistoryResult {
    room: String,
    messages: Vec<HistoryLine>,
}

#[derive(Serialize)]
struct HistoryLine {
    timestamp: u64,
    id: String,
    pubkey: String,
    author: String,
    content: String,
}

/// Send one gift-wrapped direct message and exit
pub async fn send(
    recipient: &str,
    message: &str,
    config: &Config,
    data_dir: &Path,
    output: &Output,
) -> Result<()> {
    if message.trim().is_empty() {
        anyhow::bail!("Message is empty");
    }
    let keys = config.keys()?;
    let http = reqwest::Client::new();
    let peer = resolve_identifier(&http, recipient)
        .await
        .with_context(|| format!("Could not resolve {}", recipient))?
        .pubkey;

    let pool = RelayPool::new(keys.clone(), config.relays.clone());
    let now = now_seconds();
    let wrapped = wrap_message(&keys, &peer, message, now)?;
    let result = pool.publish_direct(&wrapped, &peer).await;
    pool.shutdown().await;
    let report = result?;

    let room = RoomRef::Direct(peer);
    let log = FileConversationLog::new(crate::logs_dir(data_dir))?;
    let name = config
        .profile
        .display_name
        .clone()
        .or_else(|| config.profile.name.clone())
        .unwrap_or_else(|| "me".to_string());
    let record = ChatMessage {
        author: name.clone(),
        pubkey: keys.public_key().to_hex(),
        content: message.to_string(),
        timestamp: now,
        event_id: wrapped.event_id.clone(),
        room: room.clone(),
        is_mine: true,
    };
    if let Err(e) = log.append(&room, &record, &name) {
        tracing::warn!(error = %e, "failed to record sent message");
    }

    output.success(
        "send",
        SendResult {
            recipient: peer.to_bech32().unwrap_or_else(|_| peer.to_hex()),
            event_id: wrapped.event_id,
            recipient_relays: report.recipient.success,
            own_relays: report.own.success,
        },
    );
    Ok(())
}

/// Print the tail of a room's conversation log
pub async fn history(room: &str, limit: usize, data_dir: &Path, output: &Output) -> Result<()> {
    let room = resolve_room(parse_room_target(room)?, &reqwest::Client::new()).await?;
    let log = FileConversationLog::new(crate::logs_dir(data_dir))?;
    let messages = log.load_recent(&room, limit)?;

    if !output.is_json() {
        for message in &messages {
            println!(
                "{}",
                crate::output::format_message_line(message, &room.to_string(), true)
            );
        }
        return Ok(());
    }
    output.success(
        "history",
        HistoryResult {
            room: room.to_string(),
            messages: messages
                .into_iter()
                .map(|m| HistoryLine {
                    timestamp: m.timestamp,
                    id: m.event_id,
                    pubkey: m.pubkey,
                    author: m.author,
                    content: m.content,
                })
                .collect(),
        },
    );
    Ok(())
}
