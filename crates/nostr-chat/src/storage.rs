use crate::types::{ChatMessage, RoomRef};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Persistent per-room conversation history.
pub trait ConversationLog: Send + Sync {
    /// Record an accepted message under its resolved display name.
    fn append(&self, room: &RoomRef, message: &ChatMessage, display_name: &str) -> Result<()>;

    /// The last `max` messages of `room`, oldest first. Returned messages carry
    /// shortened ids and pubkeys and `is_mine == false`.
    fn load_recent(&self, room: &RoomRef, max: usize) -> Result<Vec<ChatMessage>>;
}

#[derive(Clone, Default)]
pub struct InMemoryLog {
    rooms: Arc<Mutex<HashMap<String, Vec<ChatMessage>>>>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Vec<ChatMessage>>>> {
        self.rooms
            .lock()
            .map_err(|_| Error::Storage("conversation log lock poisoned".to_string()))
    }
}

impl ConversationLog for InMemoryLog {
    fn append(&self, room: &RoomRef, message: &ChatMessage, display_name: &str) -> Result<()> {
        let mut logged = message.clone();
        logged.author = display_name.to_string();
        self.lock()?
            .entry(room.stable_key())
            .or_default()
            .push(logged);
        Ok(())
    }

    fn load_recent(&self, room: &RoomRef, max: usize) -> Result<Vec<ChatMessage>> {
        let rooms = self.lock()?;
        let Some(messages) = rooms.get(&room.stable_key()) else {
            return Ok(Vec::new());
        };
        let start = messages.len().saturating_sub(max);
        Ok(messages[start..]
            .iter()
            .map(|m| ChatMessage {
                is_mine: false,
                ..m.clone()
            })
            .collect())
    }
}

/// A log that drops everything, for sessions without history.
#[derive(Clone, Copy, Default)]
pub struct NullLog;

impl ConversationLog for NullLog {
    fn append(&self, _room: &RoomRef, _message: &ChatMessage, _display_name: &str) -> Result<()> {
        Ok(())
    }

    fn load_recent(&self, _room: &RoomRef, _max: usize) -> Result<Vec<ChatMessage>> {
        Ok(Vec::new())
    }
}
