use crate::types::{ChatMessage, DEFAULT_MAX_MESSAGES_PER_ROOM};
use std::collections::HashMap;

/// Per-room message buffers, kept sorted by timestamp and capped in length.
#[derive(Debug, Clone)]
pub struct MessageStore {
    rooms: HashMap<String, Vec<ChatMessage>>,
    max_per_room: usize,
}

impl MessageStore {
    pub fn new(max_per_room: usize) -> Self {
        Self {
            rooms: HashMap::new(),
            max_per_room: max_per_room.max(1),
        }
    }

    pub fn max_per_room(&self) -> usize {
        self.max_per_room
    }

    /// Insert in timestamp order. A message with the same timestamp as existing
    /// ones lands after them. Oldest entries are trimmed once the cap is exceeded.
    /// Returns `false` if the message was trimmed straight away.
    pub fn insert(&mut self, room_key: &str, message: ChatMessage) -> bool {
        let messages = self.rooms.entry(room_key.to_string()).or_default();
        let position = messages.partition_point(|m| m.timestamp <= message.timestamp);
        let event_id = message.event_id.clone();
        messages.insert(position, message);

        if messages.len() > self.max_per_room {
            let excess = messages.len() - self.max_per_room;
            messages.drain(..excess);
            return messages.iter().any(|m| m.event_id == event_id);
        }
        true
    }

    pub fn messages(&self, room_key: &str) -> &[ChatMessage] {
        self.rooms
            .get(room_key)
            .map(|m| m.as_slice())
            .unwrap_or(&[])
    }

    /// Whether the room already holds `event_id`, either in full or as the
    /// shortened id that log-seeded history carries.
    pub fn contains(&self, room_key: &str, event_id: &str) -> bool {
        self.messages(room_key).iter().any(|m| {
            m.event_id == event_id
                || (!m.event_id.is_empty()
                    && m.event_id.len() < event_id.len()
                    && event_id.starts_with(&m.event_id))
        })
    }

    pub fn remove_room(&mut self, room_key: &str) -> Option<Vec<ChatMessage>> {
        self.rooms.remove(room_key)
    }

    pub fn len(&self, room_key: &str) -> usize {
        self.messages(room_key).len()
    }
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES_PER_ROOM)
    }
}
