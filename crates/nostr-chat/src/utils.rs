use crate::{Error, Result};
use nostr::{PublicKey, Tag};
use sha2::{Digest, Sha256};

pub fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn pubkey_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str)?;
    if bytes.len() != 32 {
        return Err(Error::InvalidEvent("Invalid pubkey length".to_string()));
    }
    PublicKey::from_slice(&bytes).map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// First `len` characters of an id, or the whole id when shorter.
pub fn short_id(id: &str, len: usize) -> &str {
    match id.char_indices().nth(len) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Stable id for an unsigned rumor: sha256 over sender, recipient, timestamp and content.
/// Both ends of a conversation derive the same id for the same message.
pub fn synthetic_event_id(
    sender: &PublicKey,
    recipient: &PublicKey,
    timestamp: u64,
    content: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender.to_hex().as_bytes());
    hasher.update(b":");
    hasher.update(recipient.to_hex().as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn build_tag(parts: &[&str]) -> Result<Tag> {
    let owned: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
    Tag::parse(owned).map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// Value of the first tag named `name`.
pub fn tag_value<'a>(tags: impl IntoIterator<Item = &'a Tag>, name: &str) -> Option<&'a str> {
    tags.into_iter().find_map(|t| {
        let parts = t.as_slice();
        if parts.first().map(|s| s.as_str()) == Some(name) {
            parts.get(1).map(|s| s.as_str())
        } else {
            None
        }
    })
}

pub fn is_hex_pubkey(s: &str) -> bool {
    s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())
}
