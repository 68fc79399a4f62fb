use nostr::{Event, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const METADATA_KIND: u16 = 0;
pub const SEAL_KIND: u16 = 13;
pub const PRIVATE_MESSAGE_KIND: u16 = 14;
pub const CHANNEL_CREATE_KIND: u16 = 40;
pub const CHANNEL_METADATA_KIND: u16 = 41;
pub const CHANNEL_MESSAGE_KIND: u16 = 42;
pub const GIFT_WRAP_KIND: u16 = 1059;
pub const RELAY_LIST_KIND: u16 = 10002;
pub const CHANNELS_LIST_KIND: u16 = 10005;
pub const GROUPS_LIST_KIND: u16 = 10009;
pub const CONTACTS_LIST_KIND: u16 = 30000;

pub const GROUP_MESSAGE_KIND: u16 = 9;
pub const GROUP_PUT_USER_KIND: u16 = 9000;
pub const GROUP_EDIT_METADATA_KIND: u16 = 9002;
pub const GROUP_DELETE_EVENT_KIND: u16 = 9005;
pub const GROUP_CREATE_KIND: u16 = 9007;
pub const GROUP_CREATE_INVITE_KIND: u16 = 9009;
pub const GROUP_JOIN_REQUEST_KIND: u16 = 9021;
pub const GROUP_LEAVE_REQUEST_KIND: u16 = 9022;
pub const GROUP_METADATA_KIND: u16 = 39000;
pub const GROUP_ADMINS_KIND: u16 = 39001;
pub const GROUP_MEMBERS_KIND: u16 = 39002;

/// `d` tag value of the self-encrypted contacts list.
pub const CONTACTS_LIST_IDENTIFIER: &str = "nchat/dm-contacts";

/// Separator between relay url and group id in a [`GroupKey`].
pub const GROUP_KEY_SEPARATOR: char = '\'';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Channel,
    Group,
    Direct,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::Channel => "channel",
            RoomKind::Group => "group",
            RoomKind::Direct => "dm",
        }
    }
}

/// A relay-scoped group. The same group id on two relays is two groups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupKey {
    pub relay_url: String,
    pub group_id: String,
}

impl GroupKey {
    pub fn new(relay_url: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            group_id: group_id.into(),
        }
    }

    /// Parse `relay-url'group-id`. The group id is everything after the last separator.
    pub fn parse(s: &str) -> Option<Self> {
        let (relay, id) = s.rsplit_once(GROUP_KEY_SEPARATOR)?;
        if relay.is_empty() || id.is_empty() {
            return None;
        }
        Some(Self::new(relay, id))
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.relay_url, GROUP_KEY_SEPARATOR, self.group_id)
    }
}

/// Reference to one conversation. All per-room maps are keyed by [`RoomRef::stable_key`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "lowercase")]
pub enum RoomRef {
    /// Hex id of the channel creation event.
    Channel(String),
    Group(GroupKey),
    /// Peer public key.
    Direct(PublicKey),
}

impl RoomRef {
    pub fn kind(&self) -> RoomKind {
        match self {
            RoomRef::Channel(_) => RoomKind::Channel,
            RoomRef::Group(_) => RoomKind::Group,
            RoomRef::Direct(_) => RoomKind::Direct,
        }
    }

    pub fn stable_key(&self) -> String {
        match self {
            RoomRef::Channel(id) => format!("channel:{}", id),
            RoomRef::Group(key) => format!("group:{}", key),
            RoomRef::Direct(pk) => format!("dm:{}", pk.to_hex()),
        }
    }

    pub fn display_prefix(&self) -> &'static str {
        match self {
            RoomRef::Channel(_) => "#",
            RoomRef::Group(_) => "~",
            RoomRef::Direct(_) => "@",
        }
    }

    /// Reference string without the kind prefix: channel id, group key, or peer hex.
    pub fn reference(&self) -> String {
        match self {
            RoomRef::Channel(id) => id.clone(),
            RoomRef::Group(key) => key.to_string(),
            RoomRef::Direct(pk) => pk.to_hex(),
        }
    }

    pub fn as_group(&self) -> Option<&GroupKey> {
        match self {
            RoomRef::Group(key) => Some(key),
            _ => None,
        }
    }
}

impl fmt::Display for RoomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reference = self.reference();
        match self {
            RoomRef::Group(key) => write!(f, "{}{}", self.display_prefix(), key.group_id),
            _ => write!(
                f,
                "{}{}",
                self.display_prefix(),
                crate::utils::short_id(&reference, 8)
            ),
        }
    }
}

/// Display projection of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Display hint for the author at the time the message was accepted.
    pub author: String,
    /// Author hex. History seeded from the conversation log carries a shortened prefix.
    pub pubkey: String,
    pub content: String,
    pub timestamp: u64,
    pub event_id: String,
    pub room: RoomRef,
    pub is_mine: bool,
}

impl ChatMessage {
    pub fn from_event(event: &Event, room: RoomRef, me: &PublicKey, author: String) -> Self {
        Self {
            author,
            pubkey: event.pubkey.to_hex(),
            content: event.content.clone(),
            timestamp: event.created_at.as_u64(),
            event_id: event.id.to_hex(),
            room,
            is_mine: event.pubkey == *me,
        }
    }
}

/// Profile fields published as kind-0 metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Group metadata edit. Unset fields are left untouched by the relay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupMetadataFields {
    pub name: Option<String>,
    pub about: Option<String>,
    pub picture: Option<String>,
    pub public: Option<bool>,
    pub open: Option<bool>,
}

/// Channel metadata carried in kind 40/41 content.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub about: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
}

/// Library-side configuration input. Never persisted by this crate.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub relays: Vec<String>,
    pub max_messages_per_room: usize,
    pub profile: ProfileFields,
}

pub const DEFAULT_MAX_MESSAGES_PER_ROOM: usize = 500;

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            max_messages_per_room: DEFAULT_MAX_MESSAGES_PER_ROOM,
            profile: ProfileFields::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::Keys;

    #[test]
    fn group_key_roundtrips_through_display() {
        let key = GroupKey::new("wss://groups.example.com", "pizza");
        assert_eq!(key.to_string(), "wss://groups.example.com'pizza");
        assert_eq!(GroupKey::parse(&key.to_string()), Some(key));
    }

    #[test]
    fn group_key_rejects_missing_parts() {
        assert!(GroupKey::parse("wss://relay.example.com").is_none());
        assert!(GroupKey::parse("'pizza").is_none());
        assert!(GroupKey::parse("wss://relay.example.com'").is_none());
    }

    #[test]
    fn same_group_id_on_two_relays_has_distinct_keys() {
        let a = RoomRef::Group(GroupKey::new("wss://a.example.com", "chat"));
        let b = RoomRef::Group(GroupKey::new("wss://b.example.com", "chat"));
        assert_ne!(a, b);
        assert_ne!(a.stable_key(), b.stable_key());
    }

    #[test]
    fn stable_keys_are_kind_prefixed() {
        let pk = Keys::generate().public_key();
        assert!(RoomRef::Direct(pk).stable_key().starts_with("dm:"));
        assert!(RoomRef::Channel("ab".repeat(32)).stable_key().starts_with("channel:"));
        assert_eq!(RoomRef::Direct(pk).kind(), RoomKind::Direct);
        assert_eq!(RoomRef::Direct(pk).display_prefix(), "@");
    }
}
