//! Last-writer-wins sync of the contacts, channels and groups lists.
//!
//! Contacts are stored as a self-encrypted parameterized-replaceable event;
//! channels and groups as plain replaceable tag lists. The relay event's
//! `created_at` is the list version.

use crate::gift_wrap::{decrypt_from_self, encrypt_to_self};
use crate::types::{
    GroupKey, CHANNELS_LIST_KIND, CONTACTS_LIST_IDENTIFIER, CONTACTS_LIST_KIND, GROUPS_LIST_KIND,
};
use crate::utils::{build_tag, is_hex_pubkey, pubkey_from_hex, tag_value};
use crate::{Error, Result};
use nostr::{Alphabet, Event, EventBuilder, Filter, Keys, Kind, PublicKey, SingleLetterTag, Timestamp};
use std::collections::HashMap;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListKind {
    Contacts,
    Channels,
    Groups,
}

impl ListKind {
    pub const ALL: [ListKind; 3] = [ListKind::Contacts, ListKind::Channels, ListKind::Groups];

    pub fn event_kind(&self) -> u16 {
        match self {
            ListKind::Contacts => CONTACTS_LIST_KIND,
            ListKind::Channels => CHANNELS_LIST_KIND,
            ListKind::Groups => GROUPS_LIST_KIND,
        }
    }

    pub fn from_event_kind(kind: u16) -> Option<Self> {
        match kind {
            CONTACTS_LIST_KIND => Some(ListKind::Contacts),
            CHANNELS_LIST_KIND => Some(ListKind::Channels),
            GROUPS_LIST_KIND => Some(ListKind::Groups),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListKind::Contacts => "contacts",
            ListKind::Channels => "channels",
            ListKind::Groups => "groups",
        }
    }

    /// Filter for our own latest copy of this list.
    pub fn filter(&self, author: PublicKey) -> Filter {
        let filter = Filter::new()
            .kind(Kind::from(self.event_kind()))
            .author(author)
            .limit(1);
        match self {
            ListKind::Contacts => filter.custom_tag(
                SingleLetterTag::lowercase(Alphabet::D),
                CONTACTS_LIST_IDENTIFIER,
            ),
            _ => filter,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ListContent {
    Contacts(Vec<PublicKey>),
    Channels(Vec<String>),
    Groups(Vec<GroupKey>),
}

impl ListContent {
    pub fn kind(&self) -> ListKind {
        match self {
            ListContent::Contacts(_) => ListKind::Contacts,
            ListContent::Channels(_) => ListKind::Channels,
            ListContent::Groups(_) => ListKind::Groups,
        }
    }
}

/// A list together with the timestamp it was published at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedList {
    pub content: ListContent,
    pub version: u64,
}

/// Build and sign the relay event for `content`.
pub fn build_list_event(keys: &Keys, content: &ListContent, created_at: u64) -> Result<Event> {
    let kind = Kind::from(content.kind().event_kind());
    let builder = match content {
        ListContent::Contacts(contacts) => {
            let entries: Vec<Vec<String>> = contacts
                .iter()
                .map(|pk| vec!["p".to_string(), pk.to_hex()])
                .collect();
            let encrypted = encrypt_to_self(keys, &serde_json::to_string(&entries)?)?;
            EventBuilder::new(kind, encrypted).tag(build_tag(&["d", CONTACTS_LIST_IDENTIFIER])?)
        }
        ListContent::Channels(channels) => {
            let tags = channels
                .iter()
                .map(|id| build_tag(&["e", id]))
                .collect::<Result<Vec<_>>>()?;
            EventBuilder::new(kind, "").tags(tags)
        }
        ListContent::Groups(groups) => {
            let tags = groups
                .iter()
                .map(|g| build_tag(&["group", &g.group_id, &g.relay_url]))
                .collect::<Result<Vec<_>>>()?;
            EventBuilder::new(kind, "").tags(tags)
        }
    };

    builder
        .custom_created_at(Timestamp::from(created_at))
        .build(keys.public_key())
        .sign_with_keys(keys)
        .map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// Parse one of our list events. Malformed entries are skipped; the contacts
/// list must decrypt with our key.
pub fn parse_list_event(event: &Event, keys: &Keys) -> Result<VersionedList> {
    let kind = ListKind::from_event_kind(event.kind.as_u16()).ok_or_else(|| {
        Error::InvalidEvent(format!("kind {} is not a list", event.kind.as_u16()))
    })?;
    if event.pubkey != keys.public_key() {
        return Err(Error::InvalidEvent("list authored by someone else".to_string()));
    }

    let content = match kind {
        ListKind::Contacts => {
            if tag_value(event.tags.iter(), "d") != Some(CONTACTS_LIST_IDENTIFIER) {
                return Err(Error::InvalidEvent("unexpected contacts list identifier".to_string()));
            }
            let mut contacts = Vec::new();
            if !event.content.is_empty() {
                let plaintext = decrypt_from_self(keys, &event.content)?;
                let entries: Vec<Vec<String>> = serde_json::from_str(&plaintext)?;
                for entry in entries {
                    if let [name, hex, ..] = entry.as_slice() {
                        if name == "p" && is_hex_pubkey(hex) {
                            let pk = pubkey_from_hex(hex)?;
                            if !contacts.contains(&pk) {
                                contacts.push(pk);
                            }
                        }
                    }
                }
            }
            ListContent::Contacts(contacts)
        }
        ListKind::Channels => {
            let mut channels: Vec<String> = Vec::new();
            for tag in event.tags.iter() {
                if let [name, id, ..] = tag.as_slice() {
                    if name == "e" && !id.is_empty() && !channels.contains(id) {
                        channels.push(id.clone());
                    }
                }
            }
            ListContent::Channels(channels)
        }
        ListKind::Groups => {
            let mut groups = Vec::new();
            for tag in event.tags.iter() {
                if let [name, id, relay, ..] = tag.as_slice() {
                    if name == "group" && !id.is_empty() && !relay.is_empty() {
                        let key = GroupKey::new(relay.clone(), id.clone());
                        if !groups.contains(&key) {
                            groups.push(key);
                        }
                    }
                }
            }
            ListContent::Groups(groups)
        }
    };

    Ok(VersionedList {
        content,
        version: event.created_at.as_u64(),
    })
}

/// Tracks the last applied version of each list.
#[derive(Debug, Clone, Default)]
pub struct ListReconciler {
    versions: HashMap<ListKind, u64>,
}

impl ListReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self, kind: ListKind) -> Option<u64> {
        self.versions.get(&kind).copied()
    }

    /// Accept `list` if it is strictly newer than what was last applied, recording its version.
    pub fn offer(&mut self, list: &VersionedList) -> bool {
        let kind = list.content.kind();
        match self.versions.get(&kind) {
            Some(current) if list.version <= *current => {
                tracing::debug!(
                    list = kind.as_str(),
                    incoming = list.version,
                    current,
                    "ignoring stale list"
                );
                false
            }
            _ => {
                self.versions.insert(kind, list.version);
                true
            }
        }
    }

    /// Version for a local republish: the current time, bumped past the last
    /// applied version so the new copy always wins.
    pub fn next_version(&mut self, kind: ListKind, now: u64) -> u64 {
        let next = match self.versions.get(&kind) {
            Some(last) => now.max(last + 1),
            None => now,
        };
        self.versions.insert(kind, next);
        next
    }
}

/// Membership change between two versions of a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
    pub unchanged: Vec<T>,
}

impl<T: Clone + Eq + Hash> ListDiff<T> {
    pub fn between(old: &[T], new: &[T]) -> Self {
        let mut added = Vec::new();
        let mut unchanged = Vec::new();
        for item in new {
            if old.contains(item) {
                unchanged.push(item.clone());
            } else {
                added.push(item.clone());
            }
        }
        let removed = old.iter().filter(|i| !new.contains(i)).cloned().collect();
        Self {
            added,
            removed,
            unchanged,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
