//! Parsing room references typed by the user.
//!
//! - `#<64 hex>` or bare 64 hex: channel
//! - `relay'group-id` (optionally `~`-prefixed, relay scheme optional): group
//! - `@...`, `npub1...`, `nprofile1...`, `nostr:...`, `name@domain`: direct message

use anyhow::{Context, Result};
use nostr_chat::identifier::{parse_identifier, resolve_identifier, Identifier};
use nostr_chat::utils::is_hex_pubkey;
use nostr_chat::{GroupKey, RoomRef};

use crate::config::normalize_relay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomTarget {
    Channel(String),
    Group(GroupKey),
    /// Anything the identifier resolver accepts
    Person(String),
}

pub fn parse_room_target(input: &str) -> Result<RoomTarget> {
    let input = input.trim();
    if input.is_empty() {
        anyhow::bail!("Empty room reference");
    }

    if let Some(id) = input.strip_prefix('#') {
        let id = id.to_lowercase();
        if !is_hex_pubkey(&id) {
            anyhow::bail!("Channel id must be 64 hex characters: {}", id);
        }
        return Ok(RoomTarget::Channel(id));
    }
    if let Some(person) = input.strip_prefix('@') {
        return Ok(RoomTarget::Person(person.to_string()));
    }

    let group_input = input.strip_prefix('~').unwrap_or(input);
    if let Some((relay, id)) = group_input.rsplit_once('\'') {
        if id.is_empty() {
            anyhow::bail!("Missing group id in {}", input);
        }
        return Ok(RoomTarget::Group(GroupKey::new(normalize_relay(relay)?, id)));
    }

    if is_hex_pubkey(input) {
        return Ok(RoomTarget::Channel(input.to_lowercase()));
    }
    Ok(RoomTarget::Person(input.to_string()))
}

/// Resolve a target to a room, looking up NIP-05 names over the network.
pub async fn resolve_room(target: RoomTarget, http: &reqwest::Client) -> Result<RoomRef> {
    Ok(match target {
        RoomTarget::Channel(id) => RoomRef::Channel(id),
        RoomTarget::Group(group) => RoomRef::Group(group),
        RoomTarget::Person(who) => {
            let resolved = resolve_identifier(http, &who)
                .await
                .with_context(|| format!("Could not resolve {}", who))?;
            RoomRef::Direct(resolved.pubkey)
        }
    })
}

/// Resolve without network access; NIP-05 names yield `None`.
pub fn resolve_room_offline(target: &RoomTarget) -> Result<Option<RoomRef>> {
    Ok(match target {
        RoomTarget::Channel(id) => Some(RoomRef::Channel(id.clone())),
        RoomTarget::Group(group) => Some(RoomRef::Group(group.clone())),
        RoomTarget::Person(who) => match parse_identifier(who)? {
            Identifier::PublicKey { pubkey, .. } => Some(RoomRef::Direct(pubkey)),
            Identifier::Nip05 { .. } => None,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::ToBech32;

    #[test]
    fn test_channel_forms() {
        let id = "AB".repeat(32);
        assert_eq!(
            parse_room_target(&format!("#{}", id)).unwrap(),
            RoomTarget::Channel(id.to_lowercase())
        );
        assert_eq!(
            parse_room_target(&"cd".repeat(32)).unwrap(),
            RoomTarget::Channel("cd".repeat(32))
        );
        assert!(parse_room_target("#nothex").is_err());
    }

    #[test]
    fn test_group_forms() {
        let expected = RoomTarget::Group(GroupKey::new("wss://groups.example.com", "pizza"));
        assert_eq!(parse_room_target("wss://groups.example.com'pizza").unwrap(), expected);
        assert_eq!(parse_room_target("~groups.example.com'pizza").unwrap(), expected);
        assert!(parse_room_target("groups.example.com'").is_err());
    }

    #[test]
    fn test_person_forms() {
        let pk = nostr::Keys::generate().public_key();
        let npub = pk.to_bech32().unwrap();
        assert_eq!(parse_room_target(&npub).unwrap(), RoomTarget::Person(npub.clone()));
        assert_eq!(
            parse_room_target(&format!("@{}", pk.to_hex())).unwrap(),
            RoomTarget::Person(pk.to_hex())
        );

        let offline = resolve_room_offline(&parse_room_target(&npub).unwrap()).unwrap();
        assert_eq!(offline, Some(RoomRef::Direct(pk)));
        let nip05 = resolve_room_offline(&parse_room_target("bob@example.com").unwrap()).unwrap();
        assert_eq!(nip05, None);
    }
}
