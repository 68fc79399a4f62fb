//! Three-layer direct-message envelope: unsigned rumor, sender-signed seal,
//! and an ephemeral-key gift wrap with a jittered timestamp.

use crate::types::{GIFT_WRAP_KIND, PRIVATE_MESSAGE_KIND, SEAL_KIND};
use crate::utils::{build_tag, now_seconds, pubkey_from_hex, synthetic_event_id, tag_value};
use crate::{Error, Result};
use nostr::nips::nip44::{self, Version};
use nostr::{Event, EventBuilder, Keys, Kind, PublicKey, Timestamp, UnsignedEvent};
use serde::Deserialize;

/// Seal and wrap timestamps are pushed back by up to this many seconds.
pub const TIMESTAMP_JITTER_SECS: u64 = 2 * 24 * 60 * 60;

/// A direct message ready for publication.
#[derive(Debug, Clone)]
pub struct WrappedMessage {
    /// Envelope addressed to the recipient.
    pub recipient_wrap: Event,
    /// Envelope addressed to ourselves, so the conversation is recoverable from relays.
    pub self_wrap: Event,
    pub timestamp: u64,
    pub event_id: String,
}

/// A received direct message after unwrapping.
#[derive(Debug, Clone, PartialEq)]
pub struct UnwrappedMessage {
    pub sender: PublicKey,
    /// The other party of the conversation. Differs from `sender` for relayed copies of our own messages.
    pub peer: PublicKey,
    pub content: String,
    pub timestamp: u64,
    pub event_id: String,
}

#[derive(Deserialize)]
struct Rumor {
    pubkey: String,
    created_at: u64,
    kind: u16,
    #[serde(default)]
    tags: Vec<Vec<String>>,
    content: String,
}

impl Rumor {
    fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find_map(|t| {
            if t.first().map(|s| s.as_str()) == Some(name) {
                t.get(1).map(|s| s.as_str())
            } else {
                None
            }
        })
    }
}

/// `now` minus a uniform offset in `[0, TIMESTAMP_JITTER_SECS)`.
pub fn randomized_timestamp(now: u64) -> u64 {
    now.saturating_sub(rand::random::<u64>() % TIMESTAMP_JITTER_SECS)
}

pub fn create_rumor(
    sender: &PublicKey,
    recipient: &PublicKey,
    content: &str,
    created_at: u64,
) -> Result<UnsignedEvent> {
    let mut rumor = EventBuilder::new(Kind::from(PRIVATE_MESSAGE_KIND), content)
        .tag(build_tag(&["p", &recipient.to_hex()])?)
        .custom_created_at(Timestamp::from(created_at))
        .build(*sender);
    rumor.ensure_id();
    Ok(rumor)
}

/// Encrypt the rumor to `receiver` and sign the seal with the sender's key.
pub fn seal(rumor: &UnsignedEvent, sender_keys: &Keys, receiver: &PublicKey) -> Result<Event> {
    let rumor_json = serde_json::to_string(rumor)?;
    let encrypted = nip44::encrypt(sender_keys.secret_key(), receiver, rumor_json, Version::V2)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    EventBuilder::new(Kind::from(SEAL_KIND), encrypted)
        .custom_created_at(Timestamp::from(randomized_timestamp(now_seconds())))
        .build(sender_keys.public_key())
        .sign_with_keys(sender_keys)
        .map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// Wrap a seal for `receiver` under a fresh ephemeral key.
pub fn wrap(seal: &Event, receiver: &PublicKey) -> Result<Event> {
    let ephemeral = Keys::generate();
    let seal_json = serde_json::to_string(seal)?;
    let encrypted = nip44::encrypt(ephemeral.secret_key(), receiver, seal_json, Version::V2)
        .map_err(|e| Error::Encryption(e.to_string()))?;

    EventBuilder::new(Kind::from(GIFT_WRAP_KIND), encrypted)
        .tag(build_tag(&["p", &receiver.to_hex()])?)
        .custom_created_at(Timestamp::from(randomized_timestamp(now_seconds())))
        .build(ephemeral.public_key())
        .sign_with_keys(&ephemeral)
        .map_err(|e| Error::InvalidEvent(e.to_string()))
}

/// Build both envelopes for one outgoing message. The rumor and its synthetic id
/// are shared, the seals and wraps are independent.
pub fn wrap_message(
    sender_keys: &Keys,
    recipient: &PublicKey,
    content: &str,
    now: u64,
) -> Result<WrappedMessage> {
    let sender = sender_keys.public_key();
    let rumor = create_rumor(&sender, recipient, content, now)?;

    let recipient_wrap = wrap(&seal(&rumor, sender_keys, recipient)?, recipient)?;
    let self_wrap = wrap(&seal(&rumor, sender_keys, &sender)?, &sender)?;

    Ok(WrappedMessage {
        recipient_wrap,
        self_wrap,
        timestamp: now,
        event_id: synthetic_event_id(&sender, recipient, now, content),
    })
}

/// Open a gift wrap addressed to `keys`.
pub fn unwrap(wrap: &Event, keys: &Keys) -> Result<UnwrappedMessage> {
    if wrap.kind.as_u16() != GIFT_WRAP_KIND {
        return Err(Error::InvalidEvent(format!(
            "expected kind {}, got {}",
            GIFT_WRAP_KIND,
            wrap.kind.as_u16()
        )));
    }
    let me = keys.public_key();
    if let Some(addressed) = tag_value(wrap.tags.iter(), "p") {
        if addressed != me.to_hex() {
            return Err(Error::WrongRecipient);
        }
    }

    let seal_json = nip44::decrypt(keys.secret_key(), &wrap.pubkey, &wrap.content)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    let seal: Event = serde_json::from_str(&seal_json)?;
    seal.verify()
        .map_err(|e| Error::InvalidEvent(format!("seal signature: {}", e)))?;
    if seal.kind.as_u16() != SEAL_KIND {
        return Err(Error::InvalidEvent(format!(
            "expected seal kind {}, got {}",
            SEAL_KIND,
            seal.kind.as_u16()
        )));
    }

    let rumor_json = nip44::decrypt(keys.secret_key(), &seal.pubkey, &seal.content)
        .map_err(|e| Error::Decryption(e.to_string()))?;
    let rumor: Rumor = serde_json::from_str(&rumor_json)?;
    if rumor.kind != PRIVATE_MESSAGE_KIND {
        return Err(Error::InvalidEvent(format!(
            "unexpected rumor kind {}",
            rumor.kind
        )));
    }

    let sender = pubkey_from_hex(&rumor.pubkey)?;
    if sender != seal.pubkey {
        return Err(Error::InvalidEvent(
            "rumor author does not match seal signer".to_string(),
        ));
    }

    let recipient = match rumor.tag_value("p") {
        Some(hex) => pubkey_from_hex(hex)?,
        None if sender != me => me,
        None => {
            return Err(Error::InvalidEvent("own message without recipient".to_string()));
        }
    };
    let peer = if sender == me { recipient } else { sender };

    Ok(UnwrappedMessage {
        event_id: synthetic_event_id(&sender, &recipient, rumor.created_at, &rumor.content),
        sender,
        peer,
        content: rumor.content,
        timestamp: rumor.created_at,
    })
}

/// NIP-44 v2 encryption to our own key.
pub fn encrypt_to_self(keys: &Keys, plaintext: &str) -> Result<String> {
    nip44::encrypt(keys.secret_key(), &keys.public_key(), plaintext, Version::V2)
        .map_err(|e| Error::Encryption(e.to_string()))
}

pub fn decrypt_from_self(keys: &Keys, ciphertext: &str) -> Result<String> {
    nip44::decrypt(keys.secret_key(), &keys.public_key(), ciphertext)
        .map_err(|e| Error::Decryption(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_unwraps_sender_and_plaintext() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let wrapped = wrap_message(&alice, &bob.public_key(), "hello", 1_700_000_000).unwrap();
        let opened = unwrap(&wrapped.recipient_wrap, &bob).unwrap();

        assert_eq!(opened.sender, alice.public_key());
        assert_eq!(opened.peer, alice.public_key());
        assert_eq!(opened.content, "hello");
        assert_eq!(opened.timestamp, 1_700_000_000);
    }

    #[test]
    fn self_copy_resolves_peer_from_recipient_tag() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let wrapped = wrap_message(&alice, &bob.public_key(), "hello", 1_700_000_000).unwrap();
        let opened = unwrap(&wrapped.self_wrap, &alice).unwrap();

        assert_eq!(opened.sender, alice.public_key());
        assert_eq!(opened.peer, bob.public_key());
        assert_eq!(opened.event_id, wrapped.event_id);
    }

    #[test]
    fn both_sides_derive_the_same_id() {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let wrapped = wrap_message(&alice, &bob.public_key(), "same", 1_700_000_000).unwrap();
        let at_bob = unwrap(&wrapped.recipient_wrap, &bob).unwrap();
        let at_alice = unwrap(&wrapped.self_wrap, &alice).unwrap();
        assert_eq!(at_bob.event_id, at_alice.event_id);
        assert_eq!(at_bob.event_id, wrapped.event_id);
        assert_eq!(at_bob.peer, alice.public_key());
        assert_eq!(at_alice.peer, bob.public_key());
    }

    #[test]
    fn outer_layer_hides_sender_and_time() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let now = 1_700_000_000;

        let wrapped = wrap_message(&alice, &bob.public_key(), "hi", now).unwrap();
        let outer = &wrapped.recipient_wrap;
        assert_ne!(outer.pubkey, alice.public_key());
        assert_ne!(outer.pubkey, wrapped.self_wrap.pubkey);
        assert_eq!(outer.kind.as_u16(), GIFT_WRAP_KIND);
        assert_eq!(
            tag_value(outer.tags.iter(), "p"),
            Some(bob.public_key().to_hex().as_str())
        );
        let ts = outer.created_at.as_u64();
        let real_now = now_seconds();
        assert!(ts <= real_now && ts > real_now - TIMESTAMP_JITTER_SECS - 60);
    }

    #[test]
    fn wrong_recipient_is_rejected() {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let wrapped = wrap_message(&alice, &bob.public_key(), "secret", 1_700_000_000).unwrap();
        assert!(matches!(
            unwrap(&wrapped.recipient_wrap, &eve),
            Err(Error::WrongRecipient)
        ));
    }

    #[test]
    fn non_wrap_kind_is_rejected() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::from(1u16), "plain")
            .build(keys.public_key())
            .sign_with_keys(&keys)
            .unwrap();
        assert!(matches!(unwrap(&event, &keys), Err(Error::InvalidEvent(_))));
    }

    #[test]
    fn self_encryption_roundtrip() {
        let keys = Keys::generate();
        let plaintext = r#"[["p","abc"]] with unicode ✓"#;
        let ciphertext = encrypt_to_self(&keys, plaintext).unwrap();
        assert_ne!(ciphertext, plaintext);
        assert_eq!(decrypt_from_self(&keys, &ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn jitter_stays_in_window() {
        let now = 1_700_000_000;
        for _ in 0..200 {
            let ts = randomized_timestamp(now);
            assert!(ts <= now);
            assert!(now - ts < TIMESTAMP_JITTER_SECS);
        }
    }
}
