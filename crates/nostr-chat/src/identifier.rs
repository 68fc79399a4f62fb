//! Turning user-supplied identifiers into public keys.
//!
//! Accepted forms:
//! - `npub1...` and `nprofile1...`, optionally behind `nostr:` or a URL fragment
//! - 64-character hex
//! - NIP-05 `name@domain` (bare `domain` means `_@domain`)

use crate::utils::{is_hex_pubkey, pubkey_from_hex};
use crate::{Error, Result};
use nostr::nips::nip19::{FromBech32, Nip19};
use nostr::PublicKey;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

const NIP05_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identifier {
    PublicKey {
        pubkey: PublicKey,
        relays: Vec<String>,
    },
    Nip05 {
        name: String,
        domain: String,
    },
}

/// A resolved identifier with any relay hints it carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub pubkey: PublicKey,
    pub relays: Vec<String>,
}

fn first_token(s: &str) -> &str {
    s.split(&['/', '?', '&'][..]).next().unwrap_or(s)
}

fn extract_nip19_candidate(input: &str) -> Option<&str> {
    let without_scheme = input.strip_prefix("nostr:").unwrap_or(input).trim();
    let looks_like_nip19 = |s: &str| s.starts_with("npub1") || s.starts_with("nprofile1");

    let candidate = without_scheme.trim_start_matches('/');
    if looks_like_nip19(candidate) {
        return Some(first_token(candidate));
    }

    if let Some((_, fragment)) = without_scheme.rsplit_once('#') {
        let fragment = fragment.trim().trim_start_matches('/');
        if looks_like_nip19(fragment) {
            return Some(first_token(fragment));
        }
    }
    None
}

fn looks_like_domain(s: &str) -> bool {
    s.contains('.')
        && !s.starts_with('.')
        && !s.ends_with('.')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

/// Classify `input` without any network access.
pub fn parse_identifier(input: &str) -> Result<Identifier> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidIdentifier("empty identifier".to_string()));
    }

    if let Some(candidate) = extract_nip19_candidate(trimmed) {
        return match Nip19::from_bech32(candidate)
            .map_err(|e| Error::InvalidIdentifier(e.to_string()))?
        {
            Nip19::Pubkey(pubkey) => Ok(Identifier::PublicKey {
                pubkey,
                relays: Vec::new(),
            }),
            Nip19::Profile(profile) => Ok(Identifier::PublicKey {
                pubkey: profile.public_key,
                relays: profile.relays.iter().map(|r| r.to_string()).collect(),
            }),
            _ => Err(Error::InvalidIdentifier(format!(
                "not a public key: {}",
                candidate
            ))),
        };
    }

    if is_hex_pubkey(trimmed) {
        return Ok(Identifier::PublicKey {
            pubkey: pubkey_from_hex(trimmed)?,
            relays: Vec::new(),
        });
    }

    let (name, domain) = match trimmed.split_once('@') {
        Some((name, domain)) => (if name.is_empty() { "_" } else { name }, domain),
        None => ("_", trimmed),
    };
    if looks_like_domain(domain) && !name.contains(char::is_whitespace) {
        return Ok(Identifier::Nip05 {
            name: name.to_lowercase(),
            domain: domain.to_lowercase(),
        });
    }

    Err(Error::InvalidIdentifier(trimmed.to_string()))
}

#[derive(Deserialize)]
struct Nip05Document {
    #[serde(default)]
    names: HashMap<String, String>,
    #[serde(default)]
    relays: HashMap<String, Vec<String>>,
}

/// Look up `name@domain` via `https://domain/.well-known/nostr.json`.
pub async fn lookup_nip05(http: &reqwest::Client, name: &str, domain: &str) -> Result<Resolved> {
    let url = format!("https://{}/.well-known/nostr.json", domain);
    let document: Nip05Document = http
        .get(&url)
        .query(&[("name", name)])
        .timeout(NIP05_TIMEOUT)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| Error::InvalidIdentifier(format!("{}@{}: {}", name, domain, e)))?
        .json()
        .await
        .map_err(|e| Error::InvalidIdentifier(format!("{}@{}: {}", name, domain, e)))?;

    resolve_from_document(&document, name, domain)
}

fn resolve_from_document(document: &Nip05Document, name: &str, domain: &str) -> Result<Resolved> {
    let hex = document
        .names
        .get(name)
        .ok_or_else(|| Error::InvalidIdentifier(format!("{}@{} not found", name, domain)))?;
    let pubkey = pubkey_from_hex(hex)?;
    let relays = document
        .relays
        .get(hex)
        .cloned()
        .unwrap_or_default();
    Ok(Resolved { pubkey, relays })
}

/// Resolve any supported identifier, hitting the network only for NIP-05.
pub async fn resolve_identifier(http: &reqwest::Client, input: &str) -> Result<Resolved> {
    match parse_identifier(input)? {
        Identifier::PublicKey { pubkey, relays } => Ok(Resolved { pubkey, relays }),
        Identifier::Nip05 { name, domain } => lookup_nip05(http, &name, &domain).await,
    }
}
