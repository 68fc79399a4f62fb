//! One-shot commands that talk to relays on the user's behalf.

use anyhow::{Context, Result};
use nostr::{EventBuilder, Kind, ToBech32};
use nostr_chat::identifier::resolve_identifier;
use nostr_chat::{ListContent, ListKind, ProfileFields, RelayPool, METADATA_KIND};
use serde::Serialize;

use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct ResolveResult {
    input: String,
    pubkey: String,
    npub: String,
    relays: Vec<String>,
}

#[derive(Serialize, Default)]
struct ListsResult {
    contacts: Vec<String>,
    channels: Vec<String>,
    groups: Vec<String>,
    versions: serde_json::Map<String, serde_json::Value>,
}

pub async fn resolve(input: &str, output: &Output) -> Result<()> {
    let resolved = resolve_identifier(&reqwest::Client::new(), input)
        .await
        .with_context(|| format!("Could not resolve {}", input))?;
    output.success(
        "resolve",
        ResolveResult {
            input: input.to_string(),
            pubkey: resolved.pubkey.to_hex(),
            npub: resolved.pubkey.to_bech32().unwrap_or_default(),
            relays: resolved.relays,
        },
    );
    Ok(())
}

/// Fetch and print the contacts, channels and groups lists
pub async fn lists(config: &Config, output: &Output) -> Result<()> {
    let keys = config.keys()?;
    let pool = RelayPool::new(keys.clone(), config.relays.clone());

    let mut result = ListsResult::default();
    for kind in ListKind::ALL {
        let fetched = pool.fetch_list(&keys, kind).await;
        let list = match fetched {
            Ok(Some(list)) => list,
            Ok(None) => continue,
            Err(e) => {
                pool.shutdown().await;
                return Err(e).with_context(|| format!("Failed to fetch {} list", kind.as_str()));
            }
        };
        result
            .versions
            .insert(kind.as_str().to_string(), list.version.into());
        match list.content {
            ListContent::Contacts(pks) => {
                result.contacts = pks
                    .iter()
                    .map(|pk| pk.to_bech32().unwrap_or_else(|_| pk.to_hex()))
                    .collect()
            }
            ListContent::Channels(ids) => result.channels = ids,
            ListContent::Groups(groups) => {
                result.groups = groups.iter().map(|g| g.to_string()).collect()
            }
        }
    }
    pool.shutdown().await;

    output.success("lists", result);
    Ok(())
}

/// Update the stored profile and publish it
pub async fn set_profile(fields: ProfileFields, config: &mut Config, output: &Output) -> Result<()> {
    let keys = config.keys()?;
    let mut profile = config.profile.clone();
    if fields.name.is_some() {
        profile.name = fields.name;
    }
    if fields.display_name.is_some() {
        profile.display_name = fields.display_name;
    }
    if fields.about.is_some() {
        profile.about = fields.about;
    }
    if fields.picture.is_some() {
        profile.picture = fields.picture;
    }

    let event = EventBuilder::new(Kind::from(METADATA_KIND), serde_json::to_string(&profile)?)
        .sign_with_keys(&keys)?;
    let pool = RelayPool::new(keys, config.relays.clone());
    let report = pool.publish(&event, &config.relays).await;
    pool.shutdown().await;
    if !report.accepted() {
        anyhow::bail!("No relay accepted the profile");
    }

    config.profile = profile.clone();
    config.save()?;
    output.success("profile", profile);
    Ok(())
}
