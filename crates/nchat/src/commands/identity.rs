use anyhow::{Context, Result};
use nostr::ToBech32;
use serde::Serialize;
use std::path::Path;

use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct LoginResult {
    pubkey: String,
    npub: String,
}

#[derive(Serialize)]
struct WhoamiResult {
    pubkey: String,
    npub: String,
    logged_in: bool,
    relays: Vec<String>,
}

/// Login with a private key (nsec or hex)
pub async fn login(key: &str, config: &Config, output: &Output) -> Result<()> {
    let hex_key = if key.starts_with("nsec1") {
        use nostr::nips::nip19::FromBech32;
        let sk = nostr::SecretKey::from_bech32(key).context("Invalid nsec key")?;
        hex::encode(sk.to_secret_bytes())
    } else {
        if key.len() != 64 {
            anyhow::bail!("Invalid key length. Expected 64 hex characters or nsec.");
        }
        hex::decode(key).context("Invalid hex key")?;
        key.to_string()
    };

    let sk = nostr::SecretKey::from_slice(&hex::decode(&hex_key)?).context("Invalid secret key")?;
    let pubkey = nostr::Keys::new(sk).public_key();

    let mut config = config.clone();
    config.set_private_key(&hex_key)?;

    output.success(
        "login",
        LoginResult {
            pubkey: pubkey.to_hex(),
            npub: pubkey.to_bech32().unwrap_or_default(),
        },
    );
    Ok(())
}

/// Forget the key and delete conversation logs
pub async fn logout(data_dir: &Path, output: &Output) -> Result<()> {
    let mut config = Config::load(data_dir)?;
    config.clear_private_key()?;

    let logs = crate::logs_dir(data_dir);
    if logs.exists() {
        std::fs::remove_dir_all(&logs).context("Failed to delete conversation logs")?;
    }

    output.success_message("logout", "Logged out and cleared all data");
    Ok(())
}

/// Show current identity
pub async fn whoami(config: &Config, output: &Output) -> Result<()> {
    if !config.is_logged_in() {
        output.success(
            "whoami",
            WhoamiResult {
                pubkey: String::new(),
                npub: String::new(),
                logged_in: false,
                relays: config.relays.clone(),
            },
        );
        return Ok(());
    }

    let pk = config.keys()?.public_key();
    output.success(
        "whoami",
        WhoamiResult {
            pubkey: pk.to_hex(),
            npub: pk.to_bech32().unwrap_or_default(),
            logged_in: true,
            relays: config.relays.clone(),
        },
    );
    Ok(())
}
