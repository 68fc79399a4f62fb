use anyhow::{Context, Result};
use nostr_chat::{ChatConfig, ProfileFields, DEFAULT_MAX_MESSAGES_PER_ROOM};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// CLI configuration, stored as `config.json` in the data directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// User's private key (hex encoded)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Relays used for channels, lists and direct messages
    #[serde(default = "default_relays")]
    pub relays: Vec<String>,

    /// In-memory history kept per room
    #[serde(default = "default_max_messages")]
    pub max_messages_per_room: usize,

    /// Profile published with `nchat profile`
    #[serde(default)]
    pub profile: ProfileFields,

    /// Path to the config file
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.primal.net".to_string(),
        "wss://relay.snort.social".to_string(),
    ]
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES_PER_ROOM
}

impl Default for Config {
    fn default() -> Self {
        Self {
            private_key: None,
            relays: default_relays(),
            max_messages_per_room: default_max_messages(),
            profile: ProfileFields::default(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Load config from the data directory
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.json");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            let mut config: Config = serde_json::from_str(&content)
                .context("Failed to parse config file")?;
            config.path = config_path;
            Ok(config)
        } else {
            Ok(Config {
                path: config_path,
                ..Default::default()
            })
        }
    }

    /// Save config to disk
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;
        std::fs::write(&self.path, content)
            .context("Failed to write config file")?;
        Ok(())
    }

    pub fn set_private_key(&mut self, key: &str) -> Result<()> {
        self.private_key = Some(key.to_string());
        self.save()
    }

    pub fn clear_private_key(&mut self) -> Result<()> {
        self.private_key = None;
        self.save()
    }

    pub fn is_logged_in(&self) -> bool {
        self.private_key.is_some()
    }

    /// Generate and save a key when none is configured. Returns the public key
    /// hex and whether it was just generated.
    pub fn ensure_identity(&mut self) -> Result<(String, bool)> {
        if self.is_logged_in() {
            return Ok((self.public_key()?, false));
        }
        let keys = nostr::Keys::generate();
        self.set_private_key(&keys.secret_key().to_secret_hex())?;
        Ok((keys.public_key().to_hex(), true))
    }

    pub fn keys(&self) -> Result<nostr::Keys> {
        let key = self.private_key.as_ref().context("Not logged in")?;
        let bytes = hex::decode(key).context("Invalid private key format")?;
        let sk = nostr::SecretKey::from_slice(&bytes).context("Invalid private key")?;
        Ok(nostr::Keys::new(sk))
    }

    /// Get the public key (hex)
    pub fn public_key(&self) -> Result<String> {
        Ok(self.keys()?.public_key().to_hex())
    }

    pub fn add_relay(&mut self, url: &str) -> Result<bool> {
        let url = normalize_relay(url)?;
        if self.relays.contains(&url) {
            return Ok(false);
        }
        self.relays.push(url);
        self.save()?;
        Ok(true)
    }

    pub fn remove_relay(&mut self, url: &str) -> Result<bool> {
        let url = normalize_relay(url)?;
        let before = self.relays.len();
        self.relays.retain(|r| r != &url);
        if self.relays.len() == before {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    pub fn chat_config(&self) -> ChatConfig {
        ChatConfig {
            relays: self.relays.clone(),
            max_messages_per_room: self.max_messages_per_room,
            profile: self.profile.clone(),
        }
    }
}

/// Accept `relay.example.com` as shorthand for `wss://relay.example.com`.
pub fn normalize_relay(url: &str) -> Result<String> {
    let url = url.trim().trim_end_matches('/');
    if url.is_empty() {
        anyhow::bail!("Empty relay URL");
    }
    if url.starts_with("wss://") || url.starts_with("ws://") {
        Ok(url.to_string())
    } else if url.contains("://") {
        anyhow::bail!("Relay URL must use ws:// or wss://: {}", url)
    } else {
        Ok(format!("wss://{}", url))
    }
}
