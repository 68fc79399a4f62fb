use anyhow::Result;
use serde::Serialize;

use crate::config::Config;
use crate::output::Output;

#[derive(Serialize)]
struct RelayList {
    relays: Vec<String>,
}

pub async fn list(config: &Config, output: &Output) -> Result<()> {
    output.success(
        "relay.list",
        RelayList {
            relays: config.relays.clone(),
        },
    );
    Ok(())
}

pub async fn add(url: &str, config: &mut Config, output: &Output) -> Result<()> {
    if config.add_relay(url)? {
        output.success_message("relay.add", &format!("Added {}", url));
    } else {
        output.success_message("relay.add", &format!("{} already configured", url));
    }
    Ok(())
}

pub async fn remove(url: &str, config: &mut Config, output: &Output) -> Result<()> {
    if !config.remove_relay(url)? {
        anyhow::bail!("{} is not configured", url);
    }
    if config.relays.is_empty() {
        eprintln!("Warning: no relays left; add one with `nchat relay add`");
    }
    output.success_message("relay.remove", &format!("Removed {}", url));
    Ok(())
}
