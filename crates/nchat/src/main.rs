use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod commands;
mod config;
mod output;

use nostr_chat::ProfileFields;
use output::Output;

#[derive(Parser)]
#[command(name = "nchat")]
#[command(version)]
#[command(about = "Terminal chat over Nostr channels, relay groups and gift-wrapped DMs")]
#[command(long_about = "A terminal chat client for Nostr.\n\nPublic channels (NIP-28), relay-hosted groups (NIP-29) and private direct messages (NIP-17) in one room list, synced across sessions through your relays.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/nchat)
    #[arg(long, global = true, env = "NCHAT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log relay and subscription activity to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Login with a private key
    Login {
        /// Private key (nsec or hex)
        key: String,
    },

    /// Logout and delete conversation logs
    Logout,

    /// Show current identity
    Whoami,

    /// Relay configuration
    #[command(subcommand)]
    Relay(RelayCommands),

    /// Resolve an npub, nprofile, hex key or name@domain
    Resolve {
        identifier: String,
    },

    /// Send a direct message
    Send {
        /// Recipient (npub, hex, nprofile or name@domain)
        recipient: String,
        /// Message content
        message: String,
    },

    /// Show logged history of a room
    History {
        /// Room (#channel, relay'group or person)
        room: String,
        /// Maximum number of messages to show
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },

    /// Show the synced contacts, channels and groups lists
    Lists,

    /// Update and publish profile metadata
    Profile {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        about: Option<String>,
        #[arg(long)]
        picture: Option<String>,
    },

    /// Start an interactive chat session
    Chat,
}

#[derive(Subcommand)]
enum RelayCommands {
    /// List configured relays
    List,
    /// Add a relay
    Add { url: String },
    /// Remove a relay
    Remove { url: String },
}

/// Where conversation logs live under the data directory.
pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let output = Output::new(cli.json);
    init_tracing(cli.verbose);

    let result = run(cli, &output).await;

    if let Err(e) = result {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "nostr_chat=debug,nchat=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory; pass --data-dir"))?
            .join("nchat"),
    };
    std::fs::create_dir_all(&data_dir)?;

    let mut config = config::Config::load(&data_dir)?;

    // Commands that need identity - auto-generate if not logged in
    let needs_identity = matches!(
        &cli.command,
        Commands::Send { .. } | Commands::Lists | Commands::Profile { .. } | Commands::Chat
    );
    if needs_identity {
        let (pubkey, was_generated) = config.ensure_identity()?;
        if was_generated {
            let pk = nostr::PublicKey::from_hex(&pubkey)?;
            let npub = nostr::ToBech32::to_bech32(&pk)?;
            eprintln!("Generated new identity: {}", npub);
        }
    }

    match cli.command {
        Commands::Login { key } => commands::identity::login(&key, &config, output).await,
        Commands::Logout => commands::identity::logout(&data_dir, output).await,
        Commands::Whoami => commands::identity::whoami(&config, output).await,
        Commands::Relay(cmd) => match cmd {
            RelayCommands::List => commands::relays::list(&config, output).await,
            RelayCommands::Add { url } => commands::relays::add(&url, &mut config, output).await,
            RelayCommands::Remove { url } => {
                commands::relays::remove(&url, &mut config, output).await
            }
        },
        Commands::Resolve { identifier } => commands::account::resolve(&identifier, output).await,
        Commands::Send { recipient, message } => {
            commands::message::send(&recipient, &message, &config, &data_dir, output).await
        }
        Commands::History { room, limit } => {
            commands::message::history(&room, limit, &data_dir, output).await
        }
        Commands::Lists => commands::account::lists(&config, output).await,
        Commands::Profile {
            name,
            display_name,
            about,
            picture,
        } => {
            let fields = ProfileFields {
                name,
                display_name,
                about,
                picture,
            };
            if fields == ProfileFields::default() {
                anyhow::bail!("Nothing to update; pass --name, --display-name, --about or --picture");
            }
            commands::account::set_profile(fields, &mut config, output).await
        }
        Commands::Chat => commands::chat::run(&config, &data_dir, output).await,
    }
}
