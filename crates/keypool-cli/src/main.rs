//! keypool CLI - manage a pool of rotating API keys
//!
//! All commands work on a data directory holding `vault.json`,
//! `pool.json` and `settings.json`. Every process pointed at the same
//! directory shares the pool and its health state.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use keypool_core::FileCredentialStore;

mod commands;

/// keypool - API key rotation with health tracking and per-key rate limits
#[derive(Parser, Debug)]
#[command(name = "keypool")]
#[command(version)]
#[command(about = "Manage pooled API keys and inspect rotation health")]
struct Args {
    /// Data directory (defaults to the platform data dir)
    #[arg(long, global = true, env = "KEYPOOL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Vault passphrase; prompted for when absent
    #[arg(long, global = true, env = "KEYPOOL_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the vault in the data directory
    Init,

    /// Add a key to the pool (the key is read from a prompt unless --key is given)
    Add {
        #[arg(long)]
        label: String,
        #[arg(long, default_value = "openai")]
        provider: String,
        /// Lower values rotate first
        #[arg(long, default_value_t = 0)]
        priority: u32,
        /// Requests per minute (defaults to the configured default)
        #[arg(long)]
        rpm: Option<u32>,
        #[arg(long, env = "KEYPOOL_NEW_KEY", hide_env_values = true)]
        key: Option<String>,
    },

    /// List keys in rotation order
    List,

    /// Show per-key health, including the fallback key
    Health {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Clear a key's error streak and cooldown, re-enabling it
    Reset { id: Uuid },

    /// Put a key back into rotation
    Enable { id: Uuid },

    /// Take a key out of rotation
    Disable { id: Uuid },

    /// Delete a key from the pool
    Remove { id: Uuid },

    /// Change a key's rotation priority
    Priority { id: Uuid, priority: u32 },

    /// Change a key's requests-per-minute limit
    Rpm { id: Uuid, limit: u32 },

    /// Replace a key's value, keeping its history
    Replace {
        id: Uuid,
        #[arg(long, env = "KEYPOOL_NEW_KEY", hide_env_values = true)]
        key: Option<String>,
    },

    /// Run the selection algorithm and print which keys would be served
    Acquire {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },

    /// Show or change pool settings
    Settings {
        #[arg(long)]
        cooldown_secs: Option<u64>,
        #[arg(long)]
        disable_threshold: Option<u32>,
        #[arg(long)]
        refresh_interval_secs: Option<u64>,
        #[arg(long)]
        default_rpm: Option<u32>,
        #[arg(long)]
        fallback_env: Option<String>,
        /// Restore defaults
        #[arg(long, conflicts_with_all = ["cooldown_secs", "disable_threshold", "refresh_interval_secs", "default_rpm", "fallback_env"])]
        reset: bool,
    },

    /// Change the vault passphrase and reseal every key
    Passwd,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let data_dir = match args.data_dir {
        Some(dir) => dir,
        None => FileCredentialStore::default_dir()?,
    };

    commands::run(args.command, data_dir, args.passphrase).await
}
