//! Configuration types and constants for the relay server.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::sweeper::SweeperConfig;

pub(crate) const DEFAULT_BIND: &str = "127.0.0.1:5000";
pub(crate) const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub(crate) const DEFAULT_CLEANUP_TIMEOUT_SECS: u64 = 30;
/// Largest audio upload accepted by `POST /api/messages/send`.
pub const DEFAULT_MAX_AUDIO_BYTES: usize = 10 * 1024 * 1024; // 10 MiB
pub(crate) const DB_FILE: &str = "sevo.db";
pub(crate) const UPLOADS_DIR: &str = "uploads";
/// Header carrying the authenticated caller, set by the upstream gateway.
pub const USER_HEADER: &str = "x-user-id";
pub(crate) const MAX_WS_CONNECTIONS: usize = 4096;

/// Ephemeral voice-message relay.
///
/// Configuration can be set via CLI arguments or environment variables.
/// CLI arguments take precedence over environment variables.
#[derive(Parser, Debug, Default)]
#[command(name = "sevo-server", version, about)]
pub struct Cli {
    /// HTTP server bind address [env: SEVO_BIND] [default: 127.0.0.1:5000]
    #[arg(long, short = 'b')]
    pub bind: Option<String>,

    /// Data directory for the database and uploads [env: SEVO_HOME] [default: ~/.sevo]
    #[arg(long, short = 'd')]
    pub data_dir: Option<PathBuf>,

    /// Public base URL used to build audio links [env: SEVO_PUBLIC_URL] [default: http://<bind>]
    #[arg(long)]
    pub public_url: Option<String>,

    /// Seconds between expiry sweeps, 0 disables [env: SEVO_SWEEP_INTERVAL_SECS] [default: 60]
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Per-message cleanup timeout in seconds [env: SEVO_CLEANUP_TIMEOUT_SECS] [default: 30]
    #[arg(long)]
    pub cleanup_timeout_secs: Option<u64>,

    /// Maximum audio upload size in bytes [env: SEVO_MAX_AUDIO_BYTES] [default: 10485760]
    #[arg(long)]
    pub max_audio_bytes: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub public_url: String,
    pub sweep_interval: Duration,
    pub cleanup_timeout: Duration,
    pub max_audio_bytes: usize,
}

impl Config {
    pub fn from_cli_and_env(cli: Cli) -> Self {
        Self::from_cli_and_lookup(cli, |key| std::env::var(key).ok())
    }

    /// Resolve against an arbitrary variable source.  Unparseable numeric
    /// values fall through to the default.
    pub fn from_cli_and_lookup(cli: Cli, env: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = cli
            .data_dir
            .or_else(|| env("SEVO_HOME").map(PathBuf::from))
            .unwrap_or_else(|| {
                env("HOME")
                    .map(|h| PathBuf::from(h).join(".sevo"))
                    .unwrap_or_else(|| PathBuf::from(".sevo"))
            });

        let bind_addr = cli
            .bind
            .or_else(|| env("SEVO_BIND"))
            .unwrap_or_else(|| DEFAULT_BIND.to_string());

        let public_url = cli
            .public_url
            .or_else(|| env("SEVO_PUBLIC_URL"))
            .unwrap_or_else(|| format!("http://{bind_addr}"))
            .trim_end_matches('/')
            .to_string();

        let sweep_interval_secs = cli
            .sweep_interval_secs
            .or_else(|| env("SEVO_SWEEP_INTERVAL_SECS").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        let cleanup_timeout_secs = cli
            .cleanup_timeout_secs
            .or_else(|| env("SEVO_CLEANUP_TIMEOUT_SECS").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_CLEANUP_TIMEOUT_SECS);

        let max_audio_bytes = cli
            .max_audio_bytes
            .or_else(|| env("SEVO_MAX_AUDIO_BYTES").and_then(|v| v.parse().ok()))
            .unwrap_or(DEFAULT_MAX_AUDIO_BYTES);

        Self {
            bind_addr,
            data_dir,
            public_url,
            sweep_interval: Duration::from_secs(sweep_interval_secs),
            cleanup_timeout: Duration::from_secs(cleanup_timeout_secs),
            max_audio_bytes,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join(UPLOADS_DIR)
    }

    pub fn sweeper(&self) -> SweeperConfig {
        SweeperConfig {
            interval: self.sweep_interval,
            cleanup_timeout: self.cleanup_timeout,
        }
    }
}
