//! Configuration for the `msgsync` engine and CLI.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/msgsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::{Path, PathBuf};
use std::time::Duration;

use msgsync_proto::message::SenderId;

use crate::engine::EngineConfig;
use crate::reconcile::DEFAULT_MATCH_WINDOW_MS;
use crate::sync::RetryPolicy;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    sync: SyncFileConfig,
    reconcile: ReconcileFileConfig,
    storage: StorageFileConfig,
    session: SessionFileConfig,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    max_retries: Option<u32>,
    base_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    send_timeout_secs: Option<u64>,
    reconnect_debounce_ms: Option<u64>,
}

/// `[reconcile]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconcileFileConfig {
    match_window_ms: Option<u64>,
}

/// `[storage]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct StorageFileConfig {
    db_path: Option<PathBuf>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    sender_id: Option<String>,
    channel_capacity: Option<usize>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Session --
    /// Local author identity.
    pub sender_id: Option<String>,
    /// Channel capacity for the engine command channel.
    pub channel_capacity: usize,

    // -- Sync --
    /// Failed attempts after which a queued message is abandoned.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on any retry delay.
    pub max_backoff: Duration,
    /// Timeout for a single remote send.
    pub send_timeout: Duration,
    /// How long connectivity must hold before a reconnect sync.
    pub reconnect_debounce: Duration,

    // -- Reconcile --
    /// Fuzzy match window in milliseconds.
    pub match_window_ms: u64,

    // -- Storage --
    /// SQLite database path.
    pub db_path: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            sender_id: None,
            channel_capacity: 256,
            max_retries: retry.max_retries,
            base_backoff: retry.base_backoff,
            max_backoff: retry.max_backoff,
            send_timeout: Duration::from_secs(10),
            reconnect_debounce: Duration::from_millis(500),
            match_window_ms: DEFAULT_MATCH_WINDOW_MS,
            db_path: default_db_path(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise the default path (`~/.config/msgsync/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a config file cannot be read or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            sender_id: cli
                .sender_id
                .clone()
                .or_else(|| file.session.sender_id.clone()),
            channel_capacity: file
                .session
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            max_retries: file.sync.max_retries.unwrap_or(defaults.max_retries),
            base_backoff: file
                .sync
                .base_backoff_ms
                .map_or(defaults.base_backoff, Duration::from_millis),
            max_backoff: file
                .sync
                .max_backoff_ms
                .map_or(defaults.max_backoff, Duration::from_millis),
            send_timeout: file
                .sync
                .send_timeout_secs
                .map_or(defaults.send_timeout, Duration::from_secs),
            reconnect_debounce: file
                .sync
                .reconnect_debounce_ms
                .map_or(defaults.reconnect_debounce, Duration::from_millis),
            match_window_ms: file
                .reconcile
                .match_window_ms
                .unwrap_or(defaults.match_window_ms),
            db_path: cli
                .db_path
                .clone()
                .or_else(|| file.storage.db_path.clone())
                .unwrap_or(defaults.db_path),
        }
    }

    /// The retry policy described by this configuration.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
        }
    }

    /// Build an [`EngineConfig`], if a sender identity is configured.
    #[must_use]
    pub fn to_engine_config(&self) -> Option<EngineConfig> {
        let sender_id = self.sender_id.clone().filter(|s| !s.is_empty())?;
        Some(EngineConfig {
            sender_id: SenderId::new(sender_id),
            retry: self.retry_policy(),
            send_timeout: self.send_timeout,
            match_window_ms: self.match_window_ms,
            reconnect_debounce: self.reconnect_debounce,
            channel_capacity: self.channel_capacity,
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Offline-first message synchronization engine")]
pub struct CliArgs {
    /// Path to config file (default: `~/.config/msgsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Local author identity.
    #[arg(long, env = "MSGSYNC_SENDER_ID")]
    pub sender_id: Option<String>,

    /// SQLite database path.
    #[arg(long, env = "MSGSYNC_DB")]
    pub db_path: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "MSGSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/msgsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print machine-readable JSON instead of text.
    #[arg(long, global = true)]
    pub json: bool,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// `msgsync` subcommands.
#[derive(clap::Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Show cached messages of a conversation, newest first.
    History {
        /// Conversation id.
        conversation: String,
        /// Maximum number of messages.
        #[arg(long, default_value_t = 50)]
        limit: usize,
        /// Messages to skip.
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show the Offline Queue in drain order.
    Queue {
        /// Restrict to one conversation.
        #[arg(long)]
        conversation: Option<String>,
    },
    /// Run an offline-then-online session against an in-process store.
    Demo,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("msgsync")
        .join("msgsync.db")
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ConfigFile::default());
        };
        config_dir.join("msgsync").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
