//! Configuration system for the Parley client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/parley/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use parley_proto::ids::UserId;

use crate::chat::outbox::OutboxConfig;
use crate::connection::ConnectionConfig;
use crate::directory::DEFAULT_HTTP_TIMEOUT;
use crate::session::SessionConfig;

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

    /// The server URL is not a `ws://` or `wss://` URL.
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl {
        /// The configured value.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A setting has a value the client cannot run with.
    #[error("invalid value for `{key}`: {reason}")]
    Invalid {
        /// Config file key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },

    /// A required setting has no value from any layer.
    #[error("missing required setting `{0}` (pass --{0} or set it in the config file)")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    connection: ConnectionFileConfig,
    delivery: DeliveryFileConfig,
    ui: UiFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    api_url: Option<String>,
    user_id: Option<String>,
    http_timeout_secs: Option<u64>,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    connect_timeout_secs: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    forced_reconnect_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
}

/// `[delivery]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DeliveryFileConfig {
    ack_timeout_secs: Option<u64>,
    ack_retries: Option<u32>,
    tick_interval_ms: Option<u64>,
    data_dir: Option<PathBuf>,
}

/// `[ui]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct UiFileConfig {
    notifications: Option<bool>,
    preview_chars: Option<usize>,
    seed_directory: Option<bool>,
    timestamp_format: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Server --
    /// WebSocket URL of the chat server.
    pub server_url: Option<String>,
    /// Base URL of the HTTP API (directory, history, persistence).
    pub api_url: Option<String>,
    /// Local user id.
    pub user_id: Option<String>,
    /// Per-request HTTP timeout.
    pub http_timeout: Duration,

    // -- Connection --
    /// Per-attempt connect timeout.
    pub connect_timeout: Duration,
    /// Fixed delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Delay before the immediate retry after a server-forced close.
    pub forced_reconnect_delay: Duration,
    /// Reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,

    // -- Delivery --
    /// Ack wait timeout.
    pub ack_timeout: Duration,
    /// Retransmissions per connection before an overdue notice.
    pub ack_retries: u32,
    /// Session tick interval.
    pub tick_interval: Duration,
    /// Directory for the conversation snapshot. `None` uses the platform
    /// data directory.
    pub data_dir: Option<PathBuf>,

    // -- UI --
    /// Whether inbound messages raise terminal notifications.
    pub notifications: bool,
    /// Characters shown in notification previews.
    pub preview_chars: usize,
    /// Pre-populate conversations from the directory at startup.
    pub seed_directory: bool,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            api_url: None,
            user_id: None,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(2),
            forced_reconnect_delay: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            ack_timeout: Duration::from_secs(10),
            ack_retries: 3,
            tick_interval: Duration::from_secs(1),
            data_dir: None,
            notifications: true,
            preview_chars: 80,
            seed_directory: true,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed, or if a resolved value is unusable.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would only fail once the client is running.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] for a zero tick interval or a timestamp
    /// format chrono cannot render.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "tick_interval_ms",
                reason: "must be greater than zero".into(),
            });
        }
        if StrftimeItems::new(&self.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::Invalid {
                key: "timestamp_format",
                reason: format!("{:?} is not a valid strftime format", self.timestamp_format),
            });
        }
        Ok(())
    }

    /// Priority: CLI > file > default. Kept apart from `load()` so it can be
    /// tested without CLI parsing.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.server.url.clone()),
            api_url: cli
                .api_url
                .clone()
                .or_else(|| file.server.api_url.clone()),
            user_id: cli
                .user_id
                .clone()
                .or_else(|| file.server.user_id.clone()),
            http_timeout: file
                .server
                .http_timeout_secs
                .map_or(defaults.http_timeout, Duration::from_secs),
            connect_timeout: file
                .connection
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            reconnect_delay: file
                .connection
                .reconnect_delay_ms
                .map_or(defaults.reconnect_delay, Duration::from_millis),
            forced_reconnect_delay: file
                .connection
                .forced_reconnect_delay_ms
                .map_or(defaults.forced_reconnect_delay, Duration::from_millis),
            max_reconnect_attempts: file
                .connection
                .max_reconnect_attempts
                .unwrap_or(defaults.max_reconnect_attempts),
            ack_timeout: file
                .delivery
                .ack_timeout_secs
                .map_or(defaults.ack_timeout, Duration::from_secs),
            ack_retries: file.delivery.ack_retries.unwrap_or(defaults.ack_retries),
            tick_interval: file
                .delivery
                .tick_interval_ms
                .map_or(defaults.tick_interval, Duration::from_millis),
            data_dir: cli
                .data_dir
                .clone()
                .or_else(|| file.delivery.data_dir.clone()),
            notifications: !cli.no_notifications
                && file.ui.notifications.unwrap_or(defaults.notifications),
            preview_chars: file.ui.preview_chars.unwrap_or(defaults.preview_chars),
            seed_directory: file.ui.seed_directory.unwrap_or(defaults.seed_directory),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| file.ui.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Local identity.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if no user id was configured.
    pub fn local_user(&self) -> Result<UserId, ConfigError> {
        self.user_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(UserId::new)
            .ok_or(ConfigError::Missing("user-id"))
    }

    /// Build a [`ConnectionConfig`] from this configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if the server URL or user id is absent,
    /// [`ConfigError::InvalidUrl`] if the server URL is not a WebSocket URL.
    pub fn to_connection_config(&self) -> Result<ConnectionConfig, ConfigError> {
        let url = self
            .server_url
            .clone()
            .ok_or(ConfigError::Missing("server-url"))?;
        validate_ws_url(&url)?;
        Ok(ConnectionConfig {
            connect_timeout: self.connect_timeout,
            reconnect_delay: self.reconnect_delay,
            forced_reconnect_delay: self.forced_reconnect_delay,
            max_reconnect_attempts: self.max_reconnect_attempts,
            ..ConnectionConfig::new(url, self.local_user()?)
        })
    }

    /// Build a [`SessionConfig`] from this configuration.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if the user id is absent,
    /// [`ConfigError::Invalid`] if the tick interval is zero.
    pub fn to_session_config(&self) -> Result<SessionConfig, ConfigError> {
        self.validate()?;
        Ok(SessionConfig {
            outbox: OutboxConfig {
                ack_timeout: self.ack_timeout,
                ack_retries: self.ack_retries,
            },
            tick_interval: self.tick_interval,
            preview_chars: self.preview_chars,
            seed_directory: self.seed_directory,
            ..SessionConfig::new(self.local_user()?)
        })
    }

    /// HTTP API base URL.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] if no API URL was configured.
    pub fn api_url(&self) -> Result<&str, ConfigError> {
        self.api_url
            .as_deref()
            .ok_or(ConfigError::Missing("api-url"))
    }

    /// Directory holding the conversation snapshot.
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("parley")
        })
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Real-time chat client with delivery tracking")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "PARLEY_SERVER_URL")]
    pub server_url: Option<String>,

    /// Base URL of the HTTP API.
    #[arg(long, env = "PARLEY_API_URL")]
    pub api_url: Option<String>,

    /// Your user id.
    #[arg(long, env = "PARLEY_USER_ID")]
    pub user_id: Option<String>,

    /// Path to config file (default: `~/.config/parley/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Directory for the local conversation snapshot.
    #[arg(long, env = "PARLEY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Disable terminal notifications.
    #[arg(long)]
    pub no_notifications: bool,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PARLEY_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/parley.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn validate_ws_url(raw: &str) -> Result<(), ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };
    let parsed = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(invalid(format!("unsupported scheme {other:?}"))),
    }
}

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
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
        config_dir.join("parley").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
