//! Configuration system for the Parlor client.
//!
//! Supports layered configuration with the following priority (highest
//! first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/parlor/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::liveness::LivenessConfig;
use crate::reconnect::ReconnectPolicy;

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

    /// A configured URL is not parseable.
    #[error("invalid {field} url: {source}")]
    InvalidUrl {
        /// Which setting was malformed.
        field: &'static str,
        /// Underlying parse error.
        source: url::ParseError,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    session: SessionFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    ws_url: Option<String>,
    api_url: Option<String>,
    user_id: Option<String>,
    token: Option<String>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    heartbeat_interval_secs: Option<u64>,
    max_silence_secs: Option<u64>,
    connect_timeout_secs: Option<u64>,
    backoff_base_ms: Option<u64>,
    backoff_growth: Option<f64>,
    backoff_cap_ms: Option<u64>,
    channel_capacity: Option<usize>,
    pending_retention_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Session tuning knobs (used by the driver task).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Heartbeat emission / staleness timing.
    pub liveness: LivenessConfig,
    /// Guard on how long a connect attempt may take before the reconnect
    /// path is forced.
    pub connect_timeout: Duration,
    /// Backoff parameters for reconnection.
    pub backoff: ReconnectPolicy,
    /// Capacity of the command and inbound event channels.
    pub channel_capacity: usize,
    /// How long resolved reconciliation-table entries are retained.
    pub pending_retention: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            liveness: LivenessConfig::default(),
            connect_timeout: Duration::from_secs(10),
            backoff: ReconnectPolicy::default(),
            channel_capacity: 256,
            pending_retention: Duration::from_secs(300),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint of the chat server.
    pub ws_url: Option<String>,
    /// Base URL of the HTTP history/roster API.
    pub api_url: Option<String>,
    /// Local user identity.
    pub user_id: Option<String>,
    /// Bearer credential presented at connection open.
    pub token: Option<String>,
    /// Session tuning.
    pub session: SessionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_url: None,
            api_url: None,
            user_id: None,
            token: None,
            session: SessionConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/parlor/config.toml`) is tried and
    /// silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read or
    /// parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. Separated from `load()` to enable
    /// unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = SessionConfig::default();

        let liveness = {
            let emit = file
                .session
                .heartbeat_interval_secs
                .map_or(defaults.liveness.emit_interval, Duration::from_secs);
            let max_silence = file
                .session
                .max_silence_secs
                .map_or_else(|| emit * 3, Duration::from_secs);
            LivenessConfig {
                emit_interval: emit,
                max_silence,
            }
        };

        let backoff = ReconnectPolicy {
            base: file
                .session
                .backoff_base_ms
                .map_or(defaults.backoff.base, Duration::from_millis),
            growth: file.session.backoff_growth.unwrap_or(defaults.backoff.growth),
            cap: file
                .session
                .backoff_cap_ms
                .map_or(defaults.backoff.cap, Duration::from_millis),
        };

        Self {
            ws_url: cli.ws_url.clone().or_else(|| file.server.ws_url.clone()),
            api_url: cli.api_url.clone().or_else(|| file.server.api_url.clone()),
            user_id: cli.user_id.clone().or_else(|| file.server.user_id.clone()),
            token: cli.token.clone().or_else(|| file.server.token.clone()),
            session: SessionConfig {
                liveness,
                connect_timeout: file
                    .session
                    .connect_timeout_secs
                    .map_or(defaults.connect_timeout, Duration::from_secs),
                backoff,
                channel_capacity: file
                    .session
                    .channel_capacity
                    .unwrap_or(defaults.channel_capacity),
                pending_retention: file
                    .session
                    .pending_retention_secs
                    .map_or(defaults.pending_retention, Duration::from_secs),
            },
        }
    }

    /// Parse the configured WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] when the setting is present but
    /// malformed. `Ok(None)` means the endpoint is simply unset.
    pub fn ws_endpoint(&self) -> Result<Option<Url>, ConfigError> {
        self.ws_url
            .as_deref()
            .map(|raw| {
                raw.parse().map_err(|source| ConfigError::InvalidUrl {
                    field: "server.ws_url",
                    source,
                })
            })
            .transpose()
    }

    /// Parse the configured HTTP API base URL.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] when the setting is present but
    /// malformed.
    pub fn api_endpoint(&self) -> Result<Option<Url>, ConfigError> {
        self.api_url
            .as_deref()
            .map(|raw| {
                raw.parse().map_err(|source| ConfigError::InvalidUrl {
                    field: "server.api_url",
                    source,
                })
            })
            .transpose()
    }
}

/// CLI arguments parsed by clap.
///
/// Environment variables are supported via `env` attributes so the binary
/// can be configured without flags in containerized deployments.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Realtime chat client")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "PARLOR_WS_URL")]
    pub ws_url: Option<String>,

    /// Base URL of the HTTP history API.
    #[arg(long, env = "PARLOR_API_URL")]
    pub api_url: Option<String>,

    /// Local user identity.
    #[arg(long, env = "PARLOR_USER_ID")]
    pub user_id: Option<String>,

    /// Bearer token presented at connection open.
    #[arg(long, env = "PARLOR_TOKEN")]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/parlor/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PARLOR_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/parlor.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and a missing
/// file is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir available — use defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("parlor").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
