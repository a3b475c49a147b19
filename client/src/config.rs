//! Configuration management for the sync runtime.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Which cross-instance transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPreference {
    /// Live channel when a hub is available, storage otherwise
    #[default]
    Auto,
    Channel,
    Storage,
}

impl FromStr for TransportPreference {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "channel" => Ok(Self::Channel),
            "storage" => Ok(Self::Storage),
            _ => Err(()),
        }
    }
}

/// Sync runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the remote authority
    pub remote_url: Option<String>,
    /// Directory for file-backed durable storage (in-memory when unset)
    pub storage_dir: Option<PathBuf>,
    /// How often file-backed storage looks for writes by other processes
    pub storage_poll: Duration,
    /// Quiet period before local edits are reconciled
    pub debounce: Duration,
    /// Keepalive period (`None` disables it)
    pub keepalive: Option<Duration>,
    /// Upper bound on one remote exchange
    pub timeout: Duration,
    /// Consecutive conflict re-submissions before giving up until the next trigger
    pub max_conflict_rounds: u32,
    /// Cross-instance transport
    pub transport: TransportPreference,
    /// Fetch the remote snapshot at startup
    pub sync_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            remote_url: None,
            storage_dir: None,
            storage_poll: Duration::from_millis(500),
            debounce: Duration::from_millis(1000),
            keepalive: Some(Duration::from_secs(30)),
            timeout: Duration::from_millis(5000),
            max_conflict_rounds: tally_engine::DEFAULT_MAX_CONFLICT_ROUNDS,
            transport: TransportPreference::Auto,
            sync_on_start: true,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let remote_url = lookup("TALLY_REMOTE_URL").filter(|url| !url.trim().is_empty());
        let storage_dir = lookup("TALLY_STORAGE_DIR").map(PathBuf::from);

        let storage_poll = match lookup("TALLY_STORAGE_POLL_MS") {
            Some(raw) => match parse::<u64>("TALLY_STORAGE_POLL_MS", &raw)? {
                0 => return Err(invalid("TALLY_STORAGE_POLL_MS", &raw)),
                ms => Duration::from_millis(ms),
            },
            None => defaults.storage_poll,
        };

        let debounce = match lookup("TALLY_SYNC_DEBOUNCE_MS") {
            Some(raw) => Duration::from_millis(parse("TALLY_SYNC_DEBOUNCE_MS", &raw)?),
            None => defaults.debounce,
        };

        let keepalive = match lookup("TALLY_SYNC_KEEPALIVE_SECS") {
            Some(raw) => match parse::<u64>("TALLY_SYNC_KEEPALIVE_SECS", &raw)? {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            None => defaults.keepalive,
        };

        let timeout = match lookup("TALLY_SYNC_TIMEOUT_MS") {
            Some(raw) => match parse::<u64>("TALLY_SYNC_TIMEOUT_MS", &raw)? {
                0 => return Err(invalid("TALLY_SYNC_TIMEOUT_MS", &raw)),
                ms => Duration::from_millis(ms),
            },
            None => defaults.timeout,
        };

        let max_conflict_rounds = match lookup("TALLY_SYNC_MAX_CONFLICT_ROUNDS") {
            Some(raw) => parse("TALLY_SYNC_MAX_CONFLICT_ROUNDS", &raw)?,
            None => defaults.max_conflict_rounds,
        };

        let transport = match lookup("TALLY_SYNC_TRANSPORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| invalid("TALLY_SYNC_TRANSPORT", &raw))?,
            None => defaults.transport,
        };

        let sync_on_start = match lookup("TALLY_SYNC_ON_START") {
            Some(raw) => parse("TALLY_SYNC_ON_START", &raw)?,
            None => defaults.sync_on_start,
        };

        Ok(Self {
            remote_url,
            storage_dir,
            storage_poll,
            debounce,
            keepalive,
            timeout,
            max_conflict_rounds,
            transport,
            sync_on_start,
        })
    }

    /// Remote URL, required by the binary.
    pub fn require_remote_url(&self) -> Result<&str, ConfigError> {
        self.remote_url
            .as_deref()
            .ok_or(ConfigError::MissingRemoteUrl)
    }
}

fn parse<T: FromStr>(var: &'static str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| invalid(var, raw))
}

fn invalid(var: &'static str, raw: &str) -> ConfigError {
    ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("TALLY_REMOTE_URL environment variable is required")]
    MissingRemoteUrl,

    #[error("Invalid {var} value: {value:?}")]
    InvalidValue { var: &'static str, value: String },
}
