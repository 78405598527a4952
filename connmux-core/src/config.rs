//! Engine configuration: defaults, optional TOML file, environment overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine limits and timeouts. File: ~/.config/connmux/config.toml or /etc/connmux/config.toml.
/// Env overrides: CONNMUX_CONNECT_TIMEOUT_MS, CONNMUX_TRANSFER_TIMEOUT_MS,
/// CONNMUX_MAX_IDLE_CONNECTIONS, CONNMUX_MAX_IDLE_AGE_MS, CONNMUX_MAX_CONNECTIONS_PER_KEY.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Time allowed for a new connection to become writable (default 30000 ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Whole-transfer timeout applied when the transfer sets none; 0 disables it.
    #[serde(default)]
    pub transfer_timeout_ms: u64,
    /// Idle connections kept for reuse (default 32). The least recently used goes first.
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    /// Idle connections older than this are closed (default 118000 ms, 0 = no limit).
    /// The scheduler's timeout covers the oldest idle connection's expiry.
    #[serde(default = "default_max_idle_age_ms")]
    pub max_idle_age_ms: u64,
    /// Live connections per identity key; 0 = unlimited. Extra transfers queue.
    #[serde(default)]
    pub max_connections_per_key: usize,
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}
fn default_max_idle_connections() -> usize {
    32
}
fn default_max_idle_age_ms() -> u64 {
    118_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            transfer_timeout_ms: 0,
            max_idle_connections: default_max_idle_connections(),
            max_idle_age_ms: default_max_idle_age_ms(),
            max_connections_per_key: 0,
        }
    }
}

impl EngineConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Option<Duration> {
        non_zero_ms(self.transfer_timeout_ms)
    }

    pub fn max_idle_age(&self) -> Option<Duration> {
        non_zero_ms(self.max_idle_age_ms)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let s = std::fs::read_to_string(path)?;
        Self::from_toml_str(&s)
    }

    /// Apply env overrides through `lookup`. Invalid values are errors.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_CONNECT_TIMEOUT_MS) {
            self.connect_timeout_ms = parse_env(ENV_CONNECT_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_TRANSFER_TIMEOUT_MS) {
            self.transfer_timeout_ms = parse_env(ENV_TRANSFER_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_IDLE_CONNECTIONS) {
            self.max_idle_connections = parse_env(ENV_MAX_IDLE_CONNECTIONS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_IDLE_AGE_MS) {
            self.max_idle_age_ms = parse_env(ENV_MAX_IDLE_AGE_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_MAX_CONNECTIONS_PER_KEY) {
            self.max_connections_per_key = parse_env(ENV_MAX_CONNECTIONS_PER_KEY, &v)?;
        }
        Ok(())
    }

    /// Strict load: first config file found (if any), then process env.
    pub fn try_load() -> Result<Self, ConfigError> {
        let mut c = match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => Self::from_file(&p)?,
            None => Self::default(),
        };
        c.apply_env(|k| std::env::var(k).ok())?;
        Ok(c)
    }

    /// Lenient load: unreadable file or bad env values fall back to defaults.
    pub fn load() -> Self {
        match Self::try_load() {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(error = %e, "config load failed, using defaults");
                Self::default()
            }
        }
    }
}

const ENV_CONNECT_TIMEOUT_MS: &str = "CONNMUX_CONNECT_TIMEOUT_MS";
const ENV_TRANSFER_TIMEOUT_MS: &str = "CONNMUX_TRANSFER_TIMEOUT_MS";
const ENV_MAX_IDLE_CONNECTIONS: &str = "CONNMUX_MAX_IDLE_CONNECTIONS";
const ENV_MAX_IDLE_AGE_MS: &str = "CONNMUX_MAX_IDLE_AGE_MS";
const ENV_MAX_CONNECTIONS_PER_KEY: &str = "CONNMUX_MAX_CONNECTIONS_PER_KEY";

fn non_zero_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Env {
        var,
        value: value.to_string(),
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/connmux/config.toml"));
    }
    out.push(PathBuf::from("/etc/connmux/config.toml"));
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
}
