//! Configuration management for the fieldsync server

use serde::Deserialize;
use std::env;
use std::str::FromStr;

use crate::sync::{PullLimits, SyncLimits};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub max_payload_bytes: usize,
    pub max_batch_deltas: usize,
    pub default_pull_limit: usize,
    pub max_pull_limit: usize,
    pub sweep_enabled: bool,
    pub sweep_interval_secs: u64,
    /// Age before a pending batch is swept; keep above the longest push
    pub sweep_grace_secs: i64,
}

/// A variable was set to something that does not parse
#[derive(Debug, thiserror::Error)]
#[error("invalid value for {name}: {value:?}")]
pub struct ConfigError {
    pub name: &'static str,
    pub value: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            database: DatabaseConfig {
                url: "sqlite:./fieldsync.db".to_string(),
                max_connections: 5,
            },
            sync: SyncConfig::default(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let limits = SyncLimits::default();
        let pull = PullLimits::default();
        SyncConfig {
            max_payload_bytes: limits.max_payload_bytes,
            max_batch_deltas: limits.max_batch_deltas,
            default_pull_limit: pull.default_limit,
            max_pull_limit: pull.max_limit,
            sweep_enabled: false,
            sweep_interval_secs: 300,
            sweep_grace_secs: 600,
        }
    }
}

impl SyncConfig {
    pub fn limits(&self) -> SyncLimits {
        SyncLimits {
            max_payload_bytes: self.max_payload_bytes,
            max_batch_deltas: self.max_batch_deltas,
        }
    }

    pub fn pull_limits(&self) -> PullLimits {
        PullLimits {
            default_limit: self.default_pull_limit,
            max_limit: self.max_pull_limit,
        }
    }
}

impl Config {
    /// Read configuration from the environment
    ///
    /// Unset variables take their defaults. Set but malformed ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let sync = defaults.sync;

        Ok(Config {
            server: ServerConfig {
                host: lookup("SERVER_HOST").unwrap_or(defaults.server.host),
                port: parse_var(&lookup, "SERVER_PORT", defaults.server.port)?,
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: parse_var(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            sync: SyncConfig {
                max_payload_bytes: parse_var(
                    &lookup,
                    "SYNC_MAX_PAYLOAD_BYTES",
                    sync.max_payload_bytes,
                )?,
                max_batch_deltas: parse_var(&lookup, "SYNC_MAX_BATCH_DELTAS", sync.max_batch_deltas)?,
                default_pull_limit: parse_var(
                    &lookup,
                    "SYNC_DEFAULT_PULL_LIMIT",
                    sync.default_pull_limit,
                )?,
                max_pull_limit: parse_var(&lookup, "SYNC_MAX_PULL_LIMIT", sync.max_pull_limit)?,
                sweep_enabled: parse_var(&lookup, "SYNC_SWEEP_ENABLED", sync.sweep_enabled)?,
                sweep_interval_secs: parse_var(
                    &lookup,
                    "SYNC_SWEEP_INTERVAL_SECS",
                    sync.sweep_interval_secs,
                )?,
                sweep_grace_secs: parse_var(&lookup, "SYNC_SWEEP_GRACE_SECS", sync.sweep_grace_secs)?,
            },
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError { name, value }),
        None => Ok(default),
    }
}
