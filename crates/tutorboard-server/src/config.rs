//! Server configuration from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub reaper_interval_ms: u64,
    /// Where persisted session snapshots go. `None` means the platform data dir.
    pub snapshot_dir: Option<PathBuf>,
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
            snapshot_dir: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

fn parse<T: std::str::FromStr>(
    name: &'static str,
    value: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match value {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

impl ServerConfig {
    /// Read `TUTORBOARD_*` variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let channel_capacity = parse(
            "TUTORBOARD_CHANNEL_CAPACITY",
            lookup("TUTORBOARD_CHANNEL_CAPACITY"),
            defaults.channel_capacity,
        )?;
        if channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                name: "TUTORBOARD_CHANNEL_CAPACITY",
                value: "0".to_string(),
            });
        }
        Ok(Self {
            addr: parse("TUTORBOARD_ADDR", lookup("TUTORBOARD_ADDR"), defaults.addr)?,
            reaper_interval_ms: parse(
                "TUTORBOARD_REAPER_INTERVAL_MS",
                lookup("TUTORBOARD_REAPER_INTERVAL_MS"),
                defaults.reaper_interval_ms,
            )?
            .max(1),
            snapshot_dir: lookup("TUTORBOARD_SNAPSHOT_DIR")
                .filter(|dir| !dir.is_empty())
                .map(PathBuf::from),
            channel_capacity,
        })
    }
}
