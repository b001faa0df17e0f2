//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

fn default_path() -> PathBuf {
    PathBuf::from("./data")
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_max_batch_size() -> usize {
    100
}

/// `[persistence]` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Store retained messages and durable sessions on disk
    pub enabled: bool,

    /// Data directory of the fjall keyspace
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// Flush interval (e.g., "100ms", "1s")
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Pending operations that force a write before the interval
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_path(),
            flush_interval: default_flush_interval(),
            max_batch_size: default_max_batch_size(),
        }
    }
}
