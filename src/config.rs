//! Server configuration, loadable from a TOML file.

use serde::Deserialize;
use smoltcp::time::Duration;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::packet::{DATA_SIZE, MAX_DATA_SIZE};

/// Timing, sizing and filesystem settings for a [`Server`](crate::server::Server).
///
/// Every field has a default, so a config file only lists what it changes:
///
/// ```toml
/// port = 6969
/// root = "/srv/tftp"
/// timeout_ms = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// Well-known listening port (default 69).
    pub port: u16,
    /// Directory all transfers are confined to (default `.`).
    pub root: PathBuf,
    /// Upper bound on one wait for readiness (default 1000).
    pub poll_interval_ms: u64,
    /// Inactivity that counts as one timeout (default 5000).
    pub timeout_ms: u64,
    /// Consecutive timeouts after which a transfer is dropped (default 5).
    pub max_timeouts: u32,
    /// Payload bytes per DATA block; a shorter block ends a transfer (default 512).
    pub block_size: usize,
    /// Concurrent transfers (default 256).
    pub max_sessions: usize,
    /// Inclusive range per-transfer ports are taken from.
    pub port_range: (u16, u16),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 69,
            root: PathBuf::from("."),
            poll_interval_ms: 1000,
            timeout_ms: 5000,
            max_timeouts: 5,
            block_size: DATA_SIZE,
            max_sessions: 256,
            port_range: (49152, 65535),
        }
    }
}

impl Config {
    /// Read a TOML config file. The result still needs [`Config::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 || self.block_size > MAX_DATA_SIZE {
            return Err(Error::Config("block_size must be between 1 and 1428"));
        }
        if self.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be positive"));
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config("timeout_ms must be positive"));
        }
        if self.max_timeouts == 0 {
            return Err(Error::Config("max_timeouts must be positive"));
        }
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be positive"));
        }
        let (first, last) = self.port_range;
        if first == 0 || first > last {
            return Err(Error::Config("port_range is empty"));
        }
        if (first..=last).contains(&self.port) {
            return Err(Error::Config("port_range contains the listening port"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
