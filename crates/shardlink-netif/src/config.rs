//! Network interface configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pool::PoolConfig;
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, HEADER_SIZE};

/// Settings for a [`NetworkInterface`](crate::interface::NetworkInterface).
///
/// Every field has a default, so a config file only needs the fields it
/// overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkInterfaceConfig {
    /// Worker threads of the reactor runtime.
    pub reactor_threads: usize,
    /// Time allowed for one TCP connect.
    pub connect_timeout_ms: u64,
    /// Time an operation may wait for a connection lease.
    pub lease_timeout_ms: u64,
    /// Largest frame accepted or sent, header included.
    pub max_message_size: usize,
    /// Leased connections allowed per host.
    pub max_connections_per_host: usize,
    /// Pooled connections idle longer than this are closed.
    pub idle_timeout_secs: u64,
    /// Whether to set `TCP_NODELAY`.
    pub nodelay: bool,
    /// Whether new connections must authenticate before their first command.
    pub auth_enabled: bool,
    /// Timeout applied to requests that carry none.
    pub default_command_timeout_ms: Option<u64>,
    /// How long shutdown waits for reactor tasks to stop.
    pub shutdown_timeout_ms: u64,
}

impl Default for NetworkInterfaceConfig {
    fn default() -> Self {
        Self {
            reactor_threads: 1,
            connect_timeout_ms: 5000,
            lease_timeout_ms: 10_000,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_connections_per_host: 8,
            idle_timeout_secs: 300,
            nodelay: true,
            auth_enabled: false,
            default_command_timeout_ms: None,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl NetworkInterfaceConfig {
    /// Loads a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NetworkInterfaceConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => return Err(ConfigError::UnsupportedExtension(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the interface cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason: &str| {
            Err(ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            })
        };
        if self.reactor_threads == 0 {
            return invalid("reactor_threads", "must be at least 1");
        }
        if self.max_connections_per_host == 0 {
            return invalid("max_connections_per_host", "must be at least 1");
        }
        if self.max_message_size < HEADER_SIZE || self.max_message_size > i32::MAX as usize {
            return invalid(
                "max_message_size",
                "must hold a message header and fit a 32-bit length",
            );
        }
        if self.connect_timeout_ms == 0 {
            return invalid("connect_timeout_ms", "must be non-zero");
        }
        if self.lease_timeout_ms == 0 {
            return invalid("lease_timeout_ms", "must be non-zero");
        }
        if self.default_command_timeout_ms == Some(0) {
            return invalid("default_command_timeout_ms", "must be non-zero when set");
        }
        Ok(())
    }

    /// Lease acquisition timeout.
    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    /// Default command timeout.
    pub fn default_command_timeout(&self) -> Option<Duration> {
        self.default_command_timeout_ms.map(Duration::from_millis)
    }

    /// Shutdown grace period.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Settings for the bundled TCP pool.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections_per_host: self.max_connections_per_host,
            max_idle_per_host: self.max_connections_per_host,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            nodelay: self.nodelay,
        }
    }
}
