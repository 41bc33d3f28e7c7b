//! Client configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Configuration for the client-side transaction machinery.
///
/// The ping period must stay strictly below the server-side lease timeout,
/// otherwise participants abort transactions between renewals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Delay between ping rounds, in milliseconds.
    pub ping_period_ms: u64,

    /// Transaction timeout requested from participants, in milliseconds.
    pub default_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ping_period_ms: 5_000,
            default_timeout_ms: 15_000,
        }
    }
}

impl ClientConfig {
    /// Configuration for testing (fast pings, short leases).
    pub fn testing() -> Self {
        Self {
            ping_period_ms: 50,
            default_timeout_ms: 200,
        }
    }

    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration as TOML.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.ping_period_ms >= self.default_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "ping period {}ms must be below the transaction timeout {}ms",
                self.ping_period_ms, self.default_timeout_ms
            )));
        }
        Ok(())
    }
}
