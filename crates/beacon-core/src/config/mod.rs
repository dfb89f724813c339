mod discovery;
mod observability;
mod service;

pub use discovery::DiscoveryConfig;
pub use observability::{LoggingConfig, ObservabilityConfig};
pub use service::{CheckConfig, ServiceConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{BeaconError, Result};

/// Root configuration for beacon.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BeaconConfig {
    /// Local service registration.
    #[serde(default)]
    pub service: ServiceConfig,

    /// TTL check and heartbeat.
    #[serde(default)]
    pub check: CheckConfig,

    /// Discovery backend.
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl BeaconConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| BeaconError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        // Substitute environment variables
        let content = substitute_env_vars(content);

        toml::from_str(&content)
            .map_err(|e| BeaconError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Check every cross-field constraint without touching the backend.
    pub fn validate(&self) -> Result<()> {
        self.service.to_identity()?;
        self.check.to_descriptor()?;
        self.check.heartbeat_interval()?;

        if self.discovery.wait_secs == 0 {
            return Err(BeaconError::Config(
                "discovery.wait_secs must be greater than zero".into(),
            ));
        }
        if self.discovery.backoff_base_ms == 0
            || self.discovery.backoff_max_ms < self.discovery.backoff_base_ms
        {
            return Err(BeaconError::Config(
                "discovery backoff must satisfy 0 < backoff_base_ms <= backoff_max_ms".into(),
            ));
        }

        Ok(())
    }

    /// Name of the service whose members are watched.
    pub fn watch_service(&self) -> &str {
        self.discovery
            .watch_service
            .as_deref()
            .unwrap_or(&self.service.name)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}.
fn substitute_env_vars(content: &str) -> String {
    let mut result = content.to_string();
    let Ok(re) = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") else {
        return result;
    };

    for cap in re.captures_iter(content) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}
