use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Discovery backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Backend HTTP address.
    #[serde(default = "default_address")]
    pub address: String,

    /// ACL token sent with every request.
    pub token: Option<String>,

    /// Datacenter to query (backend default when unset).
    pub datacenter: Option<String>,

    /// Service whose membership is watched (defaults to the local service name).
    pub watch_service: Option<String>,

    /// Only watch members carrying this tag.
    pub watch_tag: Option<String>,

    /// Maximum time a blocking query may be held by the backend, in seconds.
    #[serde(default = "default_wait")]
    pub wait_secs: u64,

    /// Timeout for non-blocking calls (register, update, deregister), in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// First retry delay after a failed watch cycle, in milliseconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Retry delay ceiling, in milliseconds.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,

    /// How long to wait for the loops to stop on shutdown, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            token: None,
            datacenter: None,
            watch_service: None,
            watch_tag: None,
            wait_secs: default_wait(),
            request_timeout_secs: default_request_timeout(),
            backoff_base_ms: default_backoff_base(),
            backoff_max_ms: default_backoff_max(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl DiscoveryConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Token with empty values (e.g. an unset `${VAR}`) treated as absent.
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty() && !t.starts_with("${"))
    }
}

fn default_address() -> String {
    "http://127.0.0.1:8500".to_string()
}

fn default_wait() -> u64 {
    300
}

fn default_request_timeout() -> u64 {
    10
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_max() -> u64 {
    30_000
}

fn default_shutdown_timeout() -> u64 {
    5
}
