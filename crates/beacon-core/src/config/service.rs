use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{CheckDescriptor, ServiceIdentity};
use crate::error::{BeaconError, Result};

/// Local service registration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique instance id (generated from the name when unset).
    pub id: Option<String>,

    /// Logical service name shared by every cluster member.
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Tags attached to the registration.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Address other members should use to reach this node.
    #[serde(default = "default_address")]
    pub address: String,

    /// Application port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Free-form metadata.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            id: None,
            name: default_service_name(),
            tags: Vec::new(),
            address: default_address(),
            port: default_port(),
            meta: BTreeMap::new(),
        }
    }
}

impl ServiceConfig {
    /// Instance id, falling back to `<name>-<uuid>`.
    pub fn service_id(&self) -> String {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("{}-{}", self.name, Uuid::new_v4()))
    }

    /// Build the validated registration identity.
    pub fn to_identity(&self) -> Result<ServiceIdentity> {
        let mut identity =
            ServiceIdentity::new(self.service_id(), &self.name, &self.address, self.port)?
                .with_tags(self.tags.iter().cloned());
        for (key, value) in &self.meta {
            identity = identity.with_meta(key, value);
        }
        Ok(identity)
    }
}

fn default_service_name() -> String {
    "mycluster".to_string()
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

/// TTL check and heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Check id.
    #[serde(default = "default_check_id")]
    pub id: String,

    /// TTL in seconds.
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Time a check may stay critical before the backend deregisters the
    /// service, in seconds.
    #[serde(default = "default_deregister_after")]
    pub deregister_after_secs: u64,

    /// Heartbeat interval in seconds (defaults to half the TTL).
    pub heartbeat_interval_secs: Option<u64>,

    /// Output text sent with each TTL update.
    #[serde(default = "default_output")]
    pub output: String,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            id: default_check_id(),
            ttl_secs: default_ttl(),
            deregister_after_secs: default_deregister_after(),
            heartbeat_interval_secs: None,
            output: default_output(),
        }
    }
}

impl CheckConfig {
    /// Build the validated check descriptor.
    pub fn to_descriptor(&self) -> Result<CheckDescriptor> {
        CheckDescriptor::new(
            &self.id,
            Duration::from_secs(self.ttl_secs),
            Duration::from_secs(self.deregister_after_secs),
        )
    }

    /// Heartbeat interval, validated to be shorter than the TTL.
    pub fn heartbeat_interval(&self) -> Result<Duration> {
        let ttl = Duration::from_secs(self.ttl_secs);
        let interval = self
            .heartbeat_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(ttl / 2);

        if interval.is_zero() || interval >= ttl {
            return Err(BeaconError::Config(format!(
                "heartbeat interval ({:?}) must be greater than zero and shorter than ttl ({:?})",
                interval, ttl
            )));
        }

        Ok(interval)
    }
}

fn default_check_id() -> String {
    "checkalive".to_string()
}

fn default_ttl() -> u64 {
    10
}

fn default_deregister_after() -> u64 {
    30
}

fn default_output() -> String {
    "online".to_string()
}
