use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{BeaconError, Result};

/// Identity under which the local process registers with the discovery backend.
///
/// Built once at startup and never modified; the registration manager owns it
/// for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    service_id: String,
    service_name: String,
    tags: BTreeSet<String>,
    address: String,
    port: u16,
    metadata: BTreeMap<String, String>,
}

impl ServiceIdentity {
    /// Create a new identity. Fails if the id or name is blank.
    pub fn new(
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
    ) -> Result<Self> {
        let service_id = service_id.into();
        let service_name = service_name.into();

        if service_id.trim().is_empty() {
            return Err(BeaconError::Config("service id must not be empty".into()));
        }
        if service_name.trim().is_empty() {
            return Err(BeaconError::Config("service name must not be empty".into()));
        }

        Ok(Self {
            service_id,
            service_name,
            tags: BTreeSet::new(),
            address: address.into(),
            port,
            metadata: BTreeMap::new(),
        })
    }

    /// Add tags to the identity.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Add a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

impl std::fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) at {}:{}",
            self.service_id, self.service_name, self.address, self.port
        )
    }
}

/// TTL health check registered alongside the service.
///
/// `deregister_after` must be strictly longer than `ttl`, otherwise the
/// backend could reap a node whose check only just went critical.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckDescriptor {
    check_id: String,
    ttl: Duration,
    deregister_after: Duration,
}

impl CheckDescriptor {
    /// Create a validated check descriptor.
    pub fn new(check_id: impl Into<String>, ttl: Duration, deregister_after: Duration) -> Result<Self> {
        let check_id = check_id.into();

        if check_id.trim().is_empty() {
            return Err(BeaconError::Config("check id must not be empty".into()));
        }
        if ttl.is_zero() {
            return Err(BeaconError::Config("check ttl must be greater than zero".into()));
        }
        if deregister_after <= ttl {
            return Err(BeaconError::Config(format!(
                "deregister_after ({:?}) must be greater than ttl ({:?})",
                deregister_after, ttl
            )));
        }

        Ok(Self {
            check_id,
            ttl,
            deregister_after,
        })
    }

    pub fn check_id(&self) -> &str {
        &self.check_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn deregister_after(&self) -> Duration {
        self.deregister_after
    }

    /// Recommended heartbeat interval: half the TTL, so one missed tick
    /// does not expire the check.
    pub fn recommended_interval(&self) -> Duration {
        self.ttl / 2
    }
}
