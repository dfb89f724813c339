use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::member::HealthStatus;

/// A raw service entry as returned by a health-filtered blocking query.
///
/// Mirrors the `{Node, Service, Checks}` shape of a Consul health entry;
/// unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServiceEntry {
    pub node: EntryNode,
    pub service: EntryService,
    #[serde(default)]
    pub checks: Vec<EntryCheck>,
}

/// Node the service instance runs on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntryNode {
    pub node: String,
    pub address: String,
}

/// Service registration as seen by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntryService {
    #[serde(rename = "ID")]
    pub id: String,
    pub service: String,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub meta: Option<BTreeMap<String, String>>,
}

/// One health check attached to the entry (node-level or service-level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EntryCheck {
    #[serde(rename = "CheckID")]
    pub check_id: String,
    pub status: String,
    #[serde(default, rename = "ServiceID")]
    pub service_id: String,
    #[serde(default)]
    pub output: String,
}

impl ServiceEntry {
    /// Build an entry with a single service-level check.
    pub fn new(
        node: impl Into<String>,
        service_id: impl Into<String>,
        service: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        status: HealthStatus,
    ) -> Self {
        let service_id = service_id.into();
        let address = address.into();
        Self {
            node: EntryNode {
                node: node.into(),
                address: address.clone(),
            },
            checks: vec![EntryCheck {
                check_id: format!("service:{}", service_id),
                status: status.as_str().to_string(),
                service_id: service_id.clone(),
                output: String::new(),
            }],
            service: EntryService {
                id: service_id,
                service: service.into(),
                tags: None,
                address,
                port,
                meta: None,
            },
        }
    }

    /// Attach tags to the service.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.service.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Attach a metadata pair to the service.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.service
            .meta
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Worst status across every check attached to the entry.
    pub fn aggregated_health(&self) -> HealthStatus {
        HealthStatus::aggregate(
            self.checks
                .iter()
                .map(|c| HealthStatus::from_str(&c.status)),
        )
    }

    /// Address to reach the service on: the service address, or the node
    /// address when the service did not register one.
    pub fn effective_address(&self) -> &str {
        if self.service.address.is_empty() {
            &self.node.address
        } else {
            &self.service.address
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONSUL_PAYLOAD: &str = r#"[
        {
            "Node": {"ID": "a1", "Node": "node-1", "Address": "10.0.0.1", "Datacenter": "dc1"},
            "Service": {
                "ID": "login_service",
                "Service": "mycluster",
                "Tags": ["login"],
                "Address": "",
                "Meta": {"version": "1"},
                "Port": 3000,
                "EnableTagOverride": false
            },
            "Checks": [
                {"Node": "node-1", "CheckID": "serfHealth", "Status": "passing", "ServiceID": ""},
                {"Node": "node-1", "CheckID": "checkalive", "Status": "warning", "ServiceID": "login_service"}
            ]
        }
    ]"#;

    #[test]
    fn test_decode_consul_payload() {
        let entries: Vec<ServiceEntry> = serde_json::from_str(CONSUL_PAYLOAD).unwrap();
        assert_eq!(entries.len(), 1);

        let entry = &entries[0];
        assert_eq!(entry.service.id, "login_service");
        assert_eq!(entry.service.tags.as_deref(), Some(&["login".to_string()][..]));
        assert_eq!(entry.effective_address(), "10.0.0.1");
        assert_eq!(entry.aggregated_health(), HealthStatus::Warning);
    }

    #[test]
    fn test_decode_null_tags_and_meta() {
        let payload = r#"{
            "Node": {"Node": "n", "Address": "10.0.0.2"},
            "Service": {"ID": "s", "Service": "mycluster", "Tags": null, "Meta": null, "Port": 80, "Address": "10.0.0.9"}
        }"#;
        let entry: ServiceEntry = serde_json::from_str(payload).unwrap();
        assert!(entry.service.tags.is_none());
        assert!(entry.checks.is_empty());
        assert_eq!(entry.aggregated_health(), HealthStatus::Passing);
        assert_eq!(entry.effective_address(), "10.0.0.9");
    }

    #[test]
    fn test_builder_helpers() {
        let entry = ServiceEntry::new("n1", "svc-1", "mycluster", "10.0.0.3", 3000, HealthStatus::Critical)
            .with_tags(["a"])
            .with_meta("zone", "eu");
        assert_eq!(entry.aggregated_health(), HealthStatus::Critical);
        assert_eq!(entry.service.meta.unwrap().get("zone").unwrap(), "eu");
    }
}
