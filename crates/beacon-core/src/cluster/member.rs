use std::collections::{BTreeMap, BTreeSet};

use super::entry::ServiceEntry;

/// Health status of a check or member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    /// All checks passing.
    Passing,
    /// At least one check is warning.
    Warning,
    /// At least one check is failing.
    Critical,
}

impl HealthStatus {
    /// Convert to the backend's wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    /// Parse from string. Anything unrecognised (including maintenance)
    /// counts as critical.
    pub fn from_str(s: &str) -> Self {
        match s {
            "passing" => Self::Passing,
            "warning" => Self::Warning,
            _ => Self::Critical,
        }
    }

    /// Combine several statuses: the worst one wins. No checks means passing.
    pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> Self {
        statuses.into_iter().max().unwrap_or(Self::Passing)
    }

    pub fn is_passing(&self) -> bool {
        matches!(self, Self::Passing)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A healthy member of the watched service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberEntry {
    pub service_id: String,
    pub node_name: String,
    pub node_address: String,
    pub node_port: u16,
    pub service_tags: BTreeSet<String>,
    pub service_meta: BTreeMap<String, String>,
    pub health: HealthStatus,
}

impl MemberEntry {
    /// Map a raw entry into a member. Returns `None` unless the entry's
    /// aggregate health is passing.
    pub fn from_passing(entry: &ServiceEntry) -> Option<Self> {
        let health = entry.aggregated_health();
        if !health.is_passing() {
            return None;
        }

        Some(Self {
            service_id: entry.service.id.clone(),
            node_name: entry.node.node.clone(),
            node_address: entry.effective_address().to_string(),
            node_port: entry.service.port,
            service_tags: entry.service.tags.iter().flatten().cloned().collect(),
            service_meta: entry.service.meta.clone().unwrap_or_default(),
            health,
        })
    }

    /// `address:port` of the member.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.node_address, self.node_port)
    }
}

/// Immutable snapshot of the healthy members of a service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipView {
    members: Vec<MemberEntry>,
    as_of_index: u64,
}

impl MembershipView {
    /// Build a snapshot. Members are sorted into a stable order so two views
    /// of the same membership compare equal regardless of backend ordering.
    pub fn new(mut members: Vec<MemberEntry>, as_of_index: u64) -> Self {
        members.sort_by(|a, b| {
            (&a.node_address, a.node_port, &a.service_id).cmp(&(
                &b.node_address,
                b.node_port,
                &b.service_id,
            ))
        });
        Self {
            members,
            as_of_index,
        }
    }

    /// Build a snapshot from raw entries, keeping only passing ones.
    pub fn from_entries(entries: &[ServiceEntry], as_of_index: u64) -> Self {
        Self::new(
            entries.iter().filter_map(MemberEntry::from_passing).collect(),
            as_of_index,
        )
    }

    /// Empty view used before the first successful query.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn members(&self) -> &[MemberEntry] {
        &self.members
    }

    pub fn as_of_index(&self) -> u64 {
        self.as_of_index
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether both views hold the same members, ignoring the index.
    pub fn same_members(&self, other: &MembershipView) -> bool {
        self.members == other.members
    }

    /// Look up a member by service id.
    pub fn get(&self, service_id: &str) -> Option<&MemberEntry> {
        self.members.iter().find(|m| m.service_id == service_id)
    }

    /// Members that joined and left between `previous` and `self`.
    pub fn diff<'a>(&'a self, previous: &'a MembershipView) -> MembershipDiff<'a> {
        let joined = self
            .members
            .iter()
            .filter(|m| previous.get(&m.service_id).is_none())
            .collect();
        let left = previous
            .members
            .iter()
            .filter(|m| self.get(&m.service_id).is_none())
            .collect();
        MembershipDiff { joined, left }
    }
}

/// Difference between two membership views, keyed by service id.
#[derive(Debug, Default)]
pub struct MembershipDiff<'a> {
    pub joined: Vec<&'a MemberEntry>,
    pub left: Vec<&'a MemberEntry>,
}

impl MembershipDiff<'_> {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, addr: &str, status: HealthStatus) -> ServiceEntry {
        ServiceEntry::new("node", id, "mycluster", addr, 3000, status)
    }

    #[test]
    fn test_health_status_conversion() {
        assert_eq!(HealthStatus::from_str("passing"), HealthStatus::Passing);
        assert_eq!(HealthStatus::from_str("warning"), HealthStatus::Warning);
        assert_eq!(HealthStatus::from_str("maintenance"), HealthStatus::Critical);
        assert_eq!(HealthStatus::Passing.as_str(), "passing");
    }

    #[test]
    fn test_health_aggregation() {
        use HealthStatus::*;
        assert_eq!(HealthStatus::aggregate([]), Passing);
        assert_eq!(HealthStatus::aggregate([Passing, Passing]), Passing);
        assert_eq!(HealthStatus::aggregate([Passing, Warning]), Warning);
        assert_eq!(HealthStatus::aggregate([Warning, Critical, Passing]), Critical);
    }

    #[test]
    fn test_only_passing_entries_become_members() {
        let entries = vec![
            entry("a", "10.0.0.1", HealthStatus::Passing),
            entry("b", "10.0.0.2", HealthStatus::Warning),
            entry("c", "10.0.0.3", HealthStatus::Critical),
        ];
        let view = MembershipView::from_entries(&entries, 12);
        assert_eq!(view.len(), 1);
        assert_eq!(view.as_of_index(), 12);
        assert_eq!(view.members()[0].service_id, "a");
        assert_eq!(view.members()[0].endpoint(), "10.0.0.1:3000");
    }

    #[test]
    fn test_view_ordering_is_stable() {
        let a = MembershipView::from_entries(
            &[
                entry("b", "10.0.0.2", HealthStatus::Passing),
                entry("a", "10.0.0.1", HealthStatus::Passing),
            ],
            3,
        );
        let b = MembershipView::from_entries(
            &[
                entry("a", "10.0.0.1", HealthStatus::Passing),
                entry("b", "10.0.0.2", HealthStatus::Passing),
            ],
            4,
        );
        assert!(a.same_members(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_view_diff() {
        let old = MembershipView::from_entries(
            &[
                entry("a", "10.0.0.1", HealthStatus::Passing),
                entry("b", "10.0.0.2", HealthStatus::Passing),
            ],
            1,
        );
        let new = MembershipView::from_entries(
            &[
                entry("b", "10.0.0.2", HealthStatus::Passing),
                entry("c", "10.0.0.3", HealthStatus::Passing),
            ],
            2,
        );

        let diff = new.diff(&old);
        assert_eq!(diff.joined.len(), 1);
        assert_eq!(diff.joined[0].service_id, "c");
        assert_eq!(diff.left.len(), 1);
        assert_eq!(diff.left[0].service_id, "a");
        assert!(new.diff(&new).is_empty());
    }
}
