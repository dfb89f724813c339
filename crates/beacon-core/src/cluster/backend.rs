use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::BackendError;

use super::entry::ServiceEntry;
use super::identity::{CheckDescriptor, ServiceIdentity};
use super::member::HealthStatus;

/// Future returned by backend calls.
pub type BackendFuture<'a, T> =
    Pin<Box<dyn Future<Output = std::result::Result<T, BackendError>> + Send + 'a>>;

/// Parameters of one blocking membership query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockingQuery {
    /// Service to list.
    pub service: String,
    /// Only return entries whose checks are all passing.
    pub passing_only: bool,
    /// Block until the backend index moves past this value (0 = no blocking).
    pub index: u64,
    /// Maximum time the backend may hold the request.
    pub wait: Duration,
    /// Optional tag filter.
    pub tag: Option<String>,
}

impl BlockingQuery {
    /// Passing-only query for a service.
    pub fn passing(service: impl Into<String>, index: u64, wait: Duration) -> Self {
        Self {
            service: service.into(),
            passing_only: true,
            index,
            wait,
            tag: None,
        }
    }
}

/// Result of a blocking query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResponse {
    /// Backend index the entries are valid as of.
    pub index: u64,
    /// Service entries matching the query.
    pub entries: Vec<ServiceEntry>,
}

/// Remote discovery backend.
///
/// Handles are injected as `Arc<dyn DiscoveryBackend>` so the loops can be
/// driven by a test double.
pub trait DiscoveryBackend: Send + Sync + 'static {
    /// Register the service together with its TTL check.
    fn register<'a>(
        &'a self,
        identity: &'a ServiceIdentity,
        check: &'a CheckDescriptor,
    ) -> BackendFuture<'a, ()>;

    /// Remove the service registration.
    fn deregister<'a>(&'a self, service_id: &'a str) -> BackendFuture<'a, ()>;

    /// Report the status of a TTL check.
    fn update_check<'a>(
        &'a self,
        check_id: &'a str,
        status: HealthStatus,
        output: &'a str,
    ) -> BackendFuture<'a, ()>;

    /// Long-poll the membership of a service.
    fn blocking_query<'a>(&'a self, query: &'a BlockingQuery) -> BackendFuture<'a, QueryResponse>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str {
        "backend"
    }
}
