//! Core types for beacon: the service identity and check model, the
//! membership view, the discovery backend contract and configuration.

pub mod cluster;
pub mod config;
pub mod error;

pub use cluster::{
    BlockingQuery, CheckDescriptor, DiscoveryBackend, HealthStatus, HeartbeatState, MemberEntry,
    MembershipView, QueryResponse, ServiceEntry, ServiceIdentity, WatchCursor,
};
pub use config::BeaconConfig;
pub use error::{
    BackendError, BeaconError, HeartbeatError, RegistrationError, Result, WatchError,
};
