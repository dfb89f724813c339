//! Runtime for beacon: the Consul backend, the heartbeat and membership
//! loops, and the registration manager that ties them together.

pub mod backend;
pub mod backoff;
pub mod cluster;
pub mod testing;

pub use backend::{ConsulBackend, ConsulConfig};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use cluster::{
    HeartbeatConfig, HeartbeatLoop, MembershipWatcher, RegistrationManager, RegistrationOptions,
    ViewHandle, WatcherConfig,
};
