//! beacon - self-registering cluster membership.
//!
//! Registers the local service with a discovery backend behind a TTL check,
//! keeps the check passing with a heartbeat, and long-polls the backend for
//! a live view of the cluster's healthy members.

mod runtime;

pub use beacon_core;
pub use beacon_runtime;

pub use runtime::prelude;
pub use runtime::{Beacon, BeaconBuilder};
