//! Discovery backend implementations.

mod consul;

pub use consul::{ConsulBackend, ConsulConfig};
