//! Testing utilities for beacon.
//!
//! Provides an in-memory discovery backend that honors TTL expiry and
//! blocking-query semantics, plus fault injection and call recording.

mod memory;

pub use memory::MemoryBackend;

use std::time::Duration;

/// Default test timeout.
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(30);
