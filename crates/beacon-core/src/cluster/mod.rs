mod backend;
mod entry;
mod identity;
mod member;
mod state;

pub use backend::{BackendFuture, BlockingQuery, DiscoveryBackend, QueryResponse};
pub use entry::{EntryCheck, EntryNode, EntryService, ServiceEntry};
pub use identity::{CheckDescriptor, ServiceIdentity};
pub use member::{HealthStatus, MemberEntry, MembershipDiff, MembershipView};
pub use state::{CursorStep, HeartbeatOutcome, HeartbeatState, WatchCursor};
