//! Cluster membership: registration, heartbeat, watcher and the shared view.

mod heartbeat;
mod registration;
mod view;
mod watcher;

pub use heartbeat::{HeartbeatConfig, HeartbeatLoop};
pub use registration::{RegistrationManager, RegistrationOptions};
pub use view::{membership_channel, ViewHandle, ViewPublisher};
pub use watcher::{MembershipWatcher, WatchStep, WatcherConfig};
