use std::sync::Arc;

use beacon_core::cluster::MembershipView;
use tokio::sync::watch;

/// Create a publisher/handle pair starting from an empty view.
pub fn membership_channel() -> (ViewPublisher, ViewHandle) {
    let (tx, rx) = watch::channel(Arc::new(MembershipView::empty()));
    (ViewPublisher { tx }, ViewHandle { rx })
}

/// Read side of the membership view. Cheap to clone; hand one to every
/// consumer that needs the current members.
#[derive(Debug, Clone)]
pub struct ViewHandle {
    rx: watch::Receiver<Arc<MembershipView>>,
}

impl ViewHandle {
    /// Latest published snapshot.
    ///
    /// Only the `Arc` is cloned under the channel lock; the snapshot itself is
    /// never mutated after publication.
    pub fn current(&self) -> Arc<MembershipView> {
        self.rx.borrow().clone()
    }

    /// Wait for the next publish and return it. Returns `None` once the
    /// publisher is gone.
    pub async fn changed(&mut self) -> Option<Arc<MembershipView>> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}

/// Write side of the membership view. Owned by the membership watcher.
#[derive(Debug)]
pub struct ViewPublisher {
    tx: watch::Sender<Arc<MembershipView>>,
}

impl ViewPublisher {
    /// Swap in a new snapshot if its members differ from the current one.
    /// Returns whether anything was published.
    pub fn publish(&self, view: MembershipView) -> bool {
        self.tx.send_if_modified(move |current| {
            if current.same_members(&view) {
                return false;
            }
            *current = Arc::new(view);
            true
        })
    }

    /// Get a new read handle.
    pub fn handle(&self) -> ViewHandle {
        ViewHandle {
            rx: self.tx.subscribe(),
        }
    }
}
