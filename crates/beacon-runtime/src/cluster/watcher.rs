use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::cluster::{
    BlockingQuery, CursorStep, DiscoveryBackend, MembershipView, QueryResponse, WatchCursor,
};
use beacon_core::{BackendError, WatchError};
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::view::{ViewHandle, ViewPublisher};
use crate::backoff::{BackoffConfig, ExponentialBackoff};

/// Membership watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Service whose members are watched.
    pub service: String,
    /// Only watch members carrying this tag.
    pub tag: Option<String>,
    /// Maximum time the backend may hold a blocking query.
    pub wait: Duration,
    /// Retry policy after a failed cycle.
    pub backoff: BackoffConfig,
}

impl WatcherConfig {
    /// Watch `service` with default timings.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            tag: None,
            wait: Duration::from_secs(300),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Result of one successful watch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchStep {
    /// A new snapshot was published.
    Published,
    /// The index advanced but the members are the same.
    Unmodified,
    /// The long poll timed out with the same index.
    Unchanged,
}

/// Long-polls the backend for healthy members and publishes each new
/// membership into the view.
pub struct MembershipWatcher {
    backend: Arc<dyn DiscoveryBackend>,
    config: WatcherConfig,
    publisher: ViewPublisher,
    running: Arc<AtomicBool>,
    published: AtomicU64,
}

impl MembershipWatcher {
    /// Create a new watcher publishing into `publisher`.
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        config: WatcherConfig,
        publisher: ViewPublisher,
    ) -> Self {
        Self {
            backend,
            config,
            publisher,
            running: Arc::new(AtomicBool::new(false)),
            published: AtomicU64::new(0),
        }
    }

    /// Check if the watcher is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Read handle on the published view.
    pub fn view(&self) -> ViewHandle {
        self.publisher.handle()
    }

    /// Number of snapshots published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Run the watch loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);

        let mut cursor = WatchCursor::new();
        let mut backoff = ExponentialBackoff::new(self.config.backoff.clone());

        tracing::info!(
            service = %self.config.service,
            tag = ?self.config.tag,
            wait = ?self.config.wait,
            "Membership watcher started"
        );

        // Consecutive regressions, and whether the next success is the
        // re-fetch that follows one.
        let mut regressions = 0u32;
        let mut refetching = false;

        loop {
            let query = self.query(cursor.wait_index());

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.backend.blocking_query(&query) => result,
            };

            let delay = match self.apply(&mut cursor, result) {
                Ok(step) => {
                    if refetching {
                        refetching = false;
                    } else {
                        if backoff.attempts() > 0 {
                            tracing::info!(
                                failures = backoff.attempts(),
                                index = cursor.last_index(),
                                "Membership watch recovered"
                            );
                        }
                        backoff.reset();
                        regressions = 0;
                    }
                    tracing::trace!(?step, index = cursor.last_index(), "Watch cycle complete");
                    continue;
                }
                Err(WatchError::IndexRegression { previous, current }) => {
                    regressions += 1;
                    refetching = true;
                    tracing::warn!(
                        previous,
                        current,
                        regressions,
                        "Blocking index went backwards; re-fetching full membership"
                    );
                    // The first re-fetch is immediate; a backend that keeps
                    // going backwards is retried on the backoff schedule.
                    if regressions < 2 {
                        continue;
                    }
                    backoff.next_delay()
                }
                Err(e) => {
                    let delay = if e.is_transient() {
                        backoff.next_delay()
                    } else {
                        backoff.next_max_delay()
                    };
                    tracing::warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        retry_in = ?delay,
                        "Membership watch failed"
                    );
                    delay
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::info!(service = %self.config.service, "Membership watcher shutting down");
        self.running.store(false, Ordering::SeqCst);
    }

    fn query(&self, index: u64) -> BlockingQuery {
        BlockingQuery {
            service: self.config.service.clone(),
            passing_only: true,
            index,
            wait: self.config.wait,
            tag: self.config.tag.clone(),
        }
    }

    /// Fold one query result into the cursor and the view.
    fn apply(
        &self,
        cursor: &mut WatchCursor,
        result: Result<QueryResponse, BackendError>,
    ) -> Result<WatchStep, WatchError> {
        let response = result?;

        match cursor.observe(response.index, Utc::now()) {
            CursorStep::Regressed { previous } => Err(WatchError::IndexRegression {
                previous,
                current: response.index,
            }),
            CursorStep::Unchanged => Ok(WatchStep::Unchanged),
            CursorStep::Advanced => {
                let view = MembershipView::from_entries(&response.entries, response.index);
                let members = view.len();

                if self.publisher.publish(view) {
                    self.published.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!(
                        index = response.index,
                        members,
                        "Published membership update"
                    );
                    Ok(WatchStep::Published)
                } else {
                    Ok(WatchStep::Unmodified)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use beacon_core::cluster::{HealthStatus, ServiceEntry};

    use super::*;
    use crate::cluster::view::membership_channel;
    use crate::testing::MemoryBackend;

    fn entries(ids: &[&str]) -> Vec<ServiceEntry> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                ServiceEntry::new(
                    format!("node-{}", i),
                    *id,
                    "mycluster",
                    format!("10.0.0.{}", i + 1),
                    3000,
                    HealthStatus::Passing,
                )
            })
            .collect()
    }

    fn response(index: u64, ids: &[&str]) -> QueryResponse {
        QueryResponse {
            index,
            entries: entries(ids),
        }
    }

    fn watcher(backend: Arc<MemoryBackend>) -> Arc<MembershipWatcher> {
        let (publisher, _) = membership_channel();
        Arc::new(MembershipWatcher::new(
            backend,
            WatcherConfig::new("mycluster"),
            publisher,
        ))
    }

    fn spawn(
        watcher: &Arc<MembershipWatcher>,
        shutdown: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let watcher = watcher.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { watcher.run(shutdown).await })
    }

    #[test]
    fn test_watcher_config_defaults() {
        let config = WatcherConfig::new("mycluster");
        assert_eq!(config.service, "mycluster");
        assert_eq!(config.wait, Duration::from_secs(300));
        assert_eq!(config.backoff, BackoffConfig::default());
    }

    #[test]
    fn test_apply_steps() {
        let backend = Arc::new(MemoryBackend::new());
        let watcher = watcher(backend);
        let mut cursor = WatchCursor::new();

        let step = watcher.apply(&mut cursor, Ok(response(3, &["a"])));
        assert_eq!(step, Ok(WatchStep::Published));

        let step = watcher.apply(&mut cursor, Ok(response(3, &["a"])));
        assert_eq!(step, Ok(WatchStep::Unchanged));

        let step = watcher.apply(&mut cursor, Ok(response(4, &["a"])));
        assert_eq!(step, Ok(WatchStep::Unmodified));

        let step = watcher.apply(&mut cursor, Ok(response(2, &["a"])));
        assert_eq!(
            step,
            Err(WatchError::IndexRegression {
                previous: 4,
                current: 2
            })
        );
        assert_eq!(cursor.wait_index(), 0);

        let step = watcher.apply(&mut cursor, Err(BackendError::Decode("bad".into())));
        assert!(matches!(step, Err(WatchError::DecodeFailure(_))));
        assert_eq!(watcher.published_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_index_is_reused_and_not_republished() {
        let backend = Arc::new(MemoryBackend::scripted());
        backend.push_response(response(0, &["a"]));
        backend.push_response(response(5, &["a", "b"]));
        backend.push_response(response(5, &["a", "b"]));
        backend.push_response(response(7, &["b", "c"]));

        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let task = spawn(&watcher, &shutdown);

        // Four scripted answers, then a fifth query parked on index 7.
        backend.wait_for_queries(5).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(backend.query_indices(), vec![0, 1, 5, 5, 7]);
        assert_eq!(watcher.published_count(), 3);

        let view = watcher.view().current();
        assert_eq!(view.as_of_index(), 7);
        let ids: Vec<&str> = view.members().iter().map(|m| m.service_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_advancing_index_with_same_members_publishes_once() {
        let backend = Arc::new(MemoryBackend::scripted());
        backend.push_response(response(3, &["a"]));
        backend.push_response(response(4, &["a"]));
        backend.push_response(response(9, &["a"]));

        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let task = spawn(&watcher, &shutdown);

        backend.wait_for_queries(4).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(watcher.published_count(), 1);
        assert_eq!(watcher.view().current().as_of_index(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_index_regression_refetches_from_zero() {
        let backend = Arc::new(MemoryBackend::scripted());
        backend.push_response(response(40, &["a"]));
        backend.push_response(response(2, &["a", "b"]));
        backend.push_response(response(3, &["a", "b"]));

        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let task = spawn(&watcher, &shutdown);

        backend.wait_for_queries(4).await;
        shutdown.cancel();
        task.await.unwrap();

        assert_eq!(backend.query_indices(), vec![0, 40, 0, 3]);
        let view = watcher.view().current();
        assert_eq!(view.len(), 2);
        assert_eq!(view.as_of_index(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_back_off_then_recover() {
        let backend = Arc::new(MemoryBackend::scripted());
        backend.push_failure(BackendError::Unreachable("connection refused".into()));
        backend.push_failure(BackendError::Unreachable("connection refused".into()));
        backend.push_failure(BackendError::Decode("expected array".into()));
        backend.push_response(response(12, &["a", "b"]));

        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let task = spawn(&watcher, &shutdown);

        backend.wait_for_queries(5).await;
        let elapsed = started.elapsed();
        shutdown.cancel();
        task.await.unwrap();

        // 1s + 2s + 4s of backoff before the successful fourth query.
        assert!(elapsed >= Duration::from_secs(7), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(8), "elapsed {:?}", elapsed);
        assert_eq!(backend.query_indices(), vec![0, 0, 0, 0, 12]);

        let view = watcher.view().current();
        assert_eq!(view.len(), 2);
        assert_eq!(view.as_of_index(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_regressions_back_off() {
        let backend = Arc::new(MemoryBackend::scripted());
        backend.push_response(response(40, &["a"]));
        backend.push_response(response(2, &["a"]));
        backend.push_response(response(40, &["a"]));
        backend.push_response(response(2, &["a"]));
        backend.push_response(response(40, &["a"]));

        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let task = spawn(&watcher, &shutdown);

        backend.wait_for_queries(6).await;
        let elapsed = started.elapsed();
        shutdown.cancel();
        task.await.unwrap();

        // Immediate re-fetch after the first regression, 1s before the second.
        assert_eq!(backend.query_indices(), vec![0, 40, 0, 40, 0, 40]);
        assert!(elapsed >= Duration::from_secs(1), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_rejection_waits_for_backoff_ceiling() {
        let backend = Arc::new(MemoryBackend::scripted());
        backend.push_failure(BackendError::Rejected {
            status: 503,
            message: "No cluster leader".into(),
        });
        backend.push_failure(BackendError::Rejected {
            status: 403,
            message: "Permission denied".into(),
        });
        backend.push_response(response(12, &["a"]));

        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let started = tokio::time::Instant::now();
        let task = spawn(&watcher, &shutdown);

        backend.wait_for_queries(4).await;
        let elapsed = started.elapsed();
        shutdown.cancel();
        task.await.unwrap();

        // 1s after the 503, then the 30s ceiling after the 403.
        assert!(elapsed >= Duration::from_secs(31), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(32), "elapsed {:?}", elapsed);
        assert_eq!(watcher.view().current().as_of_index(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_outstanding_query() {
        let backend = Arc::new(MemoryBackend::scripted());
        let watcher = watcher(backend.clone());
        let shutdown = CancellationToken::new();
        let task = spawn(&watcher, &shutdown);

        backend.wait_for_queries(1).await;
        assert!(watcher.is_running());
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("watcher should stop while a query is outstanding")
            .unwrap();
        assert!(!watcher.is_running());
    }
}
