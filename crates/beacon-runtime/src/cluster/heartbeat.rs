use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::cluster::{CheckDescriptor, DiscoveryBackend, HealthStatus, HeartbeatState};
use beacon_core::{BeaconError, HeartbeatError};
use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Heartbeat loop configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between TTL updates. Always shorter than `ttl`.
    pub interval: Duration,
    /// TTL of the check being refreshed.
    pub ttl: Duration,
    /// Output text attached to each update.
    pub output: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            ttl: Duration::from_secs(10),
            output: "online".to_string(),
        }
    }
}

impl HeartbeatConfig {
    /// Build a configuration for `check`, defaulting to half its TTL.
    pub fn for_check(
        check: &CheckDescriptor,
        interval: Option<Duration>,
    ) -> beacon_core::Result<Self> {
        let ttl = check.ttl();
        let interval = interval.unwrap_or_else(|| check.recommended_interval());

        if interval.is_zero() || interval >= ttl {
            return Err(BeaconError::Config(format!(
                "heartbeat interval {:?} must be shorter than check ttl {:?}",
                interval, ttl
            )));
        }
        if interval > check.recommended_interval() {
            tracing::warn!(
                interval = ?interval,
                ttl = ?ttl,
                "Heartbeat interval exceeds half the TTL; a single missed update will expire the check"
            );
        }

        Ok(Self {
            interval,
            ttl,
            ..Default::default()
        })
    }

    /// Set the output text.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }
}

/// Periodically reports the TTL check as passing.
///
/// A failed update is logged and counted; the loop keeps ticking. If updates
/// keep failing, the backend's own TTL expiry takes the node out.
pub struct HeartbeatLoop {
    backend: Arc<dyn DiscoveryBackend>,
    check_id: String,
    config: HeartbeatConfig,
    running: Arc<AtomicBool>,
    state_tx: watch::Sender<HeartbeatState>,
}

impl HeartbeatLoop {
    /// Create a new heartbeat loop.
    pub fn new(
        backend: Arc<dyn DiscoveryBackend>,
        check_id: impl Into<String>,
        config: HeartbeatConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(HeartbeatState::default());
        Self {
            backend,
            check_id: check_id.into(),
            config,
            running: Arc::new(AtomicBool::new(false)),
            state_tx,
        }
    }

    /// Check if the loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to heartbeat state updates.
    pub fn state(&self) -> watch::Receiver<HeartbeatState> {
        self.state_tx.subscribe()
    }

    /// Run the heartbeat loop until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.running.store(true, Ordering::SeqCst);

        // First tick completes immediately so the check turns passing right away.
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            check_id = %self.check_id,
            interval = ?self.config.interval,
            ttl = ?self.config.ttl,
            "Heartbeat loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                result = self.send_heartbeat() => self.record(result),
            }
        }

        tracing::info!(check_id = %self.check_id, "Heartbeat loop shutting down");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Send one TTL update.
    async fn send_heartbeat(&self) -> Result<(), HeartbeatError> {
        self.backend
            .update_check(&self.check_id, HealthStatus::Passing, &self.config.output)
            .await
            .map_err(|source| HeartbeatError::TransientNetwork {
                check_id: self.check_id.clone(),
                source,
            })
    }

    fn record(&self, result: Result<(), HeartbeatError>) {
        let now = Utc::now();
        match result {
            Ok(()) => {
                let recovered_after = self.state_tx.borrow().consecutive_failures;
                self.state_tx.send_modify(|state| state.record_success(now));
                if recovered_after > 0 {
                    tracing::info!(
                        check_id = %self.check_id,
                        failures = recovered_after,
                        "Heartbeat recovered"
                    );
                } else {
                    tracing::trace!(check_id = %self.check_id, "Heartbeat sent");
                }
            }
            Err(e) => {
                self.state_tx.send_modify(|state| state.record_failure(now));
                let failures = self.state_tx.borrow().consecutive_failures;
                let unreported = self.config.interval * failures;

                if unreported >= self.config.ttl {
                    tracing::error!(
                        error = %e,
                        failures,
                        "Heartbeat failing for longer than the TTL; the check has likely expired"
                    );
                } else {
                    tracing::warn!(error = %e, failures, "Failed to send heartbeat");
                }
            }
        }
    }
}
