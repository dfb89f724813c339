//! Beacon runtime.
//!
//! Registers the local service with the discovery backend, keeps its TTL
//! check passing and maintains a live view of the cluster's healthy members
//! until shutdown.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use beacon_core::cluster::DiscoveryBackend;
use beacon_core::config::BeaconConfig;
use beacon_core::error::{BeaconError, Result};
use beacon_runtime::backend::{ConsulBackend, ConsulConfig};
use beacon_runtime::cluster::{RegistrationManager, RegistrationOptions, ViewHandle};

/// Prelude module for common imports.
pub mod prelude {
    pub use beacon_core::cluster::{
        CheckDescriptor, DiscoveryBackend, HealthStatus, MemberEntry, MembershipView,
        ServiceIdentity,
    };
    pub use beacon_core::config::BeaconConfig;
    pub use beacon_core::error::{BeaconError, RegistrationError, Result};
    pub use beacon_runtime::cluster::ViewHandle;

    pub use crate::{Beacon, BeaconBuilder};
}

/// The main beacon runtime.
pub struct Beacon {
    config: BeaconConfig,
    backend: Arc<dyn DiscoveryBackend>,
    manager: RegistrationManager,
    shutdown_tx: broadcast::Sender<()>,
    logger: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Beacon {
    /// Create a new builder for configuring beacon.
    pub fn builder() -> BeaconBuilder {
        BeaconBuilder::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    /// Name of the discovery backend in use.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Read handle on the cluster's healthy members.
    pub fn view(&self) -> ViewHandle {
        self.manager.view()
    }

    /// Registration manager owning the heartbeat and watcher.
    pub fn registration(&self) -> &RegistrationManager {
        &self.manager
    }

    /// Register the service and start the background loops.
    pub async fn start(&self) -> Result<()> {
        let identity = self.config.service.to_identity()?;
        let check = self.config.check.to_descriptor()?;

        self.manager.register(identity, check).await?;

        if self.config.observability.logging.log_membership_changes {
            let token = CancellationToken::new();
            let task = tokio::spawn(log_membership(self.manager.view(), token.clone()));
            *self.logger.lock().unwrap_or_else(|e| e.into_inner()) = Some((token, task));
        }

        tracing::info!(
            service = %self.config.service.name,
            watch = %self.config.watch_service(),
            backend = self.backend.name(),
            "Beacon started"
        );
        Ok(())
    }

    /// Stop the background loops and deregister.
    pub async fn stop(&self) {
        let logger = self.logger.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some((token, task)) = logger {
            token.cancel();
            let _ = task.await;
        }

        self.manager.stop().await;
        tracing::info!("Beacon stopped");
    }

    /// Start, wait for a shutdown signal, then stop.
    pub async fn run(self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        self.start().await?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
            }
            _ = shutdown_rx.recv() => {
                tracing::info!("Received shutdown notification");
            }
        }

        tracing::info!("Starting graceful shutdown...");
        self.stop().await;
        Ok(())
    }

    /// Request shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Sender that triggers shutdown of a running instance.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }
}

/// Log members joining and leaving until cancelled.
async fn log_membership(mut view: ViewHandle, shutdown: CancellationToken) {
    let mut previous = view.current();

    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = view.changed() => next,
        };
        let Some(next) = next else { break };

        let diff = next.diff(&previous);
        for member in &diff.joined {
            tracing::info!(
                service_id = %member.service_id,
                endpoint = %member.endpoint(),
                "Member joined"
            );
        }
        for member in &diff.left {
            tracing::info!(
                service_id = %member.service_id,
                endpoint = %member.endpoint(),
                "Member left"
            );
        }
        tracing::info!(
            members = next.len(),
            index = next.as_of_index(),
            "Membership changed"
        );

        previous = next;
    }
}

/// Builder for configuring the beacon runtime.
pub struct BeaconBuilder {
    config: Option<BeaconConfig>,
    backend: Option<Arc<dyn DiscoveryBackend>>,
}

impl BeaconBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            config: None,
            backend: None,
        }
    }

    /// Set the configuration.
    pub fn config(mut self, config: BeaconConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a specific discovery backend instead of the configured agent.
    pub fn backend(mut self, backend: Arc<dyn DiscoveryBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Build the beacon runtime.
    pub fn build(self) -> Result<Beacon> {
        let mut config = self
            .config
            .ok_or_else(|| BeaconError::Config("Configuration is required".to_string()))?;

        if config.service.id.is_none() {
            config.service.id = Some(default_service_id(&config.service.name, config.service.port));
        }
        config.validate()?;

        let backend: Arc<dyn DiscoveryBackend> = match self.backend {
            Some(backend) => backend,
            None => Arc::new(ConsulBackend::new(ConsulConfig::from(&config.discovery))?),
        };

        let options = RegistrationOptions::from_config(&config)?;
        let manager = RegistrationManager::new(backend.clone(), options);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Beacon {
            config,
            backend,
            manager,
            shutdown_tx,
            logger: Mutex::new(None),
        })
    }
}

impl Default for BeaconBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Service id that stays stable across restarts of the same host and port.
fn default_service_id(name: &str, port: u16) -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}-{}-{}", name, hostname, port)
}
