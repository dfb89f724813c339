use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use beacon_core::cluster::{CheckDescriptor, DiscoveryBackend, HeartbeatState, ServiceIdentity};
use beacon_core::config::BeaconConfig;
use beacon_core::{BackendError, RegistrationError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatLoop};
use super::view::{membership_channel, ViewHandle, ViewPublisher};
use super::watcher::{MembershipWatcher, WatcherConfig};
use crate::backoff::BackoffConfig;

/// Registration manager configuration.
#[derive(Debug, Clone)]
pub struct RegistrationOptions {
    /// Heartbeat interval (defaults to half the check TTL).
    pub heartbeat_interval: Option<Duration>,
    /// Output text sent with each TTL update.
    pub heartbeat_output: String,
    /// Watcher settings. Defaults to watching the registered service's name.
    pub watch: Option<WatcherConfig>,
    /// How long `stop` waits for the loops before aborting them.
    pub shutdown_timeout: Duration,
}

impl Default for RegistrationOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_output: "online".to_string(),
            watch: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl RegistrationOptions {
    /// Derive options from the loaded configuration.
    pub fn from_config(config: &BeaconConfig) -> beacon_core::Result<Self> {
        let discovery = &config.discovery;
        let watch = WatcherConfig {
            service: config.watch_service().to_string(),
            tag: discovery.watch_tag.clone(),
            wait: discovery.wait(),
            backoff: BackoffConfig {
                base: discovery.backoff_base(),
                max: discovery.backoff_max(),
                ..Default::default()
            },
        };

        Ok(Self {
            heartbeat_interval: Some(config.check.heartbeat_interval()?),
            heartbeat_output: config.check.output.clone(),
            watch: Some(watch),
            shutdown_timeout: discovery.shutdown_timeout(),
        })
    }
}

enum Phase {
    /// Not registered yet; holds the write side of the view for the watcher.
    Idle(ViewPublisher),
    /// A registration call is in flight.
    Registering,
    Registered(Active),
    Stopped,
}

struct Active {
    shutdown: CancellationToken,
    heartbeat_state: watch::Receiver<HeartbeatState>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

/// Registers the local service and owns the heartbeat and watcher tasks.
///
/// Lifecycle is `register` once, then `stop`. A stopped manager cannot be
/// registered again; build a new one instead.
pub struct RegistrationManager {
    backend: Arc<dyn DiscoveryBackend>,
    options: RegistrationOptions,
    view: ViewHandle,
    phase: Mutex<Phase>,
    registered: Mutex<Option<(ServiceIdentity, CheckDescriptor)>>,
    shutdown: CancellationToken,
}

impl RegistrationManager {
    /// Create a new registration manager.
    pub fn new(backend: Arc<dyn DiscoveryBackend>, options: RegistrationOptions) -> Self {
        let (publisher, view) = membership_channel();
        Self {
            backend,
            options,
            view,
            phase: Mutex::new(Phase::Idle(publisher)),
            registered: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn registered(&self) -> MutexGuard<'_, Option<(ServiceIdentity, CheckDescriptor)>> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the service, then start the heartbeat and the watcher.
    ///
    /// Returns once both loops are spawned, not once they have run. If `stop`
    /// runs while the backend call is in flight, the registration is undone
    /// once the backend answers and `Invalid` is returned.
    pub async fn register(
        &self,
        identity: ServiceIdentity,
        check: CheckDescriptor,
    ) -> Result<(), RegistrationError> {
        let pending = self.begin(&identity)?;

        let heartbeat_config = HeartbeatConfig::for_check(&check, self.options.heartbeat_interval)
            .map_err(|e| RegistrationError::Invalid(e.to_string()))?
            .with_output(self.options.heartbeat_output.clone());

        tracing::info!(
            service_id = %identity.service_id(),
            service = %identity.service_name(),
            check_id = %check.check_id(),
            ttl = ?check.ttl(),
            deregister_after = ?check.deregister_after(),
            backend = self.backend.name(),
            "Registering service"
        );

        if let Err(e) = self.backend.register(&identity, &check).await {
            let err = RegistrationError::from(e);
            tracing::error!(service_id = %identity.service_id(), error = %err, "Registration failed");
            return Err(err);
        }

        let service_id = identity.service_id().to_string();
        if !self.activate(pending, identity, check, heartbeat_config) {
            tracing::info!(
                service_id = %service_id,
                "Stopped while registering; undoing registration"
            );
            if let Err(e) = self.backend.deregister(&service_id).await {
                tracing::warn!(
                    service_id = %service_id,
                    error = %e,
                    "Deregistration failed; the backend will expire the registration"
                );
            }
            return Err(RegistrationError::Invalid(
                "registration manager was stopped during registration".into(),
            ));
        }

        tracing::info!(service_id = %service_id, "Service registered");
        Ok(())
    }

    /// Move from idle to registering, handing out the view publisher.
    fn begin(
        &self,
        identity: &ServiceIdentity,
    ) -> Result<PendingRegistration<'_>, RegistrationError> {
        let mut phase = self.phase();
        match std::mem::replace(&mut *phase, Phase::Registering) {
            Phase::Idle(publisher) => Ok(PendingRegistration {
                manager: self,
                publisher: Some(publisher),
            }),
            Phase::Stopped => {
                *phase = Phase::Stopped;
                Err(RegistrationError::Invalid(
                    "registration manager has been stopped".into(),
                ))
            }
            other => {
                *phase = other;
                let service_id = self
                    .registered()
                    .as_ref()
                    .map(|(registered, _)| registered.service_id().to_string())
                    .unwrap_or_else(|| identity.service_id().to_string());
                Err(RegistrationError::AlreadyRegistered(service_id))
            }
        }
    }

    /// Spawn the loops and move to registered, unless `stop` got there first.
    ///
    /// The phase lock is held throughout so `stop` either sees the running
    /// loops or none at all.
    fn activate(
        &self,
        mut pending: PendingRegistration<'_>,
        identity: ServiceIdentity,
        check: CheckDescriptor,
        heartbeat_config: HeartbeatConfig,
    ) -> bool {
        let publisher = pending.publisher.take();
        let mut phase = self.phase();
        let Some(publisher) = publisher.filter(|_| matches!(*phase, Phase::Registering)) else {
            return false;
        };

        let watch_config = self
            .options
            .watch
            .clone()
            .unwrap_or_else(|| WatcherConfig::new(identity.service_name()));

        let shutdown = self.shutdown.child_token();

        let heartbeat = HeartbeatLoop::new(self.backend.clone(), check.check_id(), heartbeat_config);
        let heartbeat_state = heartbeat.state();
        let heartbeat_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { heartbeat.run(shutdown).await }
        });

        let watcher = MembershipWatcher::new(self.backend.clone(), watch_config, publisher);
        let watcher_task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { watcher.run(shutdown).await }
        });

        *self.registered() = Some((identity, check));
        *phase = Phase::Registered(Active {
            shutdown,
            heartbeat_state,
            tasks: vec![("heartbeat", heartbeat_task), ("watcher", watcher_task)],
        });
        true
    }

    /// Make one explicit deregistration call. Never retried: TTL expiry and
    /// `deregister_after` take the node out if this fails.
    pub async fn deregister(&self) -> Result<(), BackendError> {
        let Some(service_id) = self
            .registered()
            .as_ref()
            .map(|(identity, _)| identity.service_id().to_string())
        else {
            tracing::debug!("Nothing registered, skipping deregistration");
            return Ok(());
        };

        match self.backend.deregister(&service_id).await {
            Ok(()) => {
                tracing::info!(service_id = %service_id, "Service deregistered");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    service_id = %service_id,
                    error = %e,
                    "Deregistration failed; the backend will expire the registration"
                );
                Err(e)
            }
        }
    }

    /// Stop both loops, then deregister.
    pub async fn stop(&self) {
        let active = match std::mem::replace(&mut *self.phase(), Phase::Stopped) {
            Phase::Registered(active) => active,
            Phase::Registering => {
                // The in-flight `register` sees `Stopped` and deregisters itself.
                self.shutdown.cancel();
                return;
            }
            _ => return,
        };

        active.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + self.options.shutdown_timeout;
        for (name, mut task) in active.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Task ended abnormally"),
                Err(_) => {
                    tracing::warn!(
                        task = name,
                        timeout = ?self.options.shutdown_timeout,
                        "Task did not stop in time, aborting"
                    );
                    task.abort();
                }
            }
        }

        let _ = self.deregister().await;
    }

    /// Read handle on the membership view.
    pub fn view(&self) -> ViewHandle {
        self.view.clone()
    }

    /// Heartbeat state updates, once registered.
    pub fn heartbeat_state(&self) -> Option<watch::Receiver<HeartbeatState>> {
        match &*self.phase() {
            Phase::Registered(active) => Some(active.heartbeat_state.clone()),
            _ => None,
        }
    }

    /// Identity of the registered service.
    pub fn identity(&self) -> Option<ServiceIdentity> {
        self.registered()
            .as_ref()
            .map(|(identity, _)| identity.clone())
    }

    /// Check descriptor of the registered service.
    pub fn check(&self) -> Option<CheckDescriptor> {
        self.registered().as_ref().map(|(_, check)| check.clone())
    }

    /// Whether the service is registered and its loops are running.
    pub fn is_registered(&self) -> bool {
        matches!(&*self.phase(), Phase::Registered(_))
    }
}

/// A registration in flight. Dropping it before the loops start returns the
/// view publisher to an idle manager, so a failed or cancelled `register` can
/// be retried.
struct PendingRegistration<'a> {
    manager: &'a RegistrationManager,
    publisher: Option<ViewPublisher>,
}

impl Drop for PendingRegistration<'_> {
    fn drop(&mut self) {
        let Some(publisher) = self.publisher.take() else {
            return;
        };
        let mut phase = self.manager.phase();
        if matches!(*phase, Phase::Registering) {
            *phase = Phase::Idle(publisher);
        }
    }
}

impl Drop for RegistrationManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
