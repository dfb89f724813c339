//! In-memory discovery backend.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use beacon_core::cluster::{
    BackendFuture, BlockingQuery, CheckDescriptor, DiscoveryBackend, HealthStatus, QueryResponse,
    ServiceEntry, ServiceIdentity,
};
use beacon_core::BackendError;
use tokio::sync::watch;
use tokio::time::Instant;

/// A discovery backend living in process memory.
///
/// Behaves like a single discovery agent: TTL checks start critical, go
/// critical again when not refreshed within their TTL, and the service is
/// reaped once the check has been critical for `deregister_after`. Every
/// state change bumps a modify index and wakes blocking queries. Time is read
/// from `tokio::time`, so paused-clock tests control expiry precisely.
///
/// Blocking queries can also be scripted with canned responses; a scripted
/// backend parks further queries forever once the script runs out.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
    changes: watch::Sender<u64>,
    queries: watch::Sender<usize>,
    registration_gate: watch::Sender<bool>,
    held_registrations: watch::Sender<usize>,
    scripted: bool,
}

struct Inner {
    index: u64,
    services: BTreeMap<String, Registration>,
    script: VecDeque<Scripted>,
    faults: Faults,
    calls: Calls,
    query_indices: Vec<u64>,
}

#[derive(Default)]
struct Faults {
    registrations: u32,
    rejection: Option<String>,
    updates: u32,
    deregistrations: u32,
    queries: u32,
}

#[derive(Default)]
struct Calls {
    register: usize,
    deregister: usize,
    update: usize,
}

struct Registration {
    identity: ServiceIdentity,
    check: Option<CheckDescriptor>,
    status: HealthStatus,
    last_update: Instant,
    critical_since: Option<Instant>,
    output: String,
}

enum Scripted {
    Respond(QueryResponse),
    Fail(BackendError),
}

enum NextQuery {
    Script(Scripted),
    Park,
    Live,
}

const NODE_NAME: &str = "memory-node";

/// Expiry wakeups land this far past the deadline so `expired` holds.
const TIMER_RESOLUTION: Duration = Duration::from_millis(1);

/// A deadline passes strictly after it is reached; an update landing exactly
/// on the deadline still counts.
fn expired(deadline: Instant, now: Instant) -> bool {
    now > deadline
}

impl MemoryBackend {
    /// Create an empty backend serving live state.
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Create a backend whose blocking queries only answer from the script.
    pub fn scripted() -> Self {
        Self::build(true)
    }

    fn build(scripted: bool) -> Self {
        let (changes, _) = watch::channel(1);
        let (queries, _) = watch::channel(0);
        let (registration_gate, _) = watch::channel(false);
        let (held_registrations, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner {
                index: 1,
                services: BTreeMap::new(),
                script: VecDeque::new(),
                faults: Faults::default(),
                calls: Calls::default(),
                query_indices: Vec::new(),
            }),
            changes,
            queries,
            registration_gate,
            held_registrations,
            scripted,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- scripting and fault injection ----

    /// Queue a canned blocking-query response.
    pub fn push_response(&self, response: QueryResponse) {
        self.lock().script.push_back(Scripted::Respond(response));
    }

    /// Queue a blocking-query failure.
    pub fn push_failure(&self, error: BackendError) {
        self.lock().script.push_back(Scripted::Fail(error));
    }

    /// Make the next `n` registrations fail as unreachable.
    pub fn fail_next_registrations(&self, n: u32) {
        self.lock().faults.registrations = n;
    }

    /// Make the next registration be rejected with `reason`.
    pub fn reject_next_registration(&self, reason: impl Into<String>) {
        self.lock().faults.rejection = Some(reason.into());
    }

    /// Make the next `n` TTL updates fail as unreachable.
    pub fn fail_next_updates(&self, n: u32) {
        self.lock().faults.updates = n;
    }

    /// Make the next `n` deregistrations fail as unreachable.
    pub fn fail_next_deregistrations(&self, n: u32) {
        self.lock().faults.deregistrations = n;
    }

    /// Make the next `n` live blocking queries fail as unreachable.
    pub fn fail_next_queries(&self, n: u32) {
        self.lock().faults.queries = n;
    }

    /// Park registrations until `release_registrations`.
    pub fn hold_registrations(&self) {
        self.registration_gate.send_replace(true);
    }

    /// Let held and future registrations through.
    pub fn release_registrations(&self) {
        self.registration_gate.send_replace(false);
    }

    /// Wait until at least `n` registrations have been parked by the gate.
    pub async fn wait_for_held_registrations(&self, n: usize) {
        let mut rx = self.held_registrations.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    // ---- direct state manipulation ----

    /// Add another member without a TTL check; it keeps `status` until changed.
    pub fn add_service(&self, identity: ServiceIdentity, status: HealthStatus) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.services.insert(
            identity.service_id().to_string(),
            Registration {
                identity,
                check: None,
                status,
                last_update: now,
                critical_since: None,
                output: String::new(),
            },
        );
        self.bump(&mut inner);
    }

    /// Change the status of a member added with [`add_service`](Self::add_service).
    pub fn set_service_status(&self, service_id: &str, status: HealthStatus) {
        let mut inner = self.lock();
        let changed = match inner.services.get_mut(service_id) {
            Some(reg) if reg.status != status => {
                reg.status = status;
                true
            }
            _ => false,
        };
        if changed {
            self.bump(&mut inner);
        }
    }

    /// Drop a member.
    pub fn remove_service(&self, service_id: &str) {
        let mut inner = self.lock();
        if inner.services.remove(service_id).is_some() {
            self.bump(&mut inner);
        }
    }

    /// Simulate a backend restart that lost its index.
    pub fn reset_index(&self, index: u64) {
        let mut inner = self.lock();
        inner.index = index;
        self.changes.send_replace(index);
    }

    // ---- inspection ----

    /// Current modify index.
    pub fn index(&self) -> u64 {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.index
    }

    /// Status of a registered service, `None` once it is gone.
    pub fn service_status(&self, service_id: &str) -> Option<HealthStatus> {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.services.get(service_id).map(|reg| reg.status)
    }

    /// Whether a service is currently registered.
    pub fn is_registered(&self, service_id: &str) -> bool {
        self.service_status(service_id).is_some()
    }

    /// Output attached to the last TTL update of a service's check.
    pub fn check_output(&self, service_id: &str) -> Option<String> {
        self.lock()
            .services
            .get(service_id)
            .map(|reg| reg.output.clone())
    }

    pub fn register_calls(&self) -> usize {
        self.lock().calls.register
    }

    pub fn deregister_calls(&self) -> usize {
        self.lock().calls.deregister
    }

    pub fn update_calls(&self) -> usize {
        self.lock().calls.update
    }

    /// Blocking indices of every query received, in order.
    pub fn query_indices(&self) -> Vec<u64> {
        self.lock().query_indices.clone()
    }

    pub fn query_calls(&self) -> usize {
        self.lock().query_indices.len()
    }

    /// Wait until at least `n` blocking queries have been received.
    pub async fn wait_for_queries(&self, n: usize) {
        let mut rx = self.queries.subscribe();
        // The sender lives in `self`, so this only returns once the count is reached.
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    // ---- internals ----

    async fn pass_registration_gate(&self) {
        let mut gate = self.registration_gate.subscribe();
        if !*gate.borrow_and_update() {
            return;
        }
        self.held_registrations.send_modify(|count| *count += 1);
        let _ = gate.wait_for(|held| !*held).await;
    }

    fn bump(&self, inner: &mut Inner) {
        inner.index += 1;
        self.changes.send_replace(inner.index);
    }

    /// Apply TTL expiry and reaping up to `now`.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        let mut changed = false;

        inner.services.retain(|id, reg| {
            let Some(check) = &reg.check else {
                return true;
            };

            if reg.status != HealthStatus::Critical && expired(reg.last_update + check.ttl(), now) {
                tracing::debug!(service_id = %id, "TTL expired, check is now critical");
                reg.status = HealthStatus::Critical;
                reg.critical_since = Some(reg.last_update + check.ttl());
                changed = true;
            }

            match reg.critical_since {
                Some(since) if reg.status == HealthStatus::Critical
                    && expired(since + check.deregister_after(), now) =>
                {
                    tracing::debug!(service_id = %id, "Critical for too long, deregistering");
                    changed = true;
                    false
                }
                _ => true,
            }
        });

        if changed {
            self.bump(inner);
        }
    }

    /// Earliest instant at which `refresh` would change something.
    fn next_expiry(inner: &Inner) -> Option<Instant> {
        inner
            .services
            .values()
            .filter_map(|reg| {
                let check = reg.check.as_ref()?;
                let deadline = match (reg.status, reg.critical_since) {
                    (HealthStatus::Critical, Some(since)) => since + check.deregister_after(),
                    (HealthStatus::Critical, None) => return None,
                    _ => reg.last_update + check.ttl(),
                };
                Some(deadline + TIMER_RESOLUTION)
            })
            .min()
    }

    fn snapshot(inner: &Inner, query: &BlockingQuery) -> QueryResponse {
        let entries = inner
            .services
            .values()
            .filter(|reg| reg.identity.service_name() == query.service)
            .filter(|reg| match &query.tag {
                Some(tag) => reg.identity.tags().contains(tag),
                None => true,
            })
            .filter(|reg| !query.passing_only || reg.status.is_passing())
            .map(|reg| {
                let identity = &reg.identity;
                let mut entry = ServiceEntry::new(
                    NODE_NAME,
                    identity.service_id(),
                    identity.service_name(),
                    identity.address(),
                    identity.port(),
                    reg.status,
                )
                .with_tags(identity.tags().iter().cloned());
                for (key, value) in identity.metadata() {
                    entry = entry.with_meta(key, value);
                }
                entry
            })
            .collect();

        QueryResponse {
            index: inner.index,
            entries,
        }
    }

    fn register_now(
        &self,
        identity: &ServiceIdentity,
        check: &CheckDescriptor,
    ) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.calls.register += 1;

        if inner.faults.registrations > 0 {
            inner.faults.registrations -= 1;
            return Err(BackendError::Unreachable("injected registration failure".into()));
        }
        if let Some(reason) = inner.faults.rejection.take() {
            return Err(BackendError::Rejected {
                status: 400,
                message: reason,
            });
        }
        if identity.port() == 0 {
            return Err(BackendError::Rejected {
                status: 400,
                message: "Invalid service port".into(),
            });
        }

        // TTL checks start critical until the first update arrives.
        inner.services.insert(
            identity.service_id().to_string(),
            Registration {
                identity: identity.clone(),
                check: Some(check.clone()),
                status: HealthStatus::Critical,
                last_update: now,
                critical_since: Some(now),
                output: String::new(),
            },
        );
        self.bump(&mut inner);
        Ok(())
    }

    fn deregister_now(&self, service_id: &str) -> Result<(), BackendError> {
        let mut inner = self.lock();
        inner.calls.deregister += 1;

        if inner.faults.deregistrations > 0 {
            inner.faults.deregistrations -= 1;
            return Err(BackendError::Unreachable("injected deregistration failure".into()));
        }

        match inner.services.remove(service_id) {
            Some(_) => {
                self.bump(&mut inner);
                Ok(())
            }
            None => Err(BackendError::Rejected {
                status: 404,
                message: format!("Unknown service ID {:?}", service_id),
            }),
        }
    }

    fn update_now(
        &self,
        check_id: &str,
        status: HealthStatus,
        output: &str,
    ) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.calls.update += 1;

        if inner.faults.updates > 0 {
            inner.faults.updates -= 1;
            return Err(BackendError::Unreachable("injected update failure".into()));
        }

        self.refresh(&mut inner, now);

        let Some(reg) = inner.services.values_mut().find(|reg| {
            reg.check
                .as_ref()
                .is_some_and(|check| check.check_id() == check_id)
        }) else {
            return Err(BackendError::Rejected {
                status: 404,
                message: format!("CheckID {:?} does not have associated TTL", check_id),
            });
        };

        reg.last_update = now;
        reg.output = output.to_string();
        reg.critical_since = (status == HealthStatus::Critical).then_some(now);
        let changed = reg.status != status;
        reg.status = status;

        if changed {
            self.bump(&mut inner);
        }
        Ok(())
    }

    fn next_query(&self, query: &BlockingQuery) -> Result<NextQuery, BackendError> {
        let mut inner = self.lock();
        inner.query_indices.push(query.index);
        self.queries.send_replace(inner.query_indices.len());

        if let Some(scripted) = inner.script.pop_front() {
            return Ok(NextQuery::Script(scripted));
        }
        if self.scripted {
            return Ok(NextQuery::Park);
        }
        if inner.faults.queries > 0 {
            inner.faults.queries -= 1;
            return Err(BackendError::Unreachable("injected query failure".into()));
        }
        Ok(NextQuery::Live)
    }

    async fn query_now(&self, query: &BlockingQuery) -> Result<QueryResponse, BackendError> {
        match self.next_query(query)? {
            NextQuery::Script(Scripted::Respond(response)) => return Ok(response),
            NextQuery::Script(Scripted::Fail(error)) => return Err(error),
            NextQuery::Park => std::future::pending::<()>().await,
            NextQuery::Live => {}
        }

        let deadline = Instant::now() + query.wait;
        let mut changes = self.changes.subscribe();

        loop {
            let now = Instant::now();
            let wake = {
                let mut inner = self.lock();
                self.refresh(&mut inner, now);

                if query.index == 0 || inner.index > query.index || now >= deadline {
                    return Ok(Self::snapshot(&inner, query));
                }

                Self::next_expiry(&inner).map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                _ = changes.changed() => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryBackend for MemoryBackend {
    fn register<'a>(
        &'a self,
        identity: &'a ServiceIdentity,
        check: &'a CheckDescriptor,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.pass_registration_gate().await;
            self.register_now(identity, check)
        })
    }

    fn deregister<'a>(&'a self, service_id: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.deregister_now(service_id) })
    }

    fn update_check<'a>(
        &'a self,
        check_id: &'a str,
        status: HealthStatus,
        output: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move { self.update_now(check_id, status, output) })
    }

    fn blocking_query<'a>(&'a self, query: &'a BlockingQuery) -> BackendFuture<'a, QueryResponse> {
        Box::pin(self.query_now(query))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
