//! Coordination Service
//!
//! Leased locks, optimistically versioned shared state and barriers for
//! agents that are scheduled independently of each other.
//!
//! # Features
//! - EXCLUSIVE/SHARED leases; contention blocks until release, lease expiry
//!   or `lock_wait_timeout`, whichever comes first
//! - Idempotent release and token-checked renewal
//! - Version-checked `set_state` plus a retrying `update_state`
//! - Reusable named barriers
//! - Background sweep reclaiming expired leases and stale barriers
//!
//! The same [`Coordinator`] calls work in-process on a
//! [`CoordinationService`] and remotely through a
//! [`CoordinationClient`](super::CoordinationClient).

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::barrier::{BarrierRegistry, BarrierStatus};
use super::error::{CoordinationError, CoordinationResult};
use super::locks::{Lock, LockTable, LockType};
use super::protocol::RemoteCalls;
use super::state::{SharedState, StateStore};
use crate::bus::{CoordinationMessage, MessageBus};
use crate::config::duration_ms;

/// Coordination service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// How long a contended acquisition blocks; zero fails fast
    #[serde(with = "duration_ms")]
    pub lock_wait_timeout: Duration,
    /// Lease used when a caller passes a zero ttl
    #[serde(with = "duration_ms")]
    pub default_lease: Duration,
    /// Interval of the expired-lease sweep
    #[serde(with = "duration_ms")]
    pub sweep_interval: Duration,
    /// Attempts made by `update_state` before giving up
    pub state_update_retries: u32,
    /// Backoff unit between `update_state` attempts, multiplied by the attempt
    #[serde(with = "duration_ms")]
    pub state_update_backoff: Duration,
    /// Broadcast lock releases on the attached bus
    pub announce_releases: bool,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            lock_wait_timeout: Duration::from_secs(30),
            default_lease: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(5),
            state_update_retries: 5,
            state_update_backoff: Duration::from_millis(10),
            announce_releases: false,
        }
    }
}

impl CoordinationConfig {
    pub fn with_lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn with_default_lease(mut self, lease: Duration) -> Self {
        self.default_lease = lease;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_state_update_retries(mut self, retries: u32) -> Self {
        self.state_update_retries = retries;
        self
    }

    pub fn with_announce_releases(mut self, announce: bool) -> Self {
        self.announce_releases = announce;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_lease.is_zero() {
            return Err("coordination.default_lease must be greater than 0".to_string());
        }
        if self.sweep_interval.is_zero() {
            return Err("coordination.sweep_interval must be greater than 0".to_string());
        }
        if self.state_update_retries == 0 {
            return Err("coordination.state_update_retries must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Coordination primitives, callable locally or across the bus
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Identity recorded as lock holder, state writer and barrier arrival
    fn agent_id(&self) -> &str;

    /// Acquire a lease on `resource`; a zero `ttl` uses the default lease
    async fn acquire_lock(
        &self,
        resource: &str,
        lock_type: LockType,
        ttl: Duration,
    ) -> CoordinationResult<Lock>;

    async fn renew_lock(&self, token: &str, ttl: Duration) -> CoordinationResult<Lock>;

    /// Idempotent: unknown, expired and already released tokens succeed
    async fn release_lock(&self, token: &str) -> CoordinationResult<()>;

    async fn get_state(&self, key: &str) -> CoordinationResult<Option<SharedState>>;

    /// Write `value` only if `key` is still at `expected_version` (0 creates)
    async fn set_state(
        &self,
        key: &str,
        value: Map<String, Value>,
        expected_version: u64,
    ) -> CoordinationResult<SharedState>;

    /// Set one field, retrying internally on version conflicts
    async fn update_state(&self, key: &str, field: &str, value: Value)
        -> CoordinationResult<SharedState>;

    async fn wait_at_barrier(
        &self,
        name: &str,
        required: usize,
        timeout: Duration,
    ) -> CoordinationResult<()>;
}

/// Coordination statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationStats {
    pub agent_id: String,
    pub active_locks: usize,
    pub locks_acquired: u64,
    pub lock_conflicts: u64,
    pub locks_reclaimed: u64,
    pub state_keys: usize,
    pub version_conflicts: u64,
    pub active_barriers: usize,
    pub barriers_released: u64,
    pub barrier_timeouts: u64,
}

struct ServiceInner {
    agent_id: String,
    config: CoordinationConfig,
    locks: LockTable,
    state: StateStore,
    barriers: BarrierRegistry,
    remote: RemoteCalls,
    bus: RwLock<Option<MessageBus>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// In-process coordination authority
///
/// Cheap to clone; clones share one lock table, state table and barrier
/// table. Nothing is global: two services never see each other's state.
#[derive(Clone)]
pub struct CoordinationService {
    inner: Arc<ServiceInner>,
}

impl CoordinationService {
    pub fn new(agent_id: impl Into<String>, config: CoordinationConfig) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                agent_id: agent_id.into(),
                config,
                locks: LockTable::new(),
                state: StateStore::new(),
                barriers: BarrierRegistry::new(),
                remote: RemoteCalls::new(),
                bus: RwLock::new(None),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.inner.config
    }

    /// Spawn the background sweep; later calls are no-ops
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        tokio::spawn(sweep_loop(self.clone()));
        info!(agent_id = %self.inner.agent_id, "coordination service started");
    }

    /// Stop the sweep, release this agent's leases and fail blocked callers
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let held = self.inner.locks.held_by(&self.inner.agent_id);
        for lock in &held {
            self.inner.locks.release(&lock.token);
        }
        info!(
            agent_id = %self.inner.agent_id,
            released = held.len(),
            "coordination service stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_running(&self) -> CoordinationResult<()> {
        if self.is_stopped() {
            return Err(CoordinationError::Stopped);
        }
        Ok(())
    }

    pub(crate) fn remote_calls(&self) -> &RemoteCalls {
        &self.inner.remote
    }

    pub(crate) fn set_bus(&self, bus: MessageBus) {
        *self.inner.bus.write() = Some(bus);
    }

    fn lease(&self, ttl: Duration) -> Duration {
        if ttl.is_zero() {
            self.inner.config.default_lease
        } else {
            ttl
        }
    }

    /// Acquire on behalf of `holder`, waiting up to `wait` under contention
    pub async fn acquire_lock_as(
        &self,
        holder: &str,
        resource: &str,
        lock_type: LockType,
        ttl: Duration,
        wait: Duration,
    ) -> CoordinationResult<Lock> {
        self.ensure_running()?;
        if resource.is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "lock resource must not be empty".to_string(),
            ));
        }
        let ttl = self.lease(ttl);
        let started = Instant::now();
        let deadline = started.checked_add(wait).unwrap_or(started);

        loop {
            let notifier = self.inner.locks.notifier(resource);
            // Created before the attempt so a release in between is not missed
            let released = notifier.notified();
            tokio::pin!(released);

            let contention = match self.inner.locks.try_acquire(resource, lock_type, holder, ttl) {
                Ok(lock) => {
                    debug!(
                        resource = %resource,
                        holder = %holder,
                        lock_type = ?lock_type,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "lock acquired"
                    );
                    return Ok(lock);
                }
                Err(contention) => contention,
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    resource = %resource,
                    holder = %holder,
                    holders = ?contention.holders,
                    "lock conflict"
                );
                return Err(CoordinationError::LockConflict {
                    resource: resource.to_string(),
                    holders: contention.holders,
                });
            }

            let wake = contention
                .frees_at
                .map(|at| now + (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .map_or(deadline, |at| at.min(deadline));

            debug!(resource = %resource, holder = %holder, "waiting for lock");
            tokio::select! {
                _ = &mut released => {}
                _ = tokio::time::sleep_until(wake.into()) => {}
                _ = self.inner.shutdown.cancelled() => return Err(CoordinationError::Stopped),
            }
        }
    }

    /// Extend a lease held under `token`
    pub fn renew(&self, token: &str, ttl: Duration) -> CoordinationResult<Lock> {
        self.ensure_running()?;
        self.inner.locks.renew(token, self.lease(ttl))
    }

    /// Release `token`; returns the lease if it was still live
    pub async fn release(&self, token: &str) -> Option<Lock> {
        let released = self.inner.locks.release(token)?;
        debug!(resource = %released.resource, holder = %released.holder, "lock released");
        if self.inner.config.announce_releases {
            let announced = self
                .broadcast("lock_released", &released.resource, json!({ "holder": released.holder }))
                .await;
            if let Err(e) = announced {
                debug!(resource = %released.resource, error = %e, "release not announced");
            }
        }
        Some(released)
    }

    pub fn set_state_as(
        &self,
        updated_by: &str,
        key: &str,
        value: Map<String, Value>,
        expected_version: u64,
    ) -> CoordinationResult<SharedState> {
        self.ensure_running()?;
        if key.is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "state key must not be empty".to_string(),
            ));
        }
        self.inner.state.set(key, value, expected_version, updated_by)
    }

    /// Bounded read-modify-write of `key`
    ///
    /// `apply` sees the current value (empty when the key is absent) and may
    /// run more than once when concurrent writers win the race.
    pub async fn modify_state_as<F>(
        &self,
        updated_by: &str,
        key: &str,
        mut apply: F,
    ) -> CoordinationResult<SharedState>
    where
        F: FnMut(&mut Map<String, Value>) + Send,
    {
        let attempts = self.inner.config.state_update_retries.max(1);
        for attempt in 1..=attempts {
            let (mut value, version) = self
                .inner
                .state
                .get(key)
                .map(|current| (current.value, current.version))
                .unwrap_or_default();
            apply(&mut value);

            match self.set_state_as(updated_by, key, value, version) {
                Ok(state) => return Ok(state),
                Err(CoordinationError::VersionConflict { actual, .. }) => {
                    debug!(key = %key, attempt, actual, "state update lost a race, retrying");
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.state_update_backoff * attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(key = %key, attempts, "state update retries exhausted");
        Err(CoordinationError::UpdateRetriesExhausted {
            key: key.to_string(),
            attempts,
        })
    }

    pub async fn update_state_as(
        &self,
        updated_by: &str,
        key: &str,
        field: &str,
        value: Value,
    ) -> CoordinationResult<SharedState> {
        self.modify_state_as(updated_by, key, |current| {
            current.insert(field.to_string(), value.clone());
        })
        .await
    }

    /// Arrive at a barrier as `agent`; fails with `Stopped` on shutdown
    pub async fn wait_at_barrier_as(
        &self,
        agent: &str,
        name: &str,
        required: usize,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        self.ensure_running()?;
        tokio::select! {
            result = self.inner.barriers.wait(name, agent, required, timeout) => result,
            _ = self.inner.shutdown.cancelled() => Err(CoordinationError::Stopped),
        }
    }

    pub fn delete_state(&self, key: &str) -> Option<SharedState> {
        self.inner.state.delete(key)
    }

    /// Keys present in the shared state table, sorted
    pub fn list_state(&self) -> Vec<String> {
        self.inner.state.keys()
    }

    pub fn locks_for(&self, resource: &str) -> Vec<Lock> {
        self.inner.locks.locks_for(resource)
    }

    /// Number of live leases
    pub fn lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    pub fn barrier_status(&self, name: &str) -> Option<BarrierStatus> {
        self.inner.barriers.status(name)
    }

    /// Reclaim expired leases and time out stale barriers now
    pub fn sweep(&self) -> usize {
        let reclaimed = self.inner.locks.sweep();
        let barriers = self.inner.barriers.sweep();
        if !reclaimed.is_empty() || barriers > 0 {
            debug!(
                locks = reclaimed.len(),
                barriers,
                "expired coordination state reclaimed"
            );
        }
        reclaimed.len()
    }

    /// Announce a coordination event to every agent on the attached bus
    pub async fn broadcast(&self, action: &str, resource: &str, state: Value) -> CoordinationResult<()> {
        let bus = self.inner.bus.read().clone();
        let Some(bus) = bus else {
            return Err(CoordinationError::InvalidArgument(
                "no message bus attached".to_string(),
            ));
        };
        let message = CoordinationMessage::new(action, resource).with_state(state);
        bus.broadcast_coordination(&message)
            .await
            .map_err(|e| CoordinationError::Remote(e.to_string()))
    }

    pub fn stats(&self) -> CoordinationStats {
        let locks = self.inner.locks.counters();
        let barriers = self.inner.barriers.counters();
        CoordinationStats {
            agent_id: self.inner.agent_id.clone(),
            active_locks: self.inner.locks.len(),
            locks_acquired: locks.acquired.load(Ordering::Relaxed),
            lock_conflicts: locks.conflicts.load(Ordering::Relaxed),
            locks_reclaimed: locks.reclaimed.load(Ordering::Relaxed),
            state_keys: self.inner.state.len(),
            version_conflicts: self.inner.state.version_conflicts(),
            active_barriers: self.inner.barriers.len(),
            barriers_released: barriers.released.load(Ordering::Relaxed),
            barrier_timeouts: barriers.timeouts.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Coordinator for CoordinationService {
    fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        lock_type: LockType,
        ttl: Duration,
    ) -> CoordinationResult<Lock> {
        self.acquire_lock_as(
            &self.inner.agent_id,
            resource,
            lock_type,
            ttl,
            self.inner.config.lock_wait_timeout,
        )
        .await
    }

    async fn renew_lock(&self, token: &str, ttl: Duration) -> CoordinationResult<Lock> {
        self.renew(token, ttl)
    }

    async fn release_lock(&self, token: &str) -> CoordinationResult<()> {
        self.release(token).await;
        Ok(())
    }

    async fn get_state(&self, key: &str) -> CoordinationResult<Option<SharedState>> {
        Ok(self.inner.state.get(key))
    }

    async fn set_state(
        &self,
        key: &str,
        value: Map<String, Value>,
        expected_version: u64,
    ) -> CoordinationResult<SharedState> {
        self.set_state_as(&self.inner.agent_id, key, value, expected_version)
    }

    async fn update_state(
        &self,
        key: &str,
        field: &str,
        value: Value,
    ) -> CoordinationResult<SharedState> {
        self.update_state_as(&self.inner.agent_id, key, field, value)
            .await
    }

    async fn wait_at_barrier(
        &self,
        name: &str,
        required: usize,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        self.wait_at_barrier_as(&self.inner.agent_id, name, required, timeout)
            .await
    }
}

async fn sweep_loop(service: CoordinationService) {
    let mut ticker = tokio::time::interval(service.inner.config.sweep_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = service.inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                service.sweep();
            }
        }
    }
    debug!(agent_id = %service.inner.agent_id, "coordination sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn service() -> CoordinationService {
        CoordinationService::new(
            "coordinator",
            CoordinationConfig::default().with_lock_wait_timeout(Duration::from_millis(200)),
        )
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_zero_wait_fails_fast() {
        let svc = service();
        svc.acquire_lock_as("a", "db", LockType::Exclusive, Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();

        let started = Instant::now();
        let err = svc
            .acquire_lock_as("b", "db", LockType::Exclusive, Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(
            err,
            CoordinationError::LockConflict {
                resource: "db".into(),
                holders: vec!["a".into()]
            }
        );
    }

    #[tokio::test]
    async fn test_blocked_acquire_wakes_on_release() {
        let svc = service();
        let lock = svc
            .acquire_lock_as("a", "db", LockType::Exclusive, Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();

        let waiter = {
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.acquire_lock_as(
                    "b",
                    "db",
                    LockType::Exclusive,
                    Duration::from_secs(5),
                    Duration::from_secs(5),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(svc.release(&lock.token).await.is_some());

        let acquired = waiter.await.unwrap().unwrap();
        assert_eq!(acquired.holder, "b");
    }

    #[tokio::test]
    async fn test_blocked_acquire_wakes_on_expiry() {
        let svc = service();
        svc.acquire_lock_as("a", "db", LockType::Exclusive, Duration::from_millis(50), Duration::ZERO)
            .await
            .unwrap();

        let acquired = svc
            .acquire_lock_as(
                "b",
                "db",
                LockType::Exclusive,
                Duration::from_secs(5),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(acquired.holder, "b");
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let svc = service();
        let lock = svc.acquire_lock("db", LockType::Shared, Duration::ZERO).await.unwrap();
        assert_eq!(lock.holder, "coordinator");

        assert!(svc.release_lock(&lock.token).await.is_ok());
        assert!(svc.release_lock(&lock.token).await.is_ok());
        assert!(svc.release_lock("unknown").await.is_ok());
        assert_eq!(svc.lock_count(), 0);
    }

    #[tokio::test]
    async fn test_set_state_rejects_stale_version() {
        let svc = service();
        let first = svc.set_state("cfg", object(json!({"v": 1})), 0).await.unwrap();
        svc.set_state("cfg", object(json!({"v": 2})), first.version)
            .await
            .unwrap();

        let err = svc
            .set_state("cfg", object(json!({"v": 3})), first.version)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::VersionConflict { .. }));
        let current = svc.get_state("cfg").await.unwrap().unwrap();
        assert_eq!(current.value.get("v"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_modify_state_retries_conflicts() {
        let svc = service();
        svc.set_state("counter", object(json!({"n": 0})), 0).await.unwrap();

        // The first attempt races against a concurrent writer
        let interfered = AtomicUsize::new(0);
        let updated = svc
            .modify_state_as("a", "counter", |value| {
                if interfered.fetch_add(1, Ordering::SeqCst) == 0 {
                    let _ = svc.set_state_as("b", "counter", object(json!({"n": 10})), 1);
                }
                let n = value.get("n").and_then(Value::as_i64).unwrap_or(0);
                value.insert("n".into(), json!(n + 1));
            })
            .await
            .unwrap();

        assert_eq!(updated.value.get("n"), Some(&json!(11)));
        assert_eq!(updated.version, 3);
        assert_eq!(interfered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_update_state_sets_field() {
        let svc = service();
        svc.update_state("job", "phase", json!("build")).await.unwrap();
        let state = svc.update_state("job", "owner", json!("a")).await.unwrap();

        assert_eq!(state.version, 2);
        assert_eq!(state.value.get("phase"), Some(&json!("build")));
        assert_eq!(state.value.get("owner"), Some(&json!("a")));
        assert_eq!(svc.list_state(), vec!["job".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_releases_own_locks() {
        let svc = service();
        svc.acquire_lock("mine", LockType::Exclusive, Duration::ZERO)
            .await
            .unwrap();
        svc.acquire_lock_as("other", "theirs", LockType::Exclusive, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap();

        svc.shutdown();
        assert!(svc.locks_for("mine").is_empty());
        assert_eq!(svc.locks_for("theirs").len(), 1);
        assert_eq!(
            svc.acquire_lock("x", LockType::Shared, Duration::ZERO).await,
            Err(CoordinationError::Stopped)
        );
    }

    #[tokio::test]
    async fn test_shutdown_unblocks_waiters() {
        let svc = service();
        svc.acquire_lock_as("a", "db", LockType::Exclusive, Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
        let waiter = {
            let svc = svc.clone();
            tokio::spawn(async move {
                svc.acquire_lock_as(
                    "b",
                    "db",
                    LockType::Exclusive,
                    Duration::from_secs(5),
                    Duration::from_secs(10),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        svc.shutdown();
        assert_eq!(waiter.await.unwrap(), Err(CoordinationError::Stopped));
    }

    #[tokio::test]
    async fn test_sweep_loop_reclaims() {
        let svc = CoordinationService::new(
            "coordinator",
            CoordinationConfig::default().with_sweep_interval(Duration::from_millis(20)),
        );
        svc.start();
        svc.acquire_lock("db", LockType::Exclusive, Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(svc.stats().locks_reclaimed, 1);
        svc.shutdown();
    }

    #[tokio::test]
    async fn test_broadcast_requires_bus() {
        let svc = service();
        assert!(matches!(
            svc.broadcast("noop", "r", Value::Null).await,
            Err(CoordinationError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(CoordinationConfig::default().validate().is_ok());
        assert!(CoordinationConfig::default()
            .with_state_update_retries(0)
            .validate()
            .is_err());
    }
}
