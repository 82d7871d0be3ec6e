//! Coordination over the message bus
//!
//! A [`CoordinationService`] attached to a bus answers COORDINATION
//! requests from remote agents; [`CoordinationClient`] issues them. The
//! remote agent is the holder, writer or arrival, exactly as if it had
//! called the service in-process.
//!
//! A client that stops waiting for a lock or barrier sends a `cancel` for
//! that request. The server then abandons the wait, or releases the lease
//! if it was granted after the caller left.

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{CoordinationError, CoordinationResult};
use super::locks::{Lock, LockType};
use super::service::{CoordinationConfig, CoordinationService, Coordinator};
use super::state::SharedState;
use crate::bus::{handler_fn, AgentMessage, MessageBus, MessageType};
use crate::config::{duration_ms, option_duration_ms};

/// `payload_type` of coordination requests
pub const COORDINATION_REQUEST_PAYLOAD: &str = "coordination_request";

/// Extra time a client waits beyond the server-side bound
const RESPONSE_SLACK: Duration = Duration::from_secs(2);

/// Entries kept of granted leases and of cancels that beat their request
const REMOTE_MEMORY: usize = 1024;

/// One coordination call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CoordinationRequest {
    AcquireLock {
        resource: String,
        lock_type: LockType,
        #[serde(rename = "ttl_ms", with = "duration_ms")]
        ttl: Duration,
        /// Contention wait, capped by the server's `lock_wait_timeout`
        #[serde(
            rename = "wait_ms",
            default,
            with = "option_duration_ms",
            skip_serializing_if = "Option::is_none"
        )]
        wait: Option<Duration>,
    },
    RenewLock {
        token: String,
        #[serde(rename = "ttl_ms", with = "duration_ms")]
        ttl: Duration,
    },
    ReleaseLock {
        token: String,
    },
    GetState {
        key: String,
    },
    SetState {
        key: String,
        value: Map<String, Value>,
        expected_version: u64,
    },
    UpdateState {
        key: String,
        field: String,
        value: Value,
    },
    WaitAtBarrier {
        name: String,
        required: usize,
        #[serde(rename = "timeout_ms", with = "duration_ms")]
        timeout: Duration,
    },
    /// The caller stopped waiting for request `request_id`; never answered
    Cancel {
        request_id: String,
    },
}

impl CoordinationRequest {
    /// Requests that may wait server-side and so can be abandoned
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            CoordinationRequest::AcquireLock { .. } | CoordinationRequest::WaitAtBarrier { .. }
        )
    }
}

/// Answer to a [`CoordinationRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", content = "body", rename_all = "snake_case")]
pub enum CoordinationReply {
    Ok(Value),
    Error(CoordinationError),
}

impl From<CoordinationResult<Value>> for CoordinationReply {
    fn from(result: CoordinationResult<Value>) -> Self {
        match result {
            Ok(value) => CoordinationReply::Ok(value),
            Err(e) => CoordinationReply::Error(e),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> CoordinationResult<Value> {
    serde_json::to_value(value).map_err(|e| CoordinationError::Remote(e.to_string()))
}

fn decode<T: DeserializeOwned>(value: Value) -> CoordinationResult<T> {
    serde_json::from_value(value).map_err(|e| CoordinationError::Remote(e.to_string()))
}

fn remote_key(caller: &str, request_id: &str) -> String {
    format!("{}/{}", caller, request_id)
}

struct RemoteTable {
    in_flight: HashMap<String, CancellationToken>,
    /// Leases handed to blocking requests, in case their caller already left
    granted: LruCache<String, String>,
    /// Cancels that arrived before their request
    cancelled: LruCache<String, ()>,
}

/// Blocking requests served on behalf of remote callers
pub(crate) struct RemoteCalls {
    table: Mutex<RemoteTable>,
}

impl RemoteCalls {
    pub(crate) fn new() -> Self {
        let memory = NonZeroUsize::new(REMOTE_MEMORY).unwrap_or(NonZeroUsize::MIN);
        Self {
            table: Mutex::new(RemoteTable {
                in_flight: HashMap::new(),
                granted: LruCache::new(memory),
                cancelled: LruCache::new(memory),
            }),
        }
    }

    /// Register a request; `None` when its cancel already arrived
    fn begin(&self, key: &str) -> Option<CancellationToken> {
        let mut table = self.table.lock();
        if table.cancelled.pop(key).is_some() {
            return None;
        }
        let token = CancellationToken::new();
        table.in_flight.insert(key.to_string(), token.clone());
        Some(token)
    }

    /// Settle a request; returns the lease to release when its caller left
    fn finish(&self, key: &str, abandoned: &CancellationToken, lease: Option<&str>) -> Option<String> {
        let mut table = self.table.lock();
        table.in_flight.remove(key);
        let lease = lease?;
        if abandoned.is_cancelled() {
            return Some(lease.to_string());
        }
        table.granted.put(key.to_string(), lease.to_string());
        None
    }

    /// Abandon a request; returns a lease that was granted too late
    fn abandon(&self, key: &str) -> Option<String> {
        let mut table = self.table.lock();
        if let Some(token) = table.in_flight.get(key) {
            token.cancel();
            return None;
        }
        if let Some(lease) = table.granted.pop(key) {
            return Some(lease);
        }
        table.cancelled.put(key.to_string(), ());
        None
    }

    /// Blocking requests currently being served
    pub(crate) fn in_flight(&self) -> usize {
        self.table.lock().in_flight.len()
    }
}

impl CoordinationService {
    /// Serve the coordination protocol on `bus`
    ///
    /// Also makes `bus` the channel for [`broadcast`](Self::broadcast) and
    /// release announcements.
    pub fn attach(&self, bus: &MessageBus) {
        self.set_bus(bus.clone());
        let service = self.clone();
        bus.register_handler(
            MessageType::Coordination,
            handler_fn(move |bus, message| {
                let service = service.clone();
                async move { service.serve_message(&bus, message).await }
            }),
        );
        debug!(agent_id = %bus.agent_id(), "coordination protocol attached");
    }

    /// Remote lock acquisitions and barrier waits still being served
    pub fn remote_waits(&self) -> usize {
        self.remote_calls().in_flight()
    }

    async fn serve_message(&self, bus: &MessageBus, message: AgentMessage) -> anyhow::Result<()> {
        // Announcements share the message type but carry no request
        if message.payload_type.as_deref() != Some(COORDINATION_REQUEST_PAYLOAD) {
            return Ok(());
        }

        let reply = match serde_json::from_value::<CoordinationRequest>(message.payload.clone()) {
            Ok(CoordinationRequest::Cancel { request_id }) => {
                self.abandon_remote(&message.from, &request_id).await;
                return Ok(());
            }
            Ok(request) if request.is_blocking() => self
                .serve_blocking(&message.from, &message.id, request)
                .await
                .into(),
            Ok(request) => self.serve(&message.from, request).await.into(),
            Err(e) => {
                warn!(id = %message.id, from = %message.from, error = %e, "bad coordination request");
                CoordinationReply::Error(CoordinationError::InvalidArgument(e.to_string()))
            }
        };
        bus.send_response(&message, serde_json::to_value(&reply)?)
            .await?;
        Ok(())
    }

    /// Serve a request that may wait, giving up if its caller does
    async fn serve_blocking(
        &self,
        caller: &str,
        request_id: &str,
        request: CoordinationRequest,
    ) -> CoordinationResult<Value> {
        let key = remote_key(caller, request_id);
        let Some(abandoned) = self.remote_calls().begin(&key) else {
            debug!(caller = %caller, request_id = %request_id, "request cancelled before it arrived");
            return Err(CoordinationError::Abandoned(request_id.to_string()));
        };
        let grants_lease = matches!(request, CoordinationRequest::AcquireLock { .. });

        // Dropping the served future withdraws a barrier arrival or stops a lock wait
        let result = tokio::select! {
            result = self.serve(caller, request) => result,
            _ = abandoned.cancelled() => Err(CoordinationError::Abandoned(request_id.to_string())),
        };

        let lease = result
            .as_ref()
            .ok()
            .filter(|_| grants_lease)
            .and_then(|lock| lock.get("token"))
            .and_then(Value::as_str);
        if let Some(orphan) = self.remote_calls().finish(&key, &abandoned, lease) {
            self.release(&orphan).await;
            debug!(caller = %caller, request_id = %request_id, "lease of abandoned request released");
        }
        result
    }

    async fn abandon_remote(&self, caller: &str, request_id: &str) {
        let key = remote_key(caller, request_id);
        if let Some(orphan) = self.remote_calls().abandon(&key) {
            self.release(&orphan).await;
            debug!(caller = %caller, request_id = %request_id, "lease of abandoned request released");
        } else {
            debug!(caller = %caller, request_id = %request_id, "remote request abandoned");
        }
    }

    /// Execute one request on behalf of `caller`
    ///
    /// Runs to completion; abandonment is only tracked for requests that
    /// arrive over the bus.
    pub async fn serve(&self, caller: &str, request: CoordinationRequest) -> CoordinationResult<Value> {
        match request {
            CoordinationRequest::AcquireLock {
                resource,
                lock_type,
                ttl,
                wait,
            } => {
                let bound = self.config().lock_wait_timeout;
                let wait = wait.map_or(bound, |w| w.min(bound));
                let lock = self
                    .acquire_lock_as(caller, &resource, lock_type, ttl, wait)
                    .await?;
                encode(&lock)
            }
            CoordinationRequest::RenewLock { token, ttl } => encode(&self.renew(&token, ttl)?),
            CoordinationRequest::ReleaseLock { token } => {
                self.release(&token).await;
                Ok(Value::Null)
            }
            CoordinationRequest::GetState { key } => encode(&self.get_state(&key).await?),
            CoordinationRequest::SetState {
                key,
                value,
                expected_version,
            } => encode(&self.set_state_as(caller, &key, value, expected_version)?),
            CoordinationRequest::UpdateState { key, field, value } => {
                encode(&self.update_state_as(caller, &key, &field, value).await?)
            }
            CoordinationRequest::WaitAtBarrier {
                name,
                required,
                timeout,
            } => {
                self.wait_at_barrier_as(caller, &name, required, timeout)
                    .await?;
                Ok(Value::Null)
            }
            CoordinationRequest::Cancel { request_id } => {
                self.abandon_remote(caller, &request_id).await;
                Ok(Value::Null)
            }
        }
    }
}

/// Tells the authority to drop a blocking request the caller stopped awaiting
struct AbandonGuard {
    bus: MessageBus,
    authority: String,
    request_id: String,
    armed: bool,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cancel = CoordinationRequest::Cancel {
            request_id: std::mem::take(&mut self.request_id),
        };
        let payload = match serde_json::to_value(&cancel) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "cancel not encoded");
                return;
            }
        };
        let message = self
            .bus
            .new_message(std::mem::take(&mut self.authority), MessageType::Coordination, payload)
            .with_payload_type(COORDINATION_REQUEST_PAYLOAD)
            .with_delivery(self.bus.config().request_delivery);
        let bus = self.bus.clone();
        runtime.spawn(async move {
            if let Err(e) = bus.send(&message).await {
                debug!(to = %message.to, error = %e, "cancel not delivered");
            }
        });
    }
}

/// [`Coordinator`] backed by a remote [`CoordinationService`]
#[derive(Clone)]
pub struct CoordinationClient {
    bus: MessageBus,
    authority: String,
    request_timeout: Duration,
    lock_wait: Duration,
}

impl CoordinationClient {
    /// Talk to the service attached to agent `authority`
    pub fn new(bus: MessageBus, authority: impl Into<String>) -> Self {
        let request_timeout = bus.config().request_timeout;
        Self {
            bus,
            authority: authority.into(),
            request_timeout,
            lock_wait: CoordinationConfig::default().lock_wait_timeout,
        }
    }

    /// Bound on the network round trip, excluding any server-side wait
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Contention wait requested for lock acquisitions
    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    async fn call(&self, request: CoordinationRequest, server_wait: Duration) -> CoordinationResult<Value> {
        let message = self
            .bus
            .new_message(self.authority.clone(), MessageType::Coordination, encode(&request)?)
            .with_payload_type(COORDINATION_REQUEST_PAYLOAD)
            .with_delivery(self.bus.config().request_delivery);

        let mut guard = request.is_blocking().then(|| AbandonGuard {
            bus: self.bus.clone(),
            authority: self.authority.clone(),
            request_id: message.id.clone(),
            armed: true,
        });

        let timeout = self.request_timeout + server_wait + RESPONSE_SLACK;
        let response = self.bus.request_with(message, timeout).await;
        if response.is_ok() {
            if let Some(guard) = guard.as_mut() {
                guard.armed = false;
            }
        }
        let response = response.map_err(|e| CoordinationError::Remote(e.to_string()))?;

        match decode::<CoordinationReply>(response.payload)? {
            CoordinationReply::Ok(value) => Ok(value),
            CoordinationReply::Error(e) => Err(e),
        }
    }
}

#[async_trait]
impl Coordinator for CoordinationClient {
    fn agent_id(&self) -> &str {
        self.bus.agent_id()
    }

    async fn acquire_lock(
        &self,
        resource: &str,
        lock_type: LockType,
        ttl: Duration,
    ) -> CoordinationResult<Lock> {
        let request = CoordinationRequest::AcquireLock {
            resource: resource.to_string(),
            lock_type,
            ttl,
            wait: Some(self.lock_wait),
        };
        decode(self.call(request, self.lock_wait).await?)
    }

    async fn renew_lock(&self, token: &str, ttl: Duration) -> CoordinationResult<Lock> {
        let request = CoordinationRequest::RenewLock {
            token: token.to_string(),
            ttl,
        };
        decode(self.call(request, Duration::ZERO).await?)
    }

    async fn release_lock(&self, token: &str) -> CoordinationResult<()> {
        let request = CoordinationRequest::ReleaseLock {
            token: token.to_string(),
        };
        self.call(request, Duration::ZERO).await.map(|_| ())
    }

    async fn get_state(&self, key: &str) -> CoordinationResult<Option<SharedState>> {
        let request = CoordinationRequest::GetState {
            key: key.to_string(),
        };
        decode(self.call(request, Duration::ZERO).await?)
    }

    async fn set_state(
        &self,
        key: &str,
        value: Map<String, Value>,
        expected_version: u64,
    ) -> CoordinationResult<SharedState> {
        let request = CoordinationRequest::SetState {
            key: key.to_string(),
            value,
            expected_version,
        };
        decode(self.call(request, Duration::ZERO).await?)
    }

    async fn update_state(
        &self,
        key: &str,
        field: &str,
        value: Value,
    ) -> CoordinationResult<SharedState> {
        let request = CoordinationRequest::UpdateState {
            key: key.to_string(),
            field: field.to_string(),
            value,
        };
        decode(self.call(request, Duration::ZERO).await?)
    }

    async fn wait_at_barrier(
        &self,
        name: &str,
        required: usize,
        timeout: Duration,
    ) -> CoordinationResult<()> {
        let request = CoordinationRequest::WaitAtBarrier {
            name: name.to_string(),
            required,
            timeout,
        };
        self.call(request, timeout).await.map(|_| ())
    }
}
