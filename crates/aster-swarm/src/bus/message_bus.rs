//! Agent Message Bus
//!
//! Wraps a best-effort [`Transport`] with envelope framing, correlation,
//! deduplication and per-type handler dispatch. Every other component
//! talks to remote agents exclusively through it.
//!
//! # Features
//! - Correlated request/response with a timeout-bounded waiter
//! - Broadcast and directed sends on one shared topic
//! - EXACTLY_ONCE duplicate suppression over a time window
//! - ACKs and resend-until-acknowledged for AT_LEAST_ONCE
//! - TTL enforcement on arrival
//! - Counters for sent/received/dropped messages and request latency

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup::DedupCache;
use super::envelope::{
    AgentMessage, DeliveryMode, MessageType, AGENT_MESSAGE_TOPIC, DEFAULT_TTL_SECONDS,
};
use super::payload::{
    CoordinationMessage, NegotiationMessage, COORDINATION_PAYLOAD, HEARTBEAT_PAYLOAD,
    NEGOTIATION_PAYLOAD,
};
use crate::config::duration_ms;
use crate::transport::{Delivery, Transport, TransportError};

/// Result type alias for message bus operations
pub type MessageBusResult<T> = Result<T, MessageBusError>;

/// Error types for message bus operations
#[derive(Debug, Error)]
pub enum MessageBusError {
    /// No correlated response arrived in time
    #[error("Request timeout: {0}")]
    RequestTimeout(String),

    /// AT_LEAST_ONCE send exhausted its attempts
    #[error("Message {message_id} not acknowledged after {attempts} attempts")]
    NotAcknowledged { message_id: String, attempts: u32 },

    /// Envelope could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Bus already started
    #[error("Message bus already started")]
    AlreadyStarted,

    /// Bus shut down while the caller was waiting
    #[error("Message bus closed")]
    Closed,
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageBusConfig {
    /// Topic carrying all agent traffic
    pub topic: String,
    /// Default timeout for [`MessageBus::send_request`] callers
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    /// TTL stamped on outgoing envelopes
    pub default_ttl_seconds: u64,
    /// Delivery mode used for requests
    pub request_delivery: DeliveryMode,
    /// How long EXACTLY_ONCE ids are remembered
    #[serde(with = "duration_ms")]
    pub dedup_window: Duration,
    /// How often the dedup cache is purged
    #[serde(with = "duration_ms")]
    pub dedup_purge_interval: Duration,
    /// Upper bound on remembered ids
    pub dedup_capacity: usize,
    /// Envelopes kept for [`MessageBus::recent_messages`]
    pub history_size: usize,
    /// Wait per attempt for an ACK in [`MessageBus::send_reliable`]
    #[serde(with = "duration_ms")]
    pub ack_timeout: Duration,
    /// Attempts made by [`MessageBus::send_reliable`]
    pub reliable_send_attempts: u32,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            topic: AGENT_MESSAGE_TOPIC.to_string(),
            request_timeout: Duration::from_secs(30),
            default_ttl_seconds: DEFAULT_TTL_SECONDS,
            request_delivery: DeliveryMode::ExactlyOnce,
            dedup_window: Duration::from_secs(300),
            dedup_purge_interval: Duration::from_secs(60),
            dedup_capacity: 10_000,
            history_size: 100,
            ack_timeout: Duration::from_secs(2),
            reliable_send_attempts: 3,
        }
    }
}

impl MessageBusConfig {
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn with_reliable_send_attempts(mut self, attempts: u32) -> Self {
        self.reliable_send_attempts = attempts;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.topic.is_empty() {
            return Err("bus.topic must not be empty".to_string());
        }
        if self.dedup_window.is_zero() {
            return Err("bus.dedup_window must be greater than 0".to_string());
        }
        if self.dedup_purge_interval.is_zero() {
            return Err("bus.dedup_purge_interval must be greater than 0".to_string());
        }
        if self.reliable_send_attempts == 0 {
            return Err("bus.reliable_send_attempts must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Callback for inbound envelopes of one type
///
/// Handlers run concurrently on their own tasks; an error is logged and
/// counted but never stops the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, bus: &MessageBus, message: AgentMessage) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(MessageBus, AgentMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, bus: &MessageBus, message: AgentMessage) -> anyhow::Result<()> {
        (self.0)(bus.clone(), message).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(MessageBus, AgentMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Why an inbound envelope was not delivered
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Not valid envelope JSON
    Malformed,
    /// Addressed to another agent
    NotForUs,
    /// Older than its TTL
    Expired,
    /// EXACTLY_ONCE id seen before
    Duplicate,
    /// RESPONSE without a waiting request
    UnmatchedResponse,
}

/// Request round-trip latency summary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: u64,
    pub mean_ms: f64,
    pub max_ms: u64,
    pub last_ms: u64,
}

/// Statistics about the message bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBusStats {
    pub agent_id: String,
    pub sent_messages: HashMap<MessageType, u64>,
    pub received_messages: HashMap<MessageType, u64>,
    pub dropped_messages: HashMap<DropReason, u64>,
    pub handler_errors: u64,
    pub acks_sent: u64,
    pub request_timeouts: u64,
    pub pending_requests: usize,
    pub dedup_cache_size: usize,
    pub history_size: usize,
    pub request_latency: LatencyStats,
}

impl MessageBusStats {
    pub fn total_sent(&self) -> u64 {
        self.sent_messages.values().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received_messages.values().sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped_messages.values().sum()
    }

    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped_messages.get(&reason).copied().unwrap_or(0)
    }
}

#[derive(Debug, Default)]
struct BusMetrics {
    sent: HashMap<MessageType, u64>,
    received: HashMap<MessageType, u64>,
    dropped: HashMap<DropReason, u64>,
    handler_errors: u64,
    acks_sent: u64,
    request_timeouts: u64,
    latency_count: u64,
    latency_total_ms: u64,
    latency_max_ms: u64,
    latency_last_ms: u64,
}

impl BusMetrics {
    fn record_latency(&mut self, elapsed: Duration) {
        let ms = elapsed.as_millis() as u64;
        self.latency_count += 1;
        self.latency_total_ms += ms;
        self.latency_max_ms = self.latency_max_ms.max(ms);
        self.latency_last_ms = ms;
    }

    fn latency(&self) -> LatencyStats {
        let mean_ms = if self.latency_count == 0 {
            0.0
        } else {
            self.latency_total_ms as f64 / self.latency_count as f64
        };
        LatencyStats {
            count: self.latency_count,
            mean_ms,
            max_ms: self.latency_max_ms,
            last_ms: self.latency_last_ms,
        }
    }
}

/// A request waiting for its correlated response
struct PendingRequest {
    to: String,
    sent_at: Instant,
    response_sender: oneshot::Sender<AgentMessage>,
}

/// Removes a waiter from its table when the waiting future finishes or is dropped
struct WaiterGuard<'a, T> {
    table: &'a Mutex<HashMap<String, T>>,
    key: &'a str,
}

impl<T> Drop for WaiterGuard<'_, T> {
    fn drop(&mut self) {
        self.table.lock().remove(self.key);
    }
}

struct BusInner {
    agent_id: String,
    config: MessageBusConfig,
    transport: Arc<dyn Transport>,
    handlers: RwLock<HashMap<MessageType, Vec<Arc<dyn MessageHandler>>>>,
    pending_requests: Mutex<HashMap<String, PendingRequest>>,
    pending_acks: Mutex<HashMap<String, oneshot::Sender<()>>>,
    dedup: Mutex<DedupCache>,
    history: Mutex<VecDeque<AgentMessage>>,
    metrics: Mutex<BusMetrics>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

/// Agent-to-agent message bus
///
/// Cheap to clone; clones share one underlying instance.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus for the transport's local peer
    ///
    /// Nothing is received until [`start`](Self::start) is called.
    pub fn new(transport: Arc<dyn Transport>, config: MessageBusConfig) -> Self {
        let agent_id = transport.local_peer_id().to_string();
        let dedup = DedupCache::new(config.dedup_window, config.dedup_capacity);
        Self {
            inner: Arc::new(BusInner {
                agent_id,
                config,
                transport,
                handlers: RwLock::new(HashMap::new()),
                pending_requests: Mutex::new(HashMap::new()),
                pending_acks: Mutex::new(HashMap::new()),
                dedup: Mutex::new(dedup),
                history: Mutex::new(VecDeque::new()),
                metrics: Mutex::new(BusMetrics::default()),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Create and start a bus
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: MessageBusConfig,
    ) -> MessageBusResult<Self> {
        let bus = Self::new(transport, config);
        bus.start().await?;
        Ok(bus)
    }

    /// Subscribe to the agent topic and spawn the receive and purge loops
    pub async fn start(&self) -> MessageBusResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(MessageBusError::AlreadyStarted);
        }

        let deliveries = self
            .inner
            .transport
            .subscribe(&self.inner.config.topic)
            .await?;

        tokio::spawn(receive_loop(self.clone(), deliveries));
        tokio::spawn(purge_loop(self.clone()));

        info!(
            agent_id = %self.inner.agent_id,
            topic = %self.inner.config.topic,
            "message bus started"
        );
        Ok(())
    }

    /// This agent's id
    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn config(&self) -> &MessageBusConfig {
        &self.inner.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Register a handler for `message_type`; several handlers per type are allowed
    pub fn register_handler(&self, message_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner
            .handlers
            .write()
            .entry(message_type)
            .or_default()
            .push(handler);
        debug!(agent_id = %self.inner.agent_id, %message_type, "handler registered");
    }

    /// Number of handlers registered for `message_type`
    pub fn handler_count(&self, message_type: MessageType) -> usize {
        self.inner
            .handlers
            .read()
            .get(&message_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Build an envelope from this agent with the configured default TTL
    pub fn new_message(
        &self,
        to: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> AgentMessage {
        AgentMessage::new(self.inner.agent_id.clone(), to, message_type, payload)
            .with_ttl(self.inner.config.default_ttl_seconds)
    }

    /// Publish an envelope; never waits for delivery confirmation
    pub async fn send(&self, message: &AgentMessage) -> MessageBusResult<()> {
        if self.is_closed() {
            return Err(MessageBusError::Closed);
        }
        let data = message.to_bytes()?;
        self.inner
            .transport
            .publish(&self.inner.config.topic, data)
            .await?;
        *self
            .inner
            .metrics
            .lock()
            .sent
            .entry(message.message_type)
            .or_insert(0) += 1;
        debug!(
            id = %message.id,
            message_type = %message.message_type,
            to = %message.to,
            "message sent"
        );
        Ok(())
    }

    /// Send a REQUEST to `to` and wait for its correlated RESPONSE
    pub async fn send_request(
        &self,
        to: &str,
        payload: Value,
        timeout: Duration,
    ) -> MessageBusResult<AgentMessage> {
        self.request(to, MessageType::Request, payload, timeout).await
    }

    /// Send an envelope of any type expecting a correlated RESPONSE
    ///
    /// Exactly one of "response returned" or "timeout error" happens. The
    /// waiter is deregistered on every exit path, including when the
    /// returned future is dropped.
    pub async fn request(
        &self,
        to: &str,
        message_type: MessageType,
        payload: Value,
        timeout: Duration,
    ) -> MessageBusResult<AgentMessage> {
        let message = self
            .new_message(to, message_type, payload)
            .with_delivery(self.inner.config.request_delivery);
        self.request_with(message, timeout).await
    }

    /// Send a prepared envelope and wait for its correlated RESPONSE
    ///
    /// A fresh correlation id replaces any the envelope carried, and
    /// `reply_to` is set to this agent.
    pub async fn request_with(
        &self,
        message: AgentMessage,
        timeout: Duration,
    ) -> MessageBusResult<AgentMessage> {
        if message.is_broadcast() {
            return Err(MessageBusError::InvalidMessage(
                "request needs a recipient".to_string(),
            ));
        }
        let correlation_id = Uuid::new_v4().to_string();
        let message = message
            .with_correlation_id(correlation_id.clone())
            .with_reply_to(self.inner.agent_id.clone());
        let to = message.to.clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending_requests.lock().insert(
            correlation_id.clone(),
            PendingRequest {
                to: to.clone(),
                sent_at: Instant::now(),
                response_sender: tx,
            },
        );
        let _guard = WaiterGuard {
            table: &self.inner.pending_requests,
            key: &correlation_id,
        };

        self.send(&message).await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MessageBusError::Closed),
            Err(_) => {
                self.inner.metrics.lock().request_timeouts += 1;
                warn!(
                    correlation_id = %correlation_id,
                    to = %to,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(MessageBusError::RequestTimeout(correlation_id.clone()))
            }
        }
    }

    /// Answer `request`, echoing its correlation id back to its sender
    pub async fn send_response(&self, request: &AgentMessage, payload: Value) -> MessageBusResult<()> {
        let response = AgentMessage::response_to(request, self.inner.agent_id.clone(), payload)
            .with_ttl(self.inner.config.default_ttl_seconds)
            .with_priority(request.priority);
        self.send(&response).await
    }

    /// Broadcast `payload` tagged with `tag` to every agent
    pub async fn broadcast(&self, payload: Value, tag: &str) -> MessageBusResult<()> {
        let message = self
            .new_message(String::new(), MessageType::Broadcast, payload)
            .with_payload_type(tag);
        self.send(&message).await
    }

    /// Broadcast a coordination announcement
    pub async fn broadcast_coordination(&self, message: &CoordinationMessage) -> MessageBusResult<()> {
        let envelope = self
            .new_message(String::new(), MessageType::Coordination, serde_json::to_value(message)?)
            .with_payload_type(COORDINATION_PAYLOAD);
        self.send(&envelope).await
    }

    /// Send a negotiation step to `to`
    pub async fn negotiate(&self, to: &str, message: &NegotiationMessage) -> MessageBusResult<()> {
        let envelope = self
            .new_message(to, MessageType::Negotiation, serde_json::to_value(message)?)
            .with_payload_type(NEGOTIATION_PAYLOAD);
        self.send(&envelope).await
    }

    /// Broadcast a heartbeat
    pub async fn heartbeat(&self) -> MessageBusResult<()> {
        let envelope = self
            .new_message(String::new(), MessageType::Heartbeat, Value::Null)
            .with_payload_type(HEARTBEAT_PAYLOAD);
        self.send(&envelope).await
    }

    /// Send `message` and resend it until acknowledged
    ///
    /// BEST_EFFORT envelopes are sent once. Otherwise the same envelope
    /// (same id) is republished every `ack_timeout` until an ACK arrives or
    /// `reliable_send_attempts` is exhausted.
    pub async fn send_reliable(&self, message: &AgentMessage) -> MessageBusResult<()> {
        if !message.delivery.requires_ack() {
            return self.send(message).await;
        }

        let (tx, mut rx) = oneshot::channel();
        self.inner.pending_acks.lock().insert(message.id.clone(), tx);
        let _guard = WaiterGuard {
            table: &self.inner.pending_acks,
            key: &message.id,
        };

        let attempts = self.inner.config.reliable_send_attempts;
        for attempt in 1..=attempts {
            self.send(message).await?;
            match tokio::time::timeout(self.inner.config.ack_timeout, &mut rx).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(_)) => return Err(MessageBusError::Closed),
                Err(_) => {
                    debug!(id = %message.id, attempt, "no ack yet");
                }
            }
        }

        warn!(id = %message.id, attempts, "message not acknowledged");
        Err(MessageBusError::NotAcknowledged {
            message_id: message.id.clone(),
            attempts,
        })
    }

    /// Number of requests waiting for a response
    pub fn pending_request_count(&self) -> usize {
        self.inner.pending_requests.lock().len()
    }

    /// Whether a request with `correlation_id` is still waiting
    pub fn is_request_pending(&self, correlation_id: &str) -> bool {
        self.inner.pending_requests.lock().contains_key(correlation_id)
    }

    /// Recently handled envelopes, newest first
    pub fn recent_messages(&self, limit: Option<usize>) -> Vec<AgentMessage> {
        let history = self.inner.history.lock();
        let limit = limit.unwrap_or(history.len());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Purge expired dedup entries now; returns how many were removed
    pub fn purge_dedup_cache(&self) -> usize {
        self.inner.dedup.lock().purge()
    }

    /// Get statistics about the message bus
    pub fn stats(&self) -> MessageBusStats {
        let metrics = self.inner.metrics.lock();
        MessageBusStats {
            agent_id: self.inner.agent_id.clone(),
            sent_messages: metrics.sent.clone(),
            received_messages: metrics.received.clone(),
            dropped_messages: metrics.dropped.clone(),
            handler_errors: metrics.handler_errors,
            acks_sent: metrics.acks_sent,
            request_timeouts: metrics.request_timeouts,
            pending_requests: self.inner.pending_requests.lock().len(),
            dedup_cache_size: self.inner.dedup.lock().len(),
            history_size: self.inner.history.lock().len(),
            request_latency: metrics.latency(),
        }
    }

    /// Stop background loops and fail every outstanding waiter with `Closed`
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let pending = std::mem::take(&mut *self.inner.pending_requests.lock());
        self.inner.pending_acks.lock().clear();
        info!(
            agent_id = %self.inner.agent_id,
            abandoned_requests = pending.len(),
            "message bus closed"
        );
    }

    /// Run the inbound pipeline for one delivery
    pub(crate) async fn handle_delivery(&self, delivery: Delivery) {
        let message = match AgentMessage::from_bytes(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                self.record_drop(DropReason::Malformed);
                debug!(sender = %delivery.sender, error = %e, "malformed envelope dropped");
                return;
            }
        };

        if message.from == self.inner.agent_id {
            return;
        }

        if !message.is_for(&self.inner.agent_id) {
            self.record_drop(DropReason::NotForUs);
            return;
        }

        if message.is_expired() {
            self.record_drop(DropReason::Expired);
            debug!(id = %message.id, from = %message.from, "expired envelope dropped");
            return;
        }

        if message.delivery == DeliveryMode::ExactlyOnce
            && !self.inner.dedup.lock().check_and_record(&message.id)
        {
            self.record_drop(DropReason::Duplicate);
            debug!(id = %message.id, "duplicate envelope dropped");
            // Re-acknowledge so a sender whose ACK was lost stops resending
            self.acknowledge(&message).await;
            return;
        }

        increment(&mut self.inner.metrics.lock().received, message.message_type);
        self.remember(&message);
        debug!(
            id = %message.id,
            message_type = %message.message_type,
            from = %message.from,
            "message received"
        );

        match message.message_type {
            MessageType::Response => {
                self.complete_request(message);
                return;
            }
            MessageType::Ack => {
                if self.complete_ack(&message) {
                    return;
                }
            }
            _ => {}
        }

        self.dispatch(&message);
        self.acknowledge(&message).await;
    }

    fn complete_request(&self, response: AgentMessage) {
        let pending = response
            .correlation_id
            .as_deref()
            .and_then(|id| self.inner.pending_requests.lock().remove(id));

        match pending {
            Some(pending) => {
                self.inner
                    .metrics
                    .lock()
                    .record_latency(pending.sent_at.elapsed());
                debug!(
                    correlation_id = ?response.correlation_id,
                    from = %response.from,
                    expected_from = %pending.to,
                    "response matched"
                );
                // The waiter may have given up between removal and send
                let _ = pending.response_sender.send(response);
            }
            None => {
                self.record_drop(DropReason::UnmatchedResponse);
                debug!(
                    correlation_id = ?response.correlation_id,
                    from = %response.from,
                    "response without pending request dropped"
                );
            }
        }
    }

    fn complete_ack(&self, ack: &AgentMessage) -> bool {
        let waiter = ack
            .correlation_id
            .as_deref()
            .and_then(|id| self.inner.pending_acks.lock().remove(id));
        match waiter {
            Some(sender) => {
                let _ = sender.send(());
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, message: &AgentMessage) {
        let handlers = self
            .inner
            .handlers
            .read()
            .get(&message.message_type)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            let bus = self.clone();
            let message = message.clone();
            tokio::spawn(async move {
                let id = message.id.clone();
                let message_type = message.message_type;
                if let Err(e) = handler.handle(&bus, message).await {
                    bus.inner.metrics.lock().handler_errors += 1;
                    error!(id = %id, %message_type, error = %e, "handler error");
                }
            });
        }
    }

    async fn acknowledge(&self, message: &AgentMessage) {
        if !message.delivery.requires_ack() || message.message_type == MessageType::Ack {
            return;
        }
        let ack = AgentMessage::ack_for(message, self.inner.agent_id.clone());
        match self.send(&ack).await {
            Ok(()) => self.inner.metrics.lock().acks_sent += 1,
            Err(e) => warn!(id = %message.id, error = %e, "failed to send ack"),
        }
    }

    fn remember(&self, message: &AgentMessage) {
        let capacity = self.inner.config.history_size;
        if capacity == 0 {
            return;
        }
        let mut history = self.inner.history.lock();
        history.push_back(message.clone());
        while history.len() > capacity {
            history.pop_front();
        }
    }

    fn record_drop(&self, reason: DropReason) {
        increment(&mut self.inner.metrics.lock().dropped, reason);
    }
}

fn increment<K: Eq + Hash>(counts: &mut HashMap<K, u64>, key: K) {
    *counts.entry(key).or_insert(0) += 1;
}

async fn receive_loop(bus: MessageBus, mut deliveries: mpsc::UnboundedReceiver<Delivery>) {
    loop {
        tokio::select! {
            _ = bus.inner.shutdown.cancelled() => break,
            delivery = deliveries.recv() => match delivery {
                Some(delivery) => bus.handle_delivery(delivery).await,
                None => {
                    warn!(agent_id = %bus.inner.agent_id, "transport subscription ended");
                    break;
                }
            },
        }
    }
    debug!(agent_id = %bus.inner.agent_id, "receive loop stopped");
}

async fn purge_loop(bus: MessageBus) {
    let mut ticker = tokio::time::interval(bus.inner.config.dedup_purge_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = bus.inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let removed = bus.purge_dedup_cache();
                if removed > 0 {
                    debug!(removed, "dedup cache purged");
                }
            }
        }
    }
}
