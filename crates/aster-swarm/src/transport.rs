//! Transport Seam
//!
//! The message bus needs exactly two primitives from the network layer:
//! "publish bytes to a topic" and "deliver bytes to subscribers". Neither
//! ordering nor delivery is guaranteed. Production deployments plug a
//! gossip layer in behind [`Transport`]; [`InMemoryNetwork`] wires peers
//! together inside one process.
//!
//! # Features
//! - Object-safe async `Transport` trait
//! - In-process best-effort network with per-peer endpoints
//! - Fault injection: duplicate deliveries and disconnected peers

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Result type alias for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Error types for transport operations
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been shut down
    #[error("Transport closed")]
    Closed,

    /// The underlying network rejected the publish
    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// A single copy of a published message handed to a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Topic the message was published on
    pub topic: String,
    /// Raw message bytes
    pub data: Vec<u8>,
    /// Peer that published the message
    pub sender: String,
}

/// Best-effort publish/subscribe transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity of the local peer
    fn local_peer_id(&self) -> &str;

    /// Publish `data` to every subscriber of `topic`
    async fn publish(&self, topic: &str, data: Vec<u8>) -> TransportResult<()>;

    /// Subscribe to `topic`; deliveries arrive on the returned channel
    async fn subscribe(&self, topic: &str) -> TransportResult<mpsc::UnboundedReceiver<Delivery>>;
}

struct Subscriber {
    peer_id: String,
    sender: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct NetworkInner {
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    offline: Mutex<HashSet<String>>,
    extra_copies: AtomicUsize,
}

/// In-process network connecting any number of [`InMemoryTransport`] endpoints
///
/// Every publish reaches every subscriber of the topic, the publisher
/// included. Filtering self-originated traffic is the bus's job, exactly as
/// with a real gossip layer.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint for `peer_id`
    pub fn endpoint(&self, peer_id: impl Into<String>) -> InMemoryTransport {
        InMemoryTransport {
            peer_id: peer_id.into(),
            network: self.clone(),
        }
    }

    /// Deliver every message `extra` additional times to each subscriber
    pub fn set_duplicate_deliveries(&self, extra: usize) {
        self.inner.extra_copies.store(extra, Ordering::SeqCst);
    }

    /// Silently drop all traffic from and to `peer_id`
    pub fn disconnect(&self, peer_id: &str) {
        self.inner.offline.lock().insert(peer_id.to_string());
    }

    /// Undo a previous [`disconnect`](Self::disconnect)
    pub fn reconnect(&self, peer_id: &str) {
        self.inner.offline.lock().remove(peer_id);
    }

    /// Number of live subscriptions on `topic`
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .subscribers
            .lock()
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.sender.is_closed()).count())
            .unwrap_or(0)
    }

    fn deliver(&self, topic: &str, data: &[u8], sender: &str) {
        let offline = self.inner.offline.lock().clone();
        if offline.contains(sender) {
            debug!(peer = %sender, topic = %topic, "dropping publish from disconnected peer");
            return;
        }

        let copies = 1 + self.inner.extra_copies.load(Ordering::SeqCst);
        let mut subscribers = self.inner.subscribers.lock();
        let Some(subs) = subscribers.get_mut(topic) else {
            return;
        };

        subs.retain(|s| !s.sender.is_closed());
        for sub in subs.iter().filter(|s| !offline.contains(&s.peer_id)) {
            for _ in 0..copies {
                let delivery = Delivery {
                    topic: topic.to_string(),
                    data: data.to_vec(),
                    sender: sender.to_string(),
                };
                // A closed receiver just means the subscriber went away
                let _ = sub.sender.send(delivery);
            }
        }
    }
}

/// One peer's view of an [`InMemoryNetwork`]
#[derive(Clone)]
pub struct InMemoryTransport {
    peer_id: String,
    network: InMemoryNetwork,
}

impl InMemoryTransport {
    /// The network this endpoint belongs to
    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn local_peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> TransportResult<()> {
        self.network.deliver(topic, &data, &self.peer_id);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> TransportResult<mpsc::UnboundedReceiver<Delivery>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network
            .inner
            .subscribers
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                peer_id: self.peer_id.clone(),
                sender: tx,
            });
        Ok(rx)
    }
}
