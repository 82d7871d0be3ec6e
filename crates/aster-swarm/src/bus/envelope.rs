//! Agent Message Envelope
//!
//! The JSON envelope exchanged between agents. This is the only surface
//! other implementations see, so field names and enum spellings are fixed:
//! snake_case keys, SCREAMING_SNAKE_CASE enum values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Topic every agent subscribes to for direct and broadcast messages
pub const AGENT_MESSAGE_TOPIC: &str = "/zerostate/agents/messages/1.0.0";

/// Default time-to-live for new envelopes, in seconds
pub const DEFAULT_TTL_SECONDS: u64 = 300;

/// Envelope type, used for routing and handler dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Task request expecting a correlated response
    Request,
    /// Response to a request, matched by correlation id
    Response,
    /// Message for every agent on the topic
    Broadcast,
    /// Price/deadline negotiation between agents
    Negotiation,
    /// Lock, state and barrier protocol traffic
    Coordination,
    /// Liveness signal
    Heartbeat,
    /// Receipt acknowledgement
    Ack,
}

impl MessageType {
    /// Wire spelling of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "REQUEST",
            MessageType::Response => "RESPONSE",
            MessageType::Broadcast => "BROADCAST",
            MessageType::Negotiation => "NEGOTIATION",
            MessageType::Coordination => "COORDINATION",
            MessageType::Heartbeat => "HEARTBEAT",
            MessageType::Ack => "ACK",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery contract requested by the sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMode {
    /// Fire and forget
    #[default]
    BestEffort,
    /// Receiver acknowledges; sender resends until acknowledged
    AtLeastOnce,
    /// As at-least-once, and the receiver suppresses duplicate ids
    ExactlyOnce,
}

impl DeliveryMode {
    /// Whether the receiver answers with an ACK
    pub fn requires_ack(&self) -> bool {
        matches!(self, DeliveryMode::AtLeastOnce | DeliveryMode::ExactlyOnce)
    }
}

/// Priority levels for messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "camelCase")]
pub enum MessagePriority {
    /// Background traffic
    Low = 0,
    /// Default
    Normal = 1,
    /// Ahead of normal traffic
    High = 2,
    /// Coordination-critical traffic
    Critical = 3,
}

impl Default for MessagePriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl From<u8> for MessagePriority {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Low,
            1 => Self::Normal,
            2 => Self::High,
            _ => Self::Critical,
        }
    }
}

/// Agent message envelope
///
/// Immutable once sent: builders consume and return `self`, and the bus
/// never rewrites an envelope after publishing it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMessage {
    /// Unique message identifier
    pub id: String,
    /// Links a request to its response, or an ACK to the acknowledged message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Envelope type
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Requested delivery contract
    #[serde(default)]
    pub delivery: DeliveryMode,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Lifetime in seconds; zero never expires
    #[serde(rename = "ttl", default)]
    pub ttl_seconds: u64,
    /// Priority (see [`MessagePriority`])
    #[serde(default)]
    pub priority: u8,
    /// Sender agent id
    pub from: String,
    /// Recipient agent id; empty for broadcast
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub to: String,
    /// Where responses should go when not the sender
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Opaque payload
    #[serde(default)]
    pub payload: Value,
    /// Payload discriminator, e.g. "task_request"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_type: Option<String>,
    /// Free-form string metadata
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl AgentMessage {
    /// Create a new message
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            correlation_id: None,
            message_type,
            delivery: DeliveryMode::BestEffort,
            timestamp: Utc::now(),
            ttl_seconds: DEFAULT_TTL_SECONDS,
            priority: MessagePriority::Normal as u8,
            from: from.into(),
            to: to.into(),
            reply_to: None,
            payload,
            payload_type: None,
            metadata: HashMap::new(),
        }
    }

    /// Create a broadcast message (empty recipient)
    pub fn broadcast(from: impl Into<String>, payload: Value) -> Self {
        Self::new(from, String::new(), MessageType::Broadcast, payload)
    }

    /// Create the response to `request`
    ///
    /// Echoes the request's correlation id (falling back to its id) and
    /// addresses the original sender.
    pub fn response_to(request: &AgentMessage, from: impl Into<String>, payload: Value) -> Self {
        let correlation_id = request
            .correlation_id
            .clone()
            .unwrap_or_else(|| request.id.clone());
        Self::new(from, request.from.clone(), MessageType::Response, payload)
            .with_correlation_id(correlation_id)
    }

    /// Create an ACK for `message`
    pub fn ack_for(message: &AgentMessage, from: impl Into<String>) -> Self {
        Self::new(from, message.from.clone(), MessageType::Ack, Value::Null)
            .with_correlation_id(message.id.clone())
            .with_ttl(0)
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the delivery mode
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    /// Set the time-to-live in seconds
    pub fn with_ttl(mut self, ttl_seconds: u64) -> Self {
        self.ttl_seconds = ttl_seconds;
        self
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the reply-to agent
    pub fn with_reply_to(mut self, agent_id: impl Into<String>) -> Self {
        self.reply_to = Some(agent_id.into());
        self
    }

    /// Set the payload discriminator
    pub fn with_payload_type(mut self, payload_type: impl Into<String>) -> Self {
        self.payload_type = Some(payload_type.into());
        self
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Override the creation timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Whether the message targets every agent
    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }

    /// Whether the message is addressed to `agent_id` (directly or by broadcast)
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.is_broadcast() || self.to == agent_id
    }

    /// Whether the message outlived its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl_seconds == 0 {
            return false;
        }
        let age = now.signed_duration_since(self.timestamp);
        age.num_milliseconds() > (self.ttl_seconds as i64).saturating_mul(1000)
    }

    /// Whether the message outlived its TTL now
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Encode as wire JSON
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from wire JSON
    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}
