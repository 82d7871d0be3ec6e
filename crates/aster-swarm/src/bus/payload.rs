//! Typed payloads carried inside [`AgentMessage`](super::AgentMessage) envelopes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::envelope::AgentMessage;

/// `payload_type` of task requests
pub const TASK_REQUEST_PAYLOAD: &str = "task_request";
/// `payload_type` of task responses
pub const TASK_RESPONSE_PAYLOAD: &str = "task_response";
/// `payload_type` of negotiation messages
pub const NEGOTIATION_PAYLOAD: &str = "negotiation";
/// `payload_type` of coordination messages
pub const COORDINATION_PAYLOAD: &str = "coordination";
/// `payload_type` of heartbeats
pub const HEARTBEAT_PAYLOAD: &str = "heartbeat";

/// Work handed to a remote agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRequest {
    pub task_id: String,
    /// Agent the request is meant for
    #[serde(default)]
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_type: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    #[serde(default)]
    pub requirements: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    /// Maximum price the requester will pay
    #[serde(default)]
    pub budget: f64,
    #[serde(default)]
    pub priority: i32,
}

impl TaskRequest {
    /// Create a request for `task_id` with the given input
    pub fn new(task_id: impl Into<String>, input: Map<String, Value>) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: String::new(),
            task_type: String::new(),
            input,
            requirements: HashMap::new(),
            deadline: None,
            budget: 0.0,
            priority: 0,
        }
    }

    /// Decode from a REQUEST envelope
    pub fn from_message(message: &AgentMessage) -> serde_json::Result<Self> {
        serde_json::from_value(message.payload.clone())
    }

    /// Encode as an envelope payload
    pub fn to_payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Outcome reported by a remote agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResponseStatus {
    Accepted,
    Rejected,
    Completed,
    Failed,
}

/// Reply to a [`TaskRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResponse {
    pub task_id: String,
    pub status: TaskResponseStatus,
    /// Task output; `output` is accepted as an alias on decode
    #[serde(default, alias = "output", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Price actually charged
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl TaskResponse {
    /// Successful completion with `result`
    pub fn completed(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskResponseStatus::Completed,
            result: Some(result),
            error: None,
            price: 0.0,
            duration_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Failure with `error`
    pub fn failed(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            status: TaskResponseStatus::Failed,
            result: None,
            error: Some(error.into()),
            price: 0.0,
            duration_ms: 0,
            metadata: HashMap::new(),
        }
    }

    /// Set the charged price
    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }

    /// Set the execution duration
    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    /// Decode from a RESPONSE envelope
    pub fn from_message(message: &AgentMessage) -> serde_json::Result<Self> {
        serde_json::from_value(message.payload.clone())
    }

    /// Encode as an envelope payload
    pub fn to_payload(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Phase of a price negotiation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationPhase {
    Bid,
    CounterBid,
    Accept,
    Reject,
}

/// Negotiation between a requester and a candidate agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NegotiationMessage {
    pub task_id: String,
    pub phase: NegotiationPhase,
    #[serde(default)]
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub terms: HashMap<String, String>,
}

/// Coordination announcement broadcast to all agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinationMessage {
    #[serde(default)]
    pub workflow_id: String,
    /// e.g. LOCK, UNLOCK, UPDATE, SYNC
    pub action: String,
    #[serde(default)]
    pub resource: String,
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CoordinationMessage {
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            workflow_id: String::new(),
            action: action.into(),
            resource: resource.into(),
            state: Value::Null,
            metadata: HashMap::new(),
        }
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state;
        self
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = workflow_id.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_response_accepts_output_alias() {
        let raw = json!({"task_id": "t1", "status": "COMPLETED", "output": {"n": 3}});
        let response: TaskResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.status, TaskResponseStatus::Completed);
        assert_eq!(response.result, Some(json!({"n": 3})));
    }

    #[test]
    fn test_task_response_failed_shape() {
        let value = TaskResponse::failed("t1", "boom").to_payload().unwrap();
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["error"], "boom");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_task_request_minimal_decode() {
        let raw = json!({"task_id": "t1", "input": {"a": 1}, "budget": 2.5});
        let request: TaskRequest = serde_json::from_value(raw).unwrap();
        assert_eq!(request.task_id, "t1");
        assert_eq!(request.input.get("a"), Some(&json!(1)));
        assert!(request.deadline.is_none());
        assert_eq!(request.budget, 2.5);
    }

    #[test]
    fn test_negotiation_phase_spelling() {
        let msg = NegotiationMessage {
            task_id: "t".into(),
            phase: NegotiationPhase::CounterBid,
            price: 1.0,
            deadline: None,
            terms: HashMap::new(),
        };
        assert_eq!(serde_json::to_value(&msg).unwrap()["phase"], "COUNTER_BID");
    }
}
