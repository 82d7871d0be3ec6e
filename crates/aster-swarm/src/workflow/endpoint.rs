//! Agent-side task execution endpoint
//!
//! Answers task REQUESTs arriving on a bus by running a [`TaskHandler`]
//! and replying with a correlated [`TaskResponse`].

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::bus::{
    handler_fn, AgentMessage, MessageBus, MessageType, TaskRequest, TaskResponse,
    TASK_REQUEST_PAYLOAD,
};

/// What a handler produced
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOutcome {
    pub result: Value,
    /// Price charged to the requester
    pub price: f64,
}

impl TaskOutcome {
    pub fn new(result: Value) -> Self {
        Self { result, price: 0.0 }
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = price;
        self
    }
}

/// Executes tasks on behalf of a remote requester
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, request: TaskRequest) -> anyhow::Result<TaskOutcome>;
}

pub struct FnTaskHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnTaskHandler<F>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send,
{
    async fn execute(&self, request: TaskRequest) -> anyhow::Result<TaskOutcome> {
        (self.0)(request).await
    }
}

/// Wrap an async closure as a shareable task handler
pub fn task_handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<TaskOutcome>> + Send + 'static,
{
    Arc::new(FnTaskHandler(f))
}

/// Endpoint counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskEndpointStats {
    pub received: u64,
    pub completed: u64,
    pub failed: u64,
    /// Requests whose deadline had passed on arrival
    pub expired: u64,
}

#[derive(Default)]
struct EndpointCounters {
    received: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    expired: AtomicU64,
}

/// Handle to an attached endpoint
#[derive(Clone)]
pub struct TaskEndpoint {
    handler: Arc<dyn TaskHandler>,
    counters: Arc<EndpointCounters>,
}

impl TaskEndpoint {
    /// Serve task requests arriving on `bus` with `handler`
    pub fn attach(bus: &MessageBus, handler: Arc<dyn TaskHandler>) -> Self {
        let endpoint = Self {
            handler,
            counters: Arc::new(EndpointCounters::default()),
        };
        let serving = endpoint.clone();
        bus.register_handler(
            MessageType::Request,
            handler_fn(move |bus, message| {
                let serving = serving.clone();
                async move { serving.serve(&bus, message).await }
            }),
        );
        debug!(agent_id = %bus.agent_id(), "task endpoint attached");
        endpoint
    }

    pub fn stats(&self) -> TaskEndpointStats {
        TaskEndpointStats {
            received: self.counters.received.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
        }
    }

    async fn serve(&self, bus: &MessageBus, message: AgentMessage) -> anyhow::Result<()> {
        // Other request kinds share the message type
        if message
            .payload_type
            .as_deref()
            .is_some_and(|t| t != TASK_REQUEST_PAYLOAD)
        {
            return Ok(());
        }
        let request = match TaskRequest::from_message(&message) {
            Ok(request) => request,
            Err(e) => {
                debug!(id = %message.id, error = %e, "request is not a task");
                return Ok(());
            }
        };
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let task_id = request.task_id.clone();
        if request.deadline.is_some_and(|deadline| deadline < Utc::now()) {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            warn!(task_id = %task_id, from = %message.from, "task deadline passed before start");
            let response = TaskResponse::failed(task_id, "deadline passed before execution");
            bus.send_response(&message, response.to_payload()?).await?;
            return Ok(());
        }

        let started = Instant::now();
        let response = match self.handler.execute(request).await {
            Ok(outcome) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                TaskResponse::completed(task_id, outcome.result).with_price(outcome.price)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(task_id = %task_id, error = %e, "task failed");
                TaskResponse::failed(task_id, format!("{:#}", e))
            }
        };
        let response = response.with_duration_ms(started.elapsed().as_millis() as u64);
        bus.send_response(&message, response.to_payload()?).await?;
        Ok(())
    }
}
