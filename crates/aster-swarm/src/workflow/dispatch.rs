//! Step Dispatch
//!
//! Shared by the chain and DAG executors: selects an agent, sends the
//! task request through the bus, waits for the correlated response and
//! retries failed attempts per the retry policy.
//!
//! # Features
//! - Fixed agents or late binding through an [`AgentSelector`]
//! - Re-selection that avoids agents which already failed the step
//! - Per-attempt timeout with an executor-wide default
//! - Cancellation at every suspension point
//! - Execution registry backing `cancel(id)` on both executors

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dag::FailurePolicy;
use super::error::{WorkflowError, WorkflowResult};
use super::mapping::normalize_output;
use super::retry::RetryPolicy;
use super::selector::{AgentSelector, SelectionError};
use super::types::{ExecutionStatus, StepSpec};
use crate::bus::{
    MessageBus, MessageBusError, MessageType, TaskRequest, TaskResponse, TaskResponseStatus,
    TASK_REQUEST_PAYLOAD,
};
use crate::config::duration_ms;

/// Executor configuration shared by chains and DAGs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-attempt timeout for steps that set none
    #[serde(with = "duration_ms")]
    pub default_step_timeout: Duration,
    /// Delay schedule between attempts
    pub retry: RetryPolicy,
    /// DAG failure policy for workflows that set none
    pub failure_policy: FailurePolicy,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::FailFast,
        }
    }
}

impl ExecutorConfig {
    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.default_step_timeout.is_zero() {
            return Err("executor default_step_timeout must be greater than 0".to_string());
        }
        self.retry.validate()
    }
}

/// Why one step gave up
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepFailure {
    /// Selection found nobody; never retried
    #[error(transparent)]
    NoEligibleAgent(#[from] SelectionError),

    #[error("no response from {agent} within {timeout_ms}ms")]
    Timeout { agent: String, timeout_ms: u64 },

    /// The agent answered with anything but COMPLETED
    #[error("agent {agent} reported failure: {reason}")]
    Agent { agent: String, reason: String },

    #[error("bus error: {0}")]
    Bus(String),

    #[error("cancelled")]
    Cancelled,
}

impl StepFailure {
    /// Map onto the error surfaced by an executor for step `step`
    pub fn into_workflow_error(self, step: &str) -> WorkflowError {
        match self {
            StepFailure::NoEligibleAgent(err) => WorkflowError::Selection(err),
            timeout @ StepFailure::Timeout { .. } => {
                WorkflowError::Timeout(format!("step {}: {}", step, timeout))
            }
            StepFailure::Cancelled => WorkflowError::Cancelled(step.to_string()),
            other => WorkflowError::StepFailed {
                step: step.to_string(),
                error: other.to_string(),
            },
        }
    }
}

/// Result of dispatching one step, retries included
#[derive(Debug, Clone)]
pub(crate) struct StepOutcome {
    pub result: Result<Map<String, Value>, StepFailure>,
    /// Agent of the last attempt
    pub agent: Option<String>,
    pub cost: f64,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub(crate) struct ExecutorCounters {
    started: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    step_dispatches: AtomicU64,
    step_retries: AtomicU64,
}

impl ExecutorCounters {
    pub fn record_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a finished execution by its outcome
    pub fn record_finished<T>(&self, result: &WorkflowResult<T>) {
        let counter = match result {
            Ok(_) => &self.completed,
            Err(WorkflowError::Cancelled(_)) => &self.cancelled,
            Err(_) => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, active: usize) -> ExecutorStats {
        ExecutorStats {
            started: self.started.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            step_dispatches: self.step_dispatches.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
            active,
        }
    }
}

/// Executor counters
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorStats {
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Requests sent, retries included
    pub step_dispatches: u64,
    pub step_retries: u64,
    /// Executions currently running
    pub active: usize,
}

struct RunEntry {
    token: CancellationToken,
    snapshot: Option<ExecutionStatus>,
}

/// Running executions, their cancellation tokens and latest status
#[derive(Default)]
pub(crate) struct ActiveRuns {
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl ActiveRuns {
    /// Register `id`; the returned guard deregisters it on drop
    pub fn register(self: &Arc<Self>, id: &str, token: CancellationToken) -> WorkflowResult<RunGuard> {
        let mut runs = self.runs.write();
        if runs.contains_key(id) {
            return Err(WorkflowError::AlreadyRunning(id.to_string()));
        }
        runs.insert(
            id.to_string(),
            RunEntry {
                token,
                snapshot: None,
            },
        );
        Ok(RunGuard {
            runs: Arc::clone(self),
            id: id.to_string(),
        })
    }

    /// Replace the status of a registered run
    pub fn publish(&self, snapshot: ExecutionStatus) {
        if let Some(entry) = self.runs.write().get_mut(&snapshot.id) {
            entry.snapshot = Some(snapshot);
        }
    }

    pub fn status(&self, id: &str) -> Option<ExecutionStatus> {
        self.runs.read().get(id).and_then(|entry| entry.snapshot.clone())
    }

    pub fn cancel(&self, id: &str) -> bool {
        match self.runs.read().get(id) {
            Some(entry) => {
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.runs.read().len()
    }
}

pub(crate) struct RunGuard {
    runs: Arc<ActiveRuns>,
    id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.runs.runs.write().remove(&self.id);
    }
}

/// Sends steps to agents
#[derive(Clone)]
pub(crate) struct StepDispatcher {
    bus: MessageBus,
    selector: Arc<dyn AgentSelector>,
    config: ExecutorConfig,
    counters: Arc<ExecutorCounters>,
}

impl StepDispatcher {
    pub fn new(
        bus: MessageBus,
        selector: Arc<dyn AgentSelector>,
        config: ExecutorConfig,
        counters: Arc<ExecutorCounters>,
    ) -> Self {
        Self {
            bus,
            selector,
            config,
            counters,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run one step to success, exhaustion of its retries, or cancellation
    pub async fn dispatch(
        &self,
        run_id: &str,
        spec: &StepSpec,
        input: Map<String, Value>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let allowed = spec.max_retries.saturating_add(1);
        let timeout = spec.timeout.unwrap_or(self.config.default_step_timeout);
        let mut outcome = StepOutcome {
            result: Err(StepFailure::Cancelled),
            agent: None,
            cost: 0.0,
            attempts: 0,
        };
        let mut tried: Vec<String> = Vec::new();

        loop {
            if cancel.is_cancelled() {
                outcome.result = Err(StepFailure::Cancelled);
                return outcome;
            }

            let agent = match self.select(spec, &tried).await {
                Ok(agent) => agent,
                Err(err) => {
                    warn!(run_id, step = %spec.id, error = %err, "no agent for step");
                    outcome.result = Err(err.into());
                    return outcome;
                }
            };
            outcome.agent = Some(agent.clone());
            outcome.attempts += 1;
            self.counters.step_dispatches.fetch_add(1, Ordering::Relaxed);
            debug!(
                run_id,
                step = %spec.id,
                agent = %agent,
                attempt = outcome.attempts,
                "dispatching step"
            );

            let attempt = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StepFailure::Cancelled),
                result = self.request(run_id, &agent, spec, &input, timeout) => result,
            };

            match attempt {
                Ok((output, price)) => {
                    outcome.cost += price;
                    outcome.result = Ok(output);
                    return outcome;
                }
                Err(StepFailure::Cancelled) => {
                    outcome.result = Err(StepFailure::Cancelled);
                    return outcome;
                }
                Err(failure) => {
                    if outcome.attempts >= allowed {
                        warn!(
                            run_id,
                            step = %spec.id,
                            attempts = outcome.attempts,
                            error = %failure,
                            "step failed"
                        );
                        outcome.result = Err(failure);
                        return outcome;
                    }

                    let delay = self.config.retry.calculate_delay(outcome.attempts - 1);
                    warn!(
                        run_id,
                        step = %spec.id,
                        attempt = outcome.attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "step attempt failed, retrying"
                    );
                    self.counters.step_retries.fetch_add(1, Ordering::Relaxed);
                    tried.push(agent);

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            outcome.result = Err(StepFailure::Cancelled);
                            return outcome;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Fixed agent, else a capable agent not yet tried, else any capable agent
    async fn select(&self, spec: &StepSpec, tried: &[String]) -> Result<String, SelectionError> {
        if let Some(agent) = spec.agent_id.as_deref().filter(|a| !a.is_empty()) {
            return Ok(agent.to_string());
        }
        match self.selector.select_agent(&spec.capabilities, tried).await {
            Err(_) if !tried.is_empty() => self.selector.select_agent(&spec.capabilities, &[]).await,
            other => other,
        }
    }

    async fn request(
        &self,
        run_id: &str,
        agent: &str,
        spec: &StepSpec,
        input: &Map<String, Value>,
        timeout: Duration,
    ) -> Result<(Map<String, Value>, f64), StepFailure> {
        let mut task = TaskRequest::new(format!("{}/{}", run_id, spec.id), input.clone());
        task.agent_id = agent.to_string();
        task.task_type = spec.task_type.clone();
        task.requirements = spec.requirements.clone();
        task.budget = spec.budget;
        task.deadline = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));

        let payload = task
            .to_payload()
            .map_err(|e| StepFailure::Bus(e.to_string()))?;
        let message = self
            .bus
            .new_message(agent, MessageType::Request, payload)
            .with_payload_type(TASK_REQUEST_PAYLOAD)
            .with_delivery(self.bus.config().request_delivery);

        let reply = self
            .bus
            .request_with(message, timeout)
            .await
            .map_err(|e| match e {
                MessageBusError::RequestTimeout(_) => StepFailure::Timeout {
                    agent: agent.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                },
                other => StepFailure::Bus(other.to_string()),
            })?;

        let response = TaskResponse::from_message(&reply).map_err(|e| StepFailure::Agent {
            agent: agent.to_string(),
            reason: format!("malformed task response: {}", e),
        })?;
        match response.status {
            TaskResponseStatus::Completed => Ok((normalize_output(response.result), response.price)),
            status => Err(StepFailure::Agent {
                agent: agent.to_string(),
                reason: response
                    .error
                    .unwrap_or_else(|| format!("task {:?}", status)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executor_config_defaults_and_validate() {
        let config = ExecutorConfig::default();
        assert_eq!(config.default_step_timeout, Duration::from_secs(30));
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert!(config.validate().is_ok());
        assert!(config
            .with_default_step_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_failure_maps_to_workflow_error() {
        let timeout = StepFailure::Timeout {
            agent: "a1".into(),
            timeout_ms: 10,
        };
        assert!(matches!(timeout.into_workflow_error("s1"), WorkflowError::Timeout(_)));

        let selection = StepFailure::from(SelectionError::NoEligibleAgent {
            capabilities: vec!["nlp".into()],
        });
        assert!(matches!(
            selection.into_workflow_error("s1"),
            WorkflowError::Selection(_)
        ));

        let agent = StepFailure::Agent {
            agent: "a1".into(),
            reason: "boom".into(),
        };
        assert_eq!(
            agent.into_workflow_error("s1"),
            WorkflowError::StepFailed {
                step: "s1".into(),
                error: "agent a1 reported failure: boom".into()
            }
        );
    }

    #[test]
    fn test_active_runs_register_and_cancel() {
        let runs = Arc::new(ActiveRuns::default());
        let token = CancellationToken::new();
        let guard = runs.register("run-1", token.clone()).unwrap();
        assert!(matches!(
            runs.register("run-1", CancellationToken::new()),
            Err(WorkflowError::AlreadyRunning(_))
        ));
        assert_eq!(runs.ids(), vec!["run-1".to_string()]);

        assert!(runs.cancel("run-1"));
        assert!(token.is_cancelled());
        assert!(!runs.cancel("run-2"));

        drop(guard);
        assert_eq!(runs.len(), 0);
    }

    #[test]
    fn test_active_runs_status_lives_with_the_run() {
        use crate::workflow::{StepStatus, WorkflowStatus};

        let runs = Arc::new(ActiveRuns::default());
        let snapshot = |id: &str| {
            ExecutionStatus::capture(id, WorkflowStatus::Running, 0.0, [("s1", StepStatus::Running)])
        };

        // Unregistered runs publish nothing
        runs.publish(snapshot("ghost"));
        assert!(runs.status("ghost").is_none());

        let guard = runs.register("run-1", CancellationToken::new()).unwrap();
        assert!(runs.status("run-1").is_none());
        runs.publish(snapshot("run-1"));
        assert_eq!(
            runs.status("run-1").and_then(|s| s.step("s1")),
            Some(StepStatus::Running)
        );

        drop(guard);
        assert!(runs.status("run-1").is_none());
    }
}
