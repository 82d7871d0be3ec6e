//! Task-Chain Executor
//!
//! Runs a linear pipeline of steps across agents, strictly in declared
//! order, feeding mapped output of earlier steps into later ones.
//!
//! # Features
//! - ON_SUCCESS / ON_FAILURE / ALWAYS conditions, judged against the
//!   nearest preceding step that ran
//! - Typed `"step.field"` input mapping
//! - Per-step retries with re-selection
//! - Total budget enforcement
//! - Cancellation between and during steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::{
    ActiveRuns, ExecutorConfig, ExecutorCounters, ExecutorStats, StepDispatcher, StepFailure,
};
use super::error::{WorkflowError, WorkflowResult};
use super::mapping::{referenced_step, resolve_input, OutputTable};
use super::selector::AgentSelector;
use super::types::{
    ExecutionStatus, StatusSummary, StepCondition, StepSpec, StepState, StepStatus, WorkflowStatus,
};
use crate::bus::MessageBus;

/// One step of a chain
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainStep {
    #[serde(flatten)]
    pub spec: StepSpec,
    #[serde(default)]
    pub condition: StepCondition,
    #[serde(default)]
    pub state: StepState,
}

impl ChainStep {
    pub fn new(spec: StepSpec) -> Self {
        Self {
            spec,
            condition: StepCondition::OnSuccess,
            state: StepState::default(),
        }
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.condition = condition;
        self
    }
}

impl From<StepSpec> for ChainStep {
    fn from(spec: StepSpec) -> Self {
        Self::new(spec)
    }
}

/// An ordered pipeline of steps; mutated in place by execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskChain {
    pub id: String,
    pub name: String,
    pub steps: Vec<ChainStep>,
    /// Zero means unlimited
    #[serde(default)]
    pub total_budget: f64,
    #[serde(default)]
    pub total_cost: f64,
    /// Index of the step being (or last) processed
    #[serde(default)]
    pub current_step: usize,
    #[serde(default)]
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl TaskChain {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            steps: Vec::new(),
            total_budget: 0.0,
            total_cost: 0.0,
            current_step: 0,
            status: WorkflowStatus::Pending,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_budget(mut self, total_budget: f64) -> Self {
        self.total_budget = total_budget;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Append a step; a step without an id gets a generated one
    pub fn add_step(&mut self, step: impl Into<ChainStep>) -> WorkflowResult<()> {
        let mut step = step.into();
        step.spec.ensure_id();
        if self.steps.iter().any(|s| s.spec.id == step.spec.id) {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "duplicate step id {}",
                step.spec.id
            )));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Builder form of [`add_step`](Self::add_step)
    pub fn then(mut self, step: impl Into<ChainStep>) -> WorkflowResult<Self> {
        self.add_step(step)?;
        Ok(self)
    }

    pub fn step(&self, id: &str) -> Option<&ChainStep> {
        self.steps.iter().find(|s| s.spec.id == id)
    }

    /// Output of a completed step
    pub fn output(&self, id: &str) -> Option<&Map<String, Value>> {
        self.step(id).and_then(|s| s.state.result.as_ref())
    }

    pub fn summary(&self) -> StatusSummary {
        StatusSummary::from_statuses(self.steps.iter().map(|s| s.state.status))
    }

    /// Snapshot of the chain and every step's status
    pub fn execution_status(&self) -> ExecutionStatus {
        ExecutionStatus::capture(
            &self.id,
            self.status,
            self.total_cost,
            self.steps
                .iter()
                .map(|step| (step.spec.id.as_str(), step.state.status)),
        )
    }

    /// Static checks run before any step is dispatched
    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |msg: String| WorkflowError::InvalidWorkflow(msg);
        if self.id.is_empty() {
            return Err(invalid("chain id is required".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid(format!("chain {} has no steps", self.id)));
        }
        if self.total_budget < 0.0 {
            return Err(invalid("total budget must not be negative".to_string()));
        }

        let mut earlier: HashSet<&str> = HashSet::new();
        for step in &self.steps {
            step.spec.check().map_err(invalid)?;
            for reference in step.spec.input_mapping.values() {
                let source = referenced_step(reference).map_err(|reason| {
                    WorkflowError::InputMapping {
                        step: step.spec.id.clone(),
                        reason,
                    }
                })?;
                if !earlier.contains(source) {
                    return Err(WorkflowError::InputMapping {
                        step: step.spec.id.clone(),
                        reason: format!("{:?} does not name an earlier step", reference),
                    });
                }
            }
            if !earlier.insert(step.spec.id.as_str()) {
                return Err(invalid(format!("duplicate step id {}", step.spec.id)));
            }
            if !step.spec.name.is_empty() {
                earlier.insert(step.spec.name.as_str());
            }
        }
        Ok(())
    }

    /// Mark every still-pending step
    fn mark_pending(&mut self, from: usize, status: StepStatus, reason: &str) {
        for step in self.steps.iter_mut().skip(from) {
            if step.state.status == StepStatus::Pending {
                step.state.mark(status, reason);
            }
        }
    }

    fn over_budget(&self) -> bool {
        self.total_budget > 0.0 && self.total_cost > self.total_budget
    }
}

/// Executes [`TaskChain`]s
pub struct ChainExecutor {
    dispatcher: StepDispatcher,
    runs: Arc<ActiveRuns>,
    counters: Arc<ExecutorCounters>,
}

impl ChainExecutor {
    pub fn new(bus: MessageBus, selector: Arc<dyn AgentSelector>, config: ExecutorConfig) -> Self {
        let counters = Arc::new(ExecutorCounters::default());
        Self {
            dispatcher: StepDispatcher::new(bus, selector, config, Arc::clone(&counters)),
            runs: Arc::new(ActiveRuns::default()),
            counters,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        self.dispatcher.config()
    }

    /// Run `chain` to a terminal state
    pub async fn execute_chain(&self, chain: &mut TaskChain) -> WorkflowResult<()> {
        self.execute_chain_with_cancel(chain, CancellationToken::new())
            .await
    }

    /// Run `chain`, stopping early when `cancel` fires
    ///
    /// A request already in flight is not recalled; its late response is
    /// discarded and no further steps start.
    pub async fn execute_chain_with_cancel(
        &self,
        chain: &mut TaskChain,
        cancel: CancellationToken,
    ) -> WorkflowResult<()> {
        if let Err(err) = chain.validate() {
            chain.status = WorkflowStatus::Failed;
            chain.error = Some(err.to_string());
            return Err(err);
        }

        let token = cancel.child_token();
        let _guard = self.runs.register(&chain.id, token.clone())?;
        self.counters.record_started();

        chain.status = WorkflowStatus::Running;
        chain.started_at = Some(Utc::now());
        chain.completed_at = None;
        chain.error = None;
        chain.total_cost = 0.0;
        chain.current_step = 0;
        for step in &mut chain.steps {
            step.state = StepState::default();
        }
        info!(chain_id = %chain.id, name = %chain.name, steps = chain.steps.len(), "chain started");
        self.runs.publish(chain.execution_status());

        let result = self.run(chain, &token).await;

        chain.completed_at = Some(Utc::now());
        match &result {
            Ok(()) => {
                chain.status = WorkflowStatus::Completed;
                chain.current_step = chain.steps.len();
                info!(chain_id = %chain.id, total_cost = chain.total_cost, "chain completed");
            }
            Err(err @ WorkflowError::Cancelled(_)) => {
                chain.status = WorkflowStatus::Cancelled;
                chain.error = Some(err.to_string());
                warn!(chain_id = %chain.id, "chain cancelled");
            }
            Err(err) => {
                chain.status = WorkflowStatus::Failed;
                chain.error = Some(err.to_string());
                error!(chain_id = %chain.id, error = %err, "chain failed");
            }
        }
        self.counters.record_finished(&result);
        result
    }

    async fn run(&self, chain: &mut TaskChain, token: &CancellationToken) -> WorkflowResult<()> {
        // Outcome of the nearest preceding step that ran
        let mut last_succeeded: Option<bool> = None;

        for index in 0..chain.steps.len() {
            chain.current_step = index;
            if token.is_cancelled() {
                chain.mark_pending(index, StepStatus::Cancelled, "chain cancelled");
                return Err(WorkflowError::Cancelled(chain.id.clone()));
            }

            let condition = chain.steps[index].condition;
            let should_run = match (condition, last_succeeded) {
                (StepCondition::Always, _) => true,
                (StepCondition::OnSuccess, previous) => previous.unwrap_or(true),
                (StepCondition::OnFailure, previous) => previous == Some(false),
            };
            if !should_run {
                let step = &mut chain.steps[index];
                debug!(chain_id = %chain.id, step = %step.spec.id, ?condition, "step skipped");
                step.state.mark(StepStatus::Skipped, "condition not met");
                self.runs.publish(chain.execution_status());
                continue;
            }

            let spec = chain.steps[index].spec.clone();
            let input = {
                let mut outputs = OutputTable::new();
                for step in &chain.steps[..index] {
                    if let Some(output) = &step.state.result {
                        outputs.insert(&step.spec, output);
                    }
                }
                resolve_input(&spec.id, &spec.input, &spec.input_mapping, &outputs)
            };
            let input = match input {
                Ok(input) => input,
                Err(err) => {
                    chain.steps[index]
                        .state
                        .end(StepStatus::Failed, Some(err.to_string()));
                    chain.mark_pending(index + 1, StepStatus::Skipped, "chain failed");
                    return Err(err);
                }
            };

            chain.steps[index].state.begin();
            self.runs.publish(chain.execution_status());
            let outcome = self
                .dispatcher
                .dispatch(&chain.id, &spec, input, token)
                .await;

            chain.total_cost += outcome.cost;
            let step = &mut chain.steps[index];
            step.state.assigned_to = outcome.agent;
            step.state.attempts = outcome.attempts;
            step.state.cost = outcome.cost;

            match outcome.result {
                Ok(output) => {
                    step.state.result = Some(output);
                    step.state.end(StepStatus::Completed, None);
                    last_succeeded = Some(true);
                    debug!(chain_id = %chain.id, step = %spec.id, cost = outcome.cost, "step completed");

                    if chain.over_budget() {
                        chain.mark_pending(index + 1, StepStatus::Cancelled, "budget exceeded");
                        return Err(WorkflowError::BudgetExceeded {
                            spent: chain.total_cost,
                            budget: chain.total_budget,
                        });
                    }
                }
                Err(StepFailure::Cancelled) => {
                    step.state.end(StepStatus::Cancelled, Some("chain cancelled".to_string()));
                    chain.mark_pending(index + 1, StepStatus::Cancelled, "chain cancelled");
                    return Err(WorkflowError::Cancelled(chain.id.clone()));
                }
                Err(failure) => {
                    step.state.end(StepStatus::Failed, Some(failure.to_string()));
                    last_succeeded = Some(false);

                    let handled = chain
                        .steps
                        .get(index + 1)
                        .is_some_and(|next| next.condition.accepts_failure());
                    if !handled {
                        chain.mark_pending(index + 1, StepStatus::Skipped, "previous step failed");
                        return Err(failure.into_workflow_error(&spec.id));
                    }
                    warn!(
                        chain_id = %chain.id,
                        step = %spec.id,
                        error = %failure,
                        "step failed, continuing with failure branch"
                    );
                }
            }
            self.runs.publish(chain.execution_status());
        }
        Ok(())
    }

    /// Cancel a running chain; false if it is not running
    pub fn cancel(&self, chain_id: &str) -> bool {
        let cancelled = self.runs.cancel(chain_id);
        if cancelled {
            info!(chain_id, "chain cancellation requested");
        }
        cancelled
    }

    /// Ids of chains currently executing
    pub fn active_executions(&self) -> Vec<String> {
        self.runs.ids()
    }

    /// Live status of a running chain; `None` once it has finished
    pub fn status(&self, chain_id: &str) -> Option<ExecutionStatus> {
        self.runs.status(chain_id)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot(self.runs.len())
    }
}
