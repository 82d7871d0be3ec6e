//! DAG Workflow Executor
//!
//! Runs a dependency graph of steps with bounded parallelism. A node
//! becomes eligible once every dependency has completed; eligible nodes
//! are dispatched as capacity frees up.
//!
//! # Features
//! - Depth-first cycle detection before anything is dispatched
//! - Remaining-dependency counting for eligibility
//! - `max_parallelism` (0 = unbounded)
//! - Workflow-wide timeout that abandons in-flight nodes
//! - Transitive UNREACHABLE marking behind failed nodes
//! - Fail-fast or best-effort failure policy

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::{
    ActiveRuns, ExecutorConfig, ExecutorCounters, ExecutorStats, StepDispatcher, StepFailure,
    StepOutcome,
};
use super::error::{WorkflowError, WorkflowResult};
use super::mapping::{referenced_step, resolve_input, OutputTable};
use super::selector::AgentSelector;
use super::types::{
    ExecutionStatus, StatusSummary, StepSpec, StepState, StepStatus, WorkflowStatus,
};
use crate::bus::MessageBus;
use crate::config::option_duration_ms;

/// What a node failure does to the rest of the workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop at the first failure and cancel everything else
    #[default]
    FailFast,
    /// Keep running every node still reachable
    BestEffort,
}

/// A step plus the nodes it waits for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DagNode {
    #[serde(flatten)]
    pub spec: StepSpec,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub state: StepState,
}

impl DagNode {
    pub fn new(spec: StepSpec) -> Self {
        Self {
            spec,
            dependencies: Vec::new(),
            state: StepState::default(),
        }
    }

    pub fn depends_on(mut self, node_id: impl Into<String>) -> Self {
        let node_id = node_id.into();
        if !self.dependencies.contains(&node_id) {
            self.dependencies.push(node_id);
        }
        self
    }

    pub fn with_dependencies<I, S>(self, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        node_ids.into_iter().fold(self, |node, id| node.depends_on(id))
    }

    fn unique_dependencies(&self) -> HashSet<&str> {
        self.dependencies.iter().map(String::as_str).collect()
    }
}

impl From<StepSpec> for DagNode {
    fn from(spec: StepSpec) -> Self {
        Self::new(spec)
    }
}

/// A dependency graph of steps; mutated in place by execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagWorkflow {
    pub id: String,
    pub name: String,
    pub nodes: BTreeMap<String, DagNode>,
    /// Zero means unbounded
    #[serde(default)]
    pub max_parallelism: usize,
    /// Bound on the whole execution
    #[serde(default, with = "option_duration_ms", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Zero means unlimited
    #[serde(default)]
    pub total_budget: f64,
    #[serde(default)]
    pub total_cost: f64,
    /// Executor default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,
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

impl DagWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            nodes: BTreeMap::new(),
            max_parallelism: 0,
            timeout: None,
            total_budget: 0.0,
            total_cost: 0.0,
            failure_policy: None,
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

    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_budget(mut self, total_budget: f64) -> Self {
        self.total_budget = total_budget;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = Some(policy);
        self
    }

    /// Add a node; a node without an id gets a generated one
    pub fn add_node(&mut self, node: impl Into<DagNode>) -> WorkflowResult<()> {
        let mut node = node.into();
        node.spec.ensure_id();
        if self.nodes.contains_key(&node.spec.id) {
            return Err(WorkflowError::InvalidWorkflow(format!(
                "duplicate node id {}",
                node.spec.id
            )));
        }
        self.nodes.insert(node.spec.id.clone(), node);
        Ok(())
    }

    /// Builder form of [`add_node`](Self::add_node)
    pub fn with_node(mut self, node: impl Into<DagNode>) -> WorkflowResult<Self> {
        self.add_node(node)?;
        Ok(self)
    }

    pub fn node(&self, id: &str) -> Option<&DagNode> {
        self.nodes.get(id)
    }

    /// Output of a completed node
    pub fn output(&self, id: &str) -> Option<&Map<String, Value>> {
        self.nodes.get(id).and_then(|n| n.state.result.as_ref())
    }

    pub fn summary(&self) -> StatusSummary {
        StatusSummary::from_statuses(self.nodes.values().map(|n| n.state.status))
    }

    /// Snapshot of the workflow and every node's status
    pub fn execution_status(&self) -> ExecutionStatus {
        ExecutionStatus::capture(
            &self.id,
            self.status,
            self.total_cost,
            self.nodes
                .iter()
                .map(|(id, node)| (id.as_str(), node.state.status)),
        )
    }

    /// Static checks run before any node is dispatched
    pub fn validate(&self) -> WorkflowResult<()> {
        let invalid = |msg: String| WorkflowError::InvalidWorkflow(msg);
        if self.id.is_empty() {
            return Err(invalid("workflow id is required".to_string()));
        }
        if self.nodes.is_empty() {
            return Err(invalid(format!("workflow {} has no nodes", self.id)));
        }
        if self.total_budget < 0.0 {
            return Err(invalid("total budget must not be negative".to_string()));
        }

        if let Some(cycle) = self.detect_cycle() {
            return Err(WorkflowError::CycleDetected(cycle));
        }

        for (id, node) in &self.nodes {
            if id != &node.spec.id {
                return Err(invalid(format!("node key {} does not match id {}", id, node.spec.id)));
            }
            node.spec.check().map_err(invalid)?;
            for dep in &node.dependencies {
                if !self.nodes.contains_key(dep) {
                    return Err(invalid(format!("node {} depends on unknown node {}", id, dep)));
                }
            }
            for reference in node.spec.input_mapping.values() {
                let source = referenced_step(reference).map_err(|reason| {
                    WorkflowError::InputMapping {
                        step: id.clone(),
                        reason,
                    }
                })?;
                let declared = node.dependencies.iter().any(|dep| {
                    dep == source || self.nodes.get(dep).is_some_and(|d| d.spec.name == source)
                });
                if !declared {
                    return Err(WorkflowError::InputMapping {
                        step: id.clone(),
                        reason: format!("{:?} does not name a declared dependency", reference),
                    });
                }
            }
        }
        Ok(())
    }

    /// First dependency cycle found, as the path that closes it
    pub fn detect_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for node_id in self.nodes.keys() {
            if !visited.contains(node_id.as_str()) {
                if let Some(cycle) =
                    self.dfs_detect_cycle(node_id, &mut visited, &mut rec_stack, &mut path)
                {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn dfs_detect_cycle<'a>(
        &'a self,
        node_id: &'a str,
        visited: &mut HashSet<&'a str>,
        rec_stack: &mut HashSet<&'a str>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node_id);
        rec_stack.insert(node_id);
        path.push(node_id);

        // Unknown dependencies are reported separately
        let deps = self
            .nodes
            .get(node_id)
            .map(|n| n.dependencies.as_slice())
            .unwrap_or_default();
        for dep in deps {
            let dep = dep.as_str();
            if !self.nodes.contains_key(dep) {
                continue;
            }
            if !visited.contains(dep) {
                if let Some(cycle) = self.dfs_detect_cycle(dep, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let start = path.iter().position(|id| *id == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..].iter().map(|id| id.to_string()).collect();
                cycle.push(dep.to_string());
                return Some(cycle);
            }
        }

        path.pop();
        rec_stack.remove(node_id);
        None
    }

    /// Reverse edges: node id -> nodes that depend on it
    fn dependents(&self) -> HashMap<String, Vec<String>> {
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for (id, node) in &self.nodes {
            for dep in node.unique_dependencies() {
                dependents.entry(dep.to_string()).or_default().push(id.clone());
            }
        }
        dependents
    }

    /// Mark every pending node reachable from `failed` as UNREACHABLE
    fn mark_unreachable(&mut self, failed: &str, dependents: &HashMap<String, Vec<String>>) -> usize {
        let mut marked = 0;
        let mut queue: VecDeque<&str> = VecDeque::from([failed]);
        while let Some(id) = queue.pop_front() {
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(node) = self.nodes.get_mut(dependent) {
                    if node.state.status == StepStatus::Pending {
                        node.state
                            .mark(StepStatus::Unreachable, format!("dependency {} failed", failed));
                        marked += 1;
                        queue.push_back(dependent.as_str());
                    }
                }
            }
        }
        marked
    }

    /// Set every node still pending or running to `status`
    fn mark_unfinished(&mut self, status: StepStatus, reason: &str) {
        for node in self.nodes.values_mut() {
            match node.state.status {
                StepStatus::Pending => node.state.mark(status, reason),
                StepStatus::Running => node.state.end(status, Some(reason.to_string())),
                _ => {}
            }
        }
    }

    fn over_budget(&self) -> bool {
        self.total_budget > 0.0 && self.total_cost > self.total_budget
    }
}

/// Why the scheduling loop stopped early
enum Abort {
    Failed(WorkflowError),
    Cancelled,
    TimedOut,
}

enum Event {
    Finished(String, StepOutcome),
    Cancelled,
    TimedOut,
}

/// Executes [`DagWorkflow`]s
pub struct DagExecutor {
    dispatcher: StepDispatcher,
    runs: Arc<ActiveRuns>,
    counters: Arc<ExecutorCounters>,
}

impl DagExecutor {
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

    /// Run `workflow` to a terminal state
    pub async fn execute_dag(&self, workflow: &mut DagWorkflow) -> WorkflowResult<()> {
        self.execute_dag_with_cancel(workflow, CancellationToken::new())
            .await
    }

    /// Run `workflow`, stopping early when `cancel` fires
    pub async fn execute_dag_with_cancel(
        &self,
        workflow: &mut DagWorkflow,
        cancel: CancellationToken,
    ) -> WorkflowResult<()> {
        if let Err(err) = workflow.validate() {
            error!(workflow_id = %workflow.id, error = %err, "workflow rejected");
            workflow.status = WorkflowStatus::Failed;
            workflow.error = Some(err.to_string());
            return Err(err);
        }

        let token = cancel.child_token();
        let _guard = self.runs.register(&workflow.id, token.clone())?;
        self.counters.record_started();

        workflow.status = WorkflowStatus::Running;
        workflow.started_at = Some(Utc::now());
        workflow.completed_at = None;
        workflow.error = None;
        workflow.total_cost = 0.0;
        for node in workflow.nodes.values_mut() {
            node.state = StepState::default();
        }
        info!(
            workflow_id = %workflow.id,
            name = %workflow.name,
            nodes = workflow.nodes.len(),
            max_parallelism = workflow.max_parallelism,
            "workflow started"
        );
        self.runs.publish(workflow.execution_status());

        let result = self.run(workflow, &token).await;

        workflow.completed_at = Some(Utc::now());
        match &result {
            Ok(()) => {
                workflow.status = WorkflowStatus::Completed;
                info!(
                    workflow_id = %workflow.id,
                    total_cost = workflow.total_cost,
                    "workflow completed"
                );
            }
            Err(err @ WorkflowError::Cancelled(_)) => {
                workflow.status = WorkflowStatus::Cancelled;
                workflow.error = Some(err.to_string());
                warn!(workflow_id = %workflow.id, "workflow cancelled");
            }
            Err(err) => {
                workflow.status = WorkflowStatus::Failed;
                workflow.error = Some(err.to_string());
                error!(workflow_id = %workflow.id, error = %err, "workflow failed");
            }
        }
        self.counters.record_finished(&result);
        result
    }

    async fn run(&self, workflow: &mut DagWorkflow, token: &CancellationToken) -> WorkflowResult<()> {
        let policy = workflow
            .failure_policy
            .unwrap_or(self.config().failure_policy);
        let deadline = workflow.timeout.map(|t| Instant::now() + t);
        let limit = match workflow.max_parallelism {
            0 => usize::MAX,
            n => n,
        };

        let dependents = workflow.dependents();
        let mut remaining: HashMap<String, usize> = workflow
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.unique_dependencies().len()))
            .collect();
        let mut ready: VecDeque<String> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        ready.make_contiguous().sort();

        let mut in_flight: FuturesUnordered<BoxFuture<'static, (String, StepOutcome)>> =
            FuturesUnordered::new();
        let mut failed: Vec<String> = Vec::new();

        let abort = 'schedule: loop {
            while in_flight.len() < limit {
                let Some(id) = ready.pop_front() else { break };
                match self.launch(workflow, &id, token) {
                    Ok(future) => in_flight.push(future),
                    Err(err) => {
                        // Unresolvable mapping fails the node without dispatching it
                        if let Some(node) = workflow.nodes.get_mut(&id) {
                            node.state.end(StepStatus::Failed, Some(err.to_string()));
                        }
                        workflow.mark_unreachable(&id, &dependents);
                        failed.push(id);
                        if policy == FailurePolicy::FailFast {
                            break 'schedule Some(Abort::Failed(err));
                        }
                    }
                }
            }
            self.runs.publish(workflow.execution_status());
            if in_flight.is_empty() {
                break None;
            }

            let event = tokio::select! {
                biased;
                _ = token.cancelled() => Event::Cancelled,
                _ = sleep_until(deadline) => Event::TimedOut,
                Some((id, outcome)) = in_flight.next() => Event::Finished(id, outcome),
            };

            let (id, outcome) = match event {
                Event::Cancelled => break Some(Abort::Cancelled),
                Event::TimedOut => break Some(Abort::TimedOut),
                Event::Finished(id, outcome) => (id, outcome),
            };

            workflow.total_cost += outcome.cost;
            let Some(node) = workflow.nodes.get_mut(&id) else {
                continue;
            };
            node.state.assigned_to = outcome.agent;
            node.state.attempts = outcome.attempts;
            node.state.cost = outcome.cost;

            match outcome.result {
                Ok(output) => {
                    node.state.result = Some(output);
                    node.state.end(StepStatus::Completed, None);
                    debug!(workflow_id = %workflow.id, node = %id, "node completed");

                    for dependent in dependents.get(&id).into_iter().flatten() {
                        if let Some(count) = remaining.get_mut(dependent) {
                            *count = count.saturating_sub(1);
                            let pending = workflow
                                .nodes
                                .get(dependent)
                                .is_some_and(|n| n.state.status == StepStatus::Pending);
                            if *count == 0 && pending {
                                ready.push_back(dependent.clone());
                            }
                        }
                    }

                    if workflow.over_budget() {
                        break Some(Abort::Failed(WorkflowError::BudgetExceeded {
                            spent: workflow.total_cost,
                            budget: workflow.total_budget,
                        }));
                    }
                }
                Err(StepFailure::Cancelled) => {
                    node.state
                        .end(StepStatus::Cancelled, Some("workflow cancelled".to_string()));
                    break Some(Abort::Cancelled);
                }
                Err(failure) => {
                    node.state.end(StepStatus::Failed, Some(failure.to_string()));
                    let unreachable = workflow.mark_unreachable(&id, &dependents);
                    warn!(
                        workflow_id = %workflow.id,
                        node = %id,
                        unreachable,
                        error = %failure,
                        "node failed"
                    );
                    failed.push(id.clone());
                    if policy == FailurePolicy::FailFast {
                        break Some(Abort::Failed(failure.into_workflow_error(&id)));
                    }
                }
            }
        };

        // Abandon whatever is still in flight; late responses miss their waiter
        drop(in_flight);

        match abort {
            None => {
                if !failed.is_empty() {
                    failed.sort();
                    workflow.error = Some(format!("failed nodes: {}", failed.join(", ")));
                }
                Ok(())
            }
            Some(Abort::Failed(err)) => {
                workflow.mark_unfinished(StepStatus::Cancelled, "workflow aborted");
                Err(err)
            }
            Some(Abort::Cancelled) => {
                workflow.mark_unfinished(StepStatus::Cancelled, "workflow cancelled");
                Err(WorkflowError::Cancelled(workflow.id.clone()))
            }
            Some(Abort::TimedOut) => {
                workflow.mark_unfinished(StepStatus::Cancelled, "abandoned at workflow timeout");
                let timeout_ms = workflow.timeout.map(|t| t.as_millis()).unwrap_or_default();
                Err(WorkflowError::Timeout(format!(
                    "workflow {} exceeded {}ms",
                    workflow.id, timeout_ms
                )))
            }
        }
    }

    /// Resolve a node's input and start dispatching it
    fn launch(
        &self,
        workflow: &mut DagWorkflow,
        id: &str,
        token: &CancellationToken,
    ) -> WorkflowResult<BoxFuture<'static, (String, StepOutcome)>> {
        let (spec, input) = {
            let node = workflow
                .nodes
                .get(id)
                .ok_or_else(|| WorkflowError::InvalidWorkflow(format!("unknown node {}", id)))?;
            let mut outputs = OutputTable::new();
            for dep in &node.dependencies {
                if let Some(dep_node) = workflow.nodes.get(dep) {
                    if let Some(output) = &dep_node.state.result {
                        outputs.insert(&dep_node.spec, output);
                    }
                }
            }
            let input = resolve_input(id, &node.spec.input, &node.spec.input_mapping, &outputs)?;
            (node.spec.clone(), input)
        };

        if let Some(node) = workflow.nodes.get_mut(id) {
            node.state.begin();
        }
        debug!(workflow_id = %workflow.id, node = %id, "node dispatched");

        let dispatcher = self.dispatcher.clone();
        let run_id = workflow.id.clone();
        let token = token.clone();
        let id = id.to_string();
        Ok(async move {
            let outcome = dispatcher.dispatch(&run_id, &spec, input, &token).await;
            (id, outcome)
        }
        .boxed())
    }

    /// Cancel a running workflow; false if it is not running
    pub fn cancel(&self, workflow_id: &str) -> bool {
        let cancelled = self.runs.cancel(workflow_id);
        if cancelled {
            info!(workflow_id, "workflow cancellation requested");
        }
        cancelled
    }

    /// Ids of workflows currently executing
    pub fn active_executions(&self) -> Vec<String> {
        self.runs.ids()
    }

    /// Live status of a running workflow; `None` once it has finished
    pub fn status(&self, workflow_id: &str) -> Option<ExecutionStatus> {
        self.runs.status(workflow_id)
    }

    pub fn stats(&self) -> ExecutorStats {
        self.counters.snapshot(self.runs.len())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str) -> DagNode {
        DagNode::new(StepSpec::new(id, "work").with_capabilities(["compute"]))
    }

    fn diamond() -> DagWorkflow {
        DagWorkflow::new("diamond")
            .with_node(node("a"))
            .unwrap()
            .with_node(node("b").depends_on("a"))
            .unwrap()
            .with_node(node("c").depends_on("a"))
            .unwrap()
            .with_node(node("d").with_dependencies(["b", "c"]))
            .unwrap()
    }

    #[test]
    fn test_diamond_validates() {
        let workflow = diamond();
        assert!(workflow.validate().is_ok());
        assert!(workflow.detect_cycle().is_none());
    }

    #[test]
    fn test_cycle_reported_as_path() {
        let workflow = DagWorkflow::new("loop")
            .with_node(node("a").depends_on("c"))
            .unwrap()
            .with_node(node("b").depends_on("a"))
            .unwrap()
            .with_node(node("c").depends_on("b"))
            .unwrap();
        match workflow.validate() {
            Err(WorkflowError::CycleDetected(path)) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let workflow = DagWorkflow::new("self").with_node(node("a").depends_on("a")).unwrap();
        assert_eq!(
            workflow.validate(),
            Err(WorkflowError::CycleDetected(vec!["a".into(), "a".into()]))
        );
    }

    #[test]
    fn test_unknown_dependency_and_mapping_rejected() {
        let missing = DagWorkflow::new("w").with_node(node("a").depends_on("ghost")).unwrap();
        assert!(matches!(missing.validate(), Err(WorkflowError::InvalidWorkflow(_))));

        let undeclared = DagWorkflow::new("w")
            .with_node(node("a"))
            .unwrap()
            .with_node(DagNode::new(
                StepSpec::new("b", "work")
                    .with_capabilities(["compute"])
                    .with_input_mapping("x", "a.value"),
            ))
            .unwrap();
        assert!(matches!(
            undeclared.validate(),
            Err(WorkflowError::InputMapping { ref step, .. }) if step == "b"
        ));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let mut workflow = DagWorkflow::new("w");
        workflow.add_node(node("a")).unwrap();
        assert!(workflow.add_node(node("a")).is_err());
    }

    #[test]
    fn test_unreachable_marking_is_transitive() {
        let mut workflow = diamond()
            .with_node(node("e").depends_on("d"))
            .unwrap()
            .with_node(node("f").depends_on("a"))
            .unwrap();
        let dependents = workflow.dependents();
        workflow.nodes.get_mut("b").unwrap().state.status = StepStatus::Failed;

        let marked = workflow.mark_unreachable("b", &dependents);
        assert_eq!(marked, 2);
        assert_eq!(workflow.node("d").unwrap().state.status, StepStatus::Unreachable);
        assert_eq!(workflow.node("e").unwrap().state.status, StepStatus::Unreachable);
        assert_eq!(workflow.node("c").unwrap().state.status, StepStatus::Pending);
        assert_eq!(workflow.node("f").unwrap().state.status, StepStatus::Pending);
    }

    #[test]
    fn test_failure_policy_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(FailurePolicy::BestEffort).unwrap(),
            serde_json::json!("best_effort")
        );
    }
}
