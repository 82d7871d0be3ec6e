//! Step definitions and execution bookkeeping shared by chains and DAGs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use uuid::Uuid;

use crate::config::option_duration_ms;

/// Status of one step or node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Condition not met
    Skipped,
    /// Stopped by cancellation, timeout or an aborted run
    Cancelled,
    /// A dependency failed, so this node can never run
    Unreachable,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

/// Status of a whole chain or workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// When a chain step runs, judged against the nearest preceding step that ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCondition {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl StepCondition {
    pub fn accepts_failure(&self) -> bool {
        matches!(self, StepCondition::OnFailure | StepCondition::Always)
    }
}

/// What a step asks an agent to do
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepSpec {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Fixed agent; selection by capabilities when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub requirements: HashMap<String, String>,
    pub task_type: String,
    #[serde(default)]
    pub input: Map<String, Value>,
    /// Destination field → `"<step>.<field>"` reference into an earlier output
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_mapping: BTreeMap<String, String>,
    /// Per-attempt timeout; the executor default applies when absent
    #[serde(default, with = "option_duration_ms", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Maximum price offered to the agent
    #[serde(default)]
    pub budget: f64,
    #[serde(default)]
    pub max_retries: u32,
}

impl StepSpec {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            agent_id: None,
            capabilities: Vec::new(),
            requirements: HashMap::new(),
            task_type: task_type.into(),
            input: Map::new(),
            input_mapping: BTreeMap::new(),
            timeout: None,
            budget: 0.0,
            max_retries: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_requirement(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.requirements.insert(key.into(), value.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    /// Map `"<step>.<field>"` from an earlier output into input field `dest`
    pub fn with_input_mapping(mut self, dest: impl Into<String>, reference: impl Into<String>) -> Self {
        self.input_mapping.insert(dest.into(), reference.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_budget(mut self, budget: f64) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Name used in logs and references; falls back to the id
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Static checks common to chain steps and DAG nodes
    pub(crate) fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("step id is required".to_string());
        }
        if self.task_type.is_empty() {
            return Err(format!("step {}: task type is required", self.id));
        }
        let has_agent = self.agent_id.as_deref().is_some_and(|a| !a.is_empty());
        if !has_agent && self.capabilities.is_empty() {
            return Err(format!(
                "step {}: either an agent id or capabilities are required",
                self.id
            ));
        }
        if self.budget < 0.0 {
            return Err(format!("step {}: budget must not be negative", self.id));
        }
        Ok(())
    }

    pub(crate) fn ensure_id(&mut self) {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }
}

/// Execution record of a step or node
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepState {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Requests sent, including retries
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub execution_ms: u64,
}

impl StepState {
    pub(crate) fn begin(&mut self) {
        *self = StepState {
            status: StepStatus::Running,
            started_at: Some(Utc::now()),
            ..StepState::default()
        };
    }

    /// Move to a terminal status, stamping completion time and duration
    pub(crate) fn end(&mut self, status: StepStatus, error: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            self.execution_ms = (now - started).num_milliseconds().max(0) as u64;
        }
    }

    /// Terminal status for a step that never started
    pub(crate) fn mark(&mut self, status: StepStatus, reason: impl Into<String>) {
        self.status = status;
        self.error = Some(reason.into());
    }
}

/// Count of steps per status
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSummary {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub unreachable: usize,
}

impl StatusSummary {
    pub(crate) fn from_statuses(statuses: impl IntoIterator<Item = StepStatus>) -> Self {
        let mut summary = StatusSummary::default();
        for status in statuses {
            summary.total += 1;
            match status {
                StepStatus::Pending => summary.pending += 1,
                StepStatus::Running => summary.running += 1,
                StepStatus::Completed => summary.completed += 1,
                StepStatus::Failed => summary.failed += 1,
                StepStatus::Skipped => summary.skipped += 1,
                StepStatus::Cancelled => summary.cancelled += 1,
                StepStatus::Unreachable => summary.unreachable += 1,
            }
        }
        summary
    }
}

/// Point-in-time view of a chain or workflow that is still executing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionStatus {
    pub id: String,
    pub status: WorkflowStatus,
    /// Status per step or node id
    pub steps: BTreeMap<String, StepStatus>,
    pub summary: StatusSummary,
    pub total_cost: f64,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionStatus {
    pub(crate) fn capture<'a>(
        id: &str,
        status: WorkflowStatus,
        total_cost: f64,
        steps: impl IntoIterator<Item = (&'a str, StepStatus)>,
    ) -> Self {
        let steps: BTreeMap<String, StepStatus> = steps
            .into_iter()
            .map(|(step, status)| (step.to_string(), status))
            .collect();
        Self {
            id: id.to_string(),
            status,
            summary: StatusSummary::from_statuses(steps.values().copied()),
            steps,
            total_cost,
            updated_at: Utc::now(),
        }
    }

    pub fn step(&self, id: &str) -> Option<StepStatus> {
        self.steps.get(id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_spec_check() {
        assert!(StepSpec::new("s", "summarize").check().is_err());
        assert!(StepSpec::new("s", "").with_agent("a").check().is_err());
        assert!(StepSpec::new("s", "summarize").with_agent("a").check().is_ok());
        assert!(StepSpec::new("s", "summarize")
            .with_capabilities(["nlp"])
            .check()
            .is_ok());
    }

    #[test]
    fn test_spec_wire_format() {
        let spec = StepSpec::new("s1", "translate")
            .with_capabilities(["nlp"])
            .with_input_mapping("text", "fetch.body")
            .with_timeout(Duration::from_secs(2));
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["timeout"], json!(2000));
        assert_eq!(value["input_mapping"]["text"], json!("fetch.body"));

        let back: StepSpec = serde_json::from_value(value).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_state_lifecycle() {
        let mut state = StepState::default();
        state.begin();
        assert_eq!(state.status, StepStatus::Running);
        assert!(state.started_at.is_some());

        state.end(StepStatus::Failed, Some("boom".into()));
        assert!(state.status.is_terminal());
        assert_eq!(state.error.as_deref(), Some("boom"));
        assert!(state.completed_at.is_some());
    }

    #[test]
    fn test_summary_counts() {
        let summary = StatusSummary::from_statuses([
            StepStatus::Completed,
            StepStatus::Completed,
            StepStatus::Unreachable,
            StepStatus::Failed,
        ]);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.unreachable, 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn test_execution_status_capture() {
        let status = ExecutionStatus::capture(
            "run",
            WorkflowStatus::Running,
            1.5,
            [("b", StepStatus::Running), ("a", StepStatus::Completed)],
        );
        assert_eq!(status.step("a"), Some(StepStatus::Completed));
        assert_eq!(status.step("missing"), None);
        assert_eq!(status.summary.running, 1);
        assert_eq!(status.steps.keys().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn test_condition_serializes_screaming() {
        assert_eq!(
            serde_json::to_value(StepCondition::OnFailure).unwrap(),
            json!("ON_FAILURE")
        );
        assert!(StepCondition::Always.accepts_failure());
        assert!(!StepCondition::OnSuccess.accepts_failure());
    }
}
