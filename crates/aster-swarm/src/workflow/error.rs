use thiserror::Error;

use super::selector::SelectionError;

/// Result type alias for workflow operations
pub type WorkflowResult<T> = Result<T, WorkflowError>;

/// Error types for chain and DAG execution
#[derive(Debug, Clone, Error, PartialEq)]
pub enum WorkflowError {
    /// Definition rejected before anything ran
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// Dependency cycle, as the path that closes it
    #[error("Cycle detected: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    /// A dotted input reference could not be resolved
    #[error("Input mapping for step {step}: {reason}")]
    InputMapping { step: String, reason: String },

    /// No agent could be selected for a step
    #[error(transparent)]
    Selection(#[from] SelectionError),

    /// A step or the whole workflow ran out of time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A step failed after its retries
    #[error("Step {step} failed: {error}")]
    StepFailed { step: String, error: String },

    /// Accumulated cost passed the total budget
    #[error("Budget exceeded: spent {spent:.4} of {budget:.4}")]
    BudgetExceeded { spent: f64, budget: f64 },

    /// Cancelled by the caller
    #[error("Execution cancelled: {0}")]
    Cancelled(String),

    /// An execution with the same id is already running
    #[error("Already running: {0}")]
    AlreadyRunning(String),
}
