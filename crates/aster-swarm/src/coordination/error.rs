use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Error types for coordination operations
///
/// Serializable so the same error reaches remote callers unchanged.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoordinationError {
    /// Resource held in a conflicting mode past the caller's wait bound
    #[error("Lock conflict on {resource}: held by {holders:?}")]
    LockConflict {
        resource: String,
        holders: Vec<String>,
    },

    /// Token does not name a live lock
    #[error("Invalid lock token: {0}")]
    InvalidToken(String),

    /// Lease ran out before renewal
    #[error("Lock expired: {0}")]
    LockExpired(String),

    /// Optimistic write against a stale version
    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Read-modify-write kept losing races
    #[error("Update of {key} gave up after {attempts} attempts")]
    UpdateRetriesExhausted { key: String, attempts: u32 },

    /// Barrier not satisfied in time
    #[error("Barrier {name} timed out with {arrived}/{required} arrivals")]
    BarrierTimeout {
        name: String,
        arrived: usize,
        required: usize,
    },

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Service shut down
    #[error("Coordination service stopped")]
    Stopped,

    /// Remote caller gave up before the request was served
    #[error("Coordination request {0} abandoned by its caller")]
    Abandoned(String),

    /// Remote coordination call failed in transit
    #[error("Remote coordination failed: {0}")]
    Remote(String),
}

impl CoordinationError {
    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::LockConflict { .. }
                | CoordinationError::VersionConflict { .. }
                | CoordinationError::Remote(_)
        )
    }
}
