// src/errors.rs
//
// =============================================================================
// LABFLOW: ERROR TAXONOMY
// =============================================================================
//
// The split matters operationally:
// - Validation is rejected synchronously and never partially applied.
// - Cancelled is control flow, not failure; it unwinds blocking operations
//   after resources are released.
// - TaskFailed is recorded on the task and never crashes the scheduler.
// - Resource scarcity is NOT an error; the coordinator retries.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabError {
    /// Malformed experiment, cyclic task graph, unknown resource or type name.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The caller's cancellation flag was set while blocked.
    #[error("operation cancelled")]
    Cancelled,

    /// A state machine refused a transition (e.g. responding to a
    /// non-pending input request, cancelling a completed task).
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// Failure raised by task plugin code; caught at the supervision boundary.
    #[error("task failed: {0}")]
    TaskFailed(String),

    /// Failure raised by a device driver.
    #[error("device error: {0}")]
    Device(String),

    /// The persistent store refused the operation. Fatal for the operation,
    /// not for the process; scheduler loops log and retry next cycle.
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LabError>;

impl LabError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LabError::Validation(msg.into())
    }
}
