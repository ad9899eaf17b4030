//! Error types for the scheduler.

use thiserror::Error;

use crate::process::{ProcessId, ProcessState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedError {
    #[error("process not found: {0}")]
    NotFound(ProcessId),

    /// The operation is not legal from the process's current state.
    #[error("cannot {op} {pid} in state {from}")]
    InvalidTransition {
        pid: ProcessId,
        from: ProcessState,
        op: &'static str,
    },
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedError>;
