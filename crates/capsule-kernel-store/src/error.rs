//! Error types for the capsule store.

use thiserror::Error;

use capsule_kernel_core::{CapsuleId, CoreError};

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Capsule serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("capsule not found: {0}")]
    NotFound(CapsuleId),

    /// A capsule with this id is already stored.
    #[error("capsule already stored: {0}")]
    Duplicate(CapsuleId),

    /// The key already has an active capsule.
    #[error("conflict: {subject_id}/{dimension} already has active capsule {active}")]
    Conflict {
        subject_id: String,
        dimension: String,
        active: CapsuleId,
    },

    /// Tried to supersede a capsule that is no longer active.
    #[error("capsule {0} was already superseded")]
    AlreadySuperseded(CapsuleId),

    /// Capsule or proof failed verification.
    #[error("integrity error: {0}")]
    Integrity(#[from] CoreError),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Blocking task failed to complete.
    #[error("task error: {0}")]
    Task(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Task(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
