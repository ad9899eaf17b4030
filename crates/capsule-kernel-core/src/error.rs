//! Error types for the Capsule Kernel Core.

use thiserror::Error;

use crate::types::{CapsuleId, ProofId};

/// Core errors raised while building, sealing, or verifying records.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("seal mismatch on proof {proof_id}: expected {expected}, got {actual}")]
    SealMismatch {
        proof_id: ProofId,
        expected: String,
        actual: String,
    },

    #[error("confidence must be within [0, 1], got {0}")]
    InvalidConfidence(f64),

    #[error("operation name must not be empty")]
    EmptyOperation,

    #[error("value cannot be canonicalized: {0}")]
    NonCanonicalValue(String),

    #[error("capsule {0} failed verification")]
    CapsuleTampered(CapsuleId),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            CoreError::DecodingError(e.to_string())
        } else {
            CoreError::EncodingError(e.to_string())
        }
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
