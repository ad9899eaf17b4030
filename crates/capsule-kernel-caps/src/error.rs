//! Error types for the capability engine.

use thiserror::Error;

use crate::capability::CapabilityId;
use crate::rights::{ResourceType, Rights};

/// Why a capability check, delegation or issue failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// Token tag does not verify under this engine's secret.
    #[error("invalid capability token")]
    InvalidToken,

    #[error("capability not found: {0}")]
    NotFound(CapabilityId),

    #[error("capability revoked: {0}")]
    Revoked(CapabilityId),

    #[error("capability expired: {0}")]
    Expired(CapabilityId),

    #[error("resource type mismatch: held {held}, requested {requested}")]
    ResourceTypeMismatch {
        held: ResourceType,
        requested: ResourceType,
    },

    #[error("path {path:?} does not match pattern {pattern:?}")]
    PatternMismatch { pattern: String, path: String },

    #[error("insufficient rights: required {required}, held {held}")]
    InsufficientRights { required: Rights, held: Rights },

    #[error("usage limit exceeded: {0}")]
    UsageLimitExceeded(CapabilityId),

    /// Delegation asked for rights the parent does not hold.
    #[error("delegation exceeds grant: {excess} not held")]
    DelegationExceedsGrant { excess: Rights },

    /// The parent lacks the `delegate` right.
    #[error("delegation not permitted by {0}")]
    DelegationNotPermitted(CapabilityId),

    #[error("invalid resource pattern: {0}")]
    InvalidPattern(String),
}

impl CapabilityError {
    /// Short machine-readable reason, used in audit entries and IPC denials.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CapabilityError::InvalidToken => "invalid_token",
            CapabilityError::NotFound(_) => "not_found",
            CapabilityError::Revoked(_) => "revoked",
            CapabilityError::Expired(_) => "expired",
            CapabilityError::ResourceTypeMismatch { .. } => "resource_type_mismatch",
            CapabilityError::PatternMismatch { .. } => "pattern_mismatch",
            CapabilityError::InsufficientRights { .. } => "insufficient_rights",
            CapabilityError::UsageLimitExceeded(_) => "usage_limit_exceeded",
            CapabilityError::DelegationExceedsGrant { .. } => "delegation_exceeds_grant",
            CapabilityError::DelegationNotPermitted(_) => "delegation_not_permitted",
            CapabilityError::InvalidPattern(_) => "invalid_pattern",
        }
    }
}

/// Result type for capability operations.
pub type Result<T> = std::result::Result<T, CapabilityError>;
