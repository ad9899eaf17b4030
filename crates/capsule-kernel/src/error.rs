//! Error types for the Kernel.
//!
//! Every subsystem error converts into [`KernelError`]. Callers that need to
//! decide what to do next use [`KernelError::class`]: user errors are
//! rejected, logic errors are retried by the supervisor, resource errors are
//! surfaced to the caller, integrity errors quarantine, system errors are
//! fatal.

use capsule_kernel_caps::CapabilityError;
use capsule_kernel_core::CoreError;
use capsule_kernel_ipc::IpcError;
use capsule_kernel_sched::{SchedError, TrapKind};
use capsule_kernel_store::StoreError;
use thiserror::Error;

use crate::rules::RuleError;

/// Broad classes of failure, in escalating severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorClass {
    User,
    Logic,
    Resource,
    Integrity,
    System,
}

impl ErrorClass {
    /// First code of the class's numeric range.
    pub fn base_code(&self) -> u16 {
        match self {
            ErrorClass::User => 100,
            ErrorClass::Logic => 200,
            ErrorClass::Resource => 300,
            ErrorClass::Integrity => 400,
            ErrorClass::System => 500,
        }
    }
}

/// Errors that can occur during Kernel operations.
#[derive(Debug, Error)]
pub enum KernelError {
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("capability denied: {0}")]
    Capability(#[from] CapabilityError),

    #[error("scheduler error: {0}")]
    Sched(#[from] SchedError),

    #[error("ipc error: {0}")]
    Ipc(#[from] IpcError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("rule error: {0}")]
    Rule(#[from] RuleError),

    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    #[error("module {0} is unsigned and signatures are required")]
    SignatureMissing(String),

    #[error("invalid signature on module {0}")]
    InvalidSignature(String),

    /// A required capability was refused by the grant policy. Everything
    /// issued for the module was revoked.
    #[error("spawn permission denied for {module_id}: {request} ({reason})")]
    SpawnPermissionDenied {
        module_id: String,
        request: String,
        reason: String,
    },

    /// A hot swap asked for a capability the module does not already hold.
    #[error("escalation rejected for {module_id}: {request} not held")]
    EscalationRejected { module_id: String, request: String },

    #[error("module not found: {0}")]
    ModuleNotFound(String),

    #[error("module already loaded: {0}")]
    ModuleExists(String),

    #[error("syscall {syscall} not allowed for {module_id}")]
    SyscallNotAllowed { module_id: String, syscall: String },

    #[error("network fetch denied: {0}")]
    NetworkDenied(String),

    #[error("no rule registered for operation {0}")]
    UnknownOperation(String),

    #[error("subject {0} is quarantined pending review")]
    Quarantined(String),

    #[error("audit chain broken at sequence {0}")]
    AuditChainBroken(u64),

    #[error("module trapped: {0}")]
    Trap(TrapKind),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A kernel invariant no longer holds.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl KernelError {
    pub fn class(&self) -> ErrorClass {
        match self {
            KernelError::Capability(_)
            | KernelError::InvalidManifest(_)
            | KernelError::SpawnPermissionDenied { .. }
            | KernelError::EscalationRejected { .. }
            | KernelError::ModuleNotFound(_)
            | KernelError::ModuleExists(_)
            | KernelError::SyscallNotAllowed { .. }
            | KernelError::NetworkDenied(_)
            | KernelError::UnknownOperation(_)
            | KernelError::Config(_) => ErrorClass::User,

            KernelError::Rule(RuleError::InvalidInput(_)) => ErrorClass::User,
            KernelError::Rule(RuleError::Trap(kind)) | KernelError::Trap(kind) => {
                if kind.is_recoverable() {
                    ErrorClass::Resource
                } else {
                    ErrorClass::Logic
                }
            }
            KernelError::Rule(RuleError::Failed(_)) => ErrorClass::Logic,

            KernelError::Ipc(err) => match err {
                IpcError::SendPermissionDenied(_)
                | IpcError::MailboxNotFound(_)
                | IpcError::NameTaken(_)
                | IpcError::MailboxExists(_)
                | IpcError::Payload(_) => ErrorClass::User,
                IpcError::MailboxFull(_) => ErrorClass::Resource,
                IpcError::ShuttingDown => ErrorClass::System,
            },

            KernelError::Core(err) => match err {
                CoreError::SealMismatch { .. }
                | CoreError::CapsuleTampered(_)
                | CoreError::InvalidSignature => ErrorClass::Integrity,
                _ => ErrorClass::User,
            },

            KernelError::Store(err) => match err {
                StoreError::NotFound(_) | StoreError::Duplicate(_) => ErrorClass::User,
                StoreError::Conflict { .. } | StoreError::AlreadySuperseded(_) => ErrorClass::Logic,
                StoreError::Integrity(_) => ErrorClass::Integrity,
                _ => ErrorClass::System,
            },

            KernelError::SignatureMissing(_)
            | KernelError::InvalidSignature(_)
            | KernelError::Quarantined(_)
            | KernelError::AuditChainBroken(_) => ErrorClass::Integrity,

            KernelError::Sched(_) | KernelError::Io(_) | KernelError::Invariant(_) => {
                ErrorClass::System
            }
        }
    }

    /// Stable numeric code inside the class range.
    pub fn code(&self) -> u16 {
        let offset = match self {
            KernelError::Capability(_) => 1,
            KernelError::InvalidManifest(_) => 2,
            KernelError::SpawnPermissionDenied { .. } => 3,
            KernelError::EscalationRejected { .. } => 4,
            KernelError::ModuleNotFound(_) => 5,
            KernelError::ModuleExists(_) => 6,
            KernelError::SyscallNotAllowed { .. } => 7,
            KernelError::NetworkDenied(_) => 8,
            KernelError::UnknownOperation(_) => 9,
            KernelError::Config(_) => 10,
            KernelError::Rule(_) => 11,
            KernelError::Ipc(_) => 12,
            KernelError::Core(_) => 13,
            KernelError::Store(_) => 14,
            KernelError::Trap(_) => 15,
            KernelError::SignatureMissing(_) => 16,
            KernelError::InvalidSignature(_) => 17,
            KernelError::Quarantined(_) => 18,
            KernelError::AuditChainBroken(_) => 19,
            KernelError::Sched(_) => 20,
            KernelError::Io(_) => 21,
            KernelError::Invariant(_) => 22,
        };
        self.class().base_code() + offset
    }

    /// Whether retrying the same call may succeed. Integrity and user
    /// failures never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Logic | ErrorClass::Resource)
    }
}

/// Result type for Kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_kernel_caps::CapabilityId;
    use capsule_kernel_core::CapsuleId;
    use capsule_kernel_sched::ProcessId;

    #[test]
    fn test_classes() {
        let denied = KernelError::from(CapabilityError::Revoked(CapabilityId(3)));
        assert_eq!(denied.class(), ErrorClass::User);
        assert!(!denied.is_retryable());

        let full = KernelError::from(IpcError::MailboxFull(ProcessId(2)));
        assert_eq!(full.class(), ErrorClass::Resource);
        assert!(full.is_retryable());

        let tampered = KernelError::from(CoreError::CapsuleTampered(CapsuleId::ZERO));
        assert_eq!(tampered.class(), ErrorClass::Integrity);
        assert!(!tampered.is_retryable());

        assert_eq!(KernelError::Trap(TrapKind::Timeout).class(), ErrorClass::Resource);
        assert_eq!(KernelError::Trap(TrapKind::DivideByZero).class(), ErrorClass::Logic);
        assert_eq!(KernelError::Invariant("x".into()).class(), ErrorClass::System);
    }

    #[test]
    fn test_codes_stay_in_class_range() {
        let errors = vec![
            KernelError::UnknownOperation("x".into()),
            KernelError::Rule(RuleError::Failed("boom".into())),
            KernelError::Ipc(IpcError::MailboxFull(ProcessId(1))),
            KernelError::Quarantined("emp-1".into()),
            KernelError::Invariant("two running".into()),
            KernelError::Store(StoreError::NotFound(CapsuleId::ZERO)),
        ];
        for err in errors {
            let base = err.class().base_code();
            let code = err.code();
            assert!(code > base && code < base + 100, "{} -> {}", err, code);
        }
    }
}
