//! Error types for the message router.

use thiserror::Error;

use capsule_kernel_caps::CapabilityError;
use capsule_kernel_sched::ProcessId;

/// Errors that can occur during send and receive.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The sender's token does not grant write on the target mailbox.
    #[error("send permission denied: {0}")]
    SendPermissionDenied(#[source] CapabilityError),

    /// Target mailbox at capacity and the policy does not drop.
    #[error("mailbox full: {0}")]
    MailboxFull(ProcessId),

    #[error("no mailbox for {0}")]
    MailboxNotFound(ProcessId),

    #[error("{0} already owns a mailbox")]
    MailboxExists(ProcessId),

    #[error("mailbox name already registered: {0}")]
    NameTaken(String),

    /// Router is shutting down.
    #[error("router shutting down")]
    ShuttingDown,

    /// Payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl IpcError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, IpcError::SendPermissionDenied(_))
    }
}

/// Result type for IPC operations.
pub type Result<T> = std::result::Result<T, IpcError>;
