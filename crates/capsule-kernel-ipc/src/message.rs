//! Message types.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use capsule_kernel_sched::ProcessId;

use crate::error::Result;

/// Type of the notice the router sends back when a `NotifySender` mailbox
/// rejects a message.
pub const MAILBOX_FULL_NOTICE: &str = "kernel.mailbox_full";

/// Source id used for messages that originate in the kernel itself.
pub const KERNEL_PID: ProcessId = ProcessId(0);

/// Header bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags(pub u32);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);
    /// The sender expects a reply.
    pub const REPLY_EXPECTED: MessageFlags = MessageFlags(1);
    /// Generated by the kernel, not by a module.
    pub const KERNEL_NOTICE: MessageFlags = MessageFlags(1 << 1);

    pub fn contains(&self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | other.0)
    }
}

/// Message header. `sequence` and `timestamp` are stamped by the router;
/// whatever the sender puts there is overwritten.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub source: ProcessId,
    pub target: ProcessId,
    pub sequence: u64,
    pub timestamp: i64,
    pub priority_hint: u8,
    pub flags: MessageFlags,
}

/// A routed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: MessageHeader,
    pub msg_type: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(
        source: ProcessId,
        target: ProcessId,
        msg_type: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            header: MessageHeader {
                source,
                target,
                sequence: 0,
                timestamp: 0,
                priority_hint: 0,
                flags: MessageFlags::NONE,
            },
            msg_type: msg_type.into(),
            payload: payload.into(),
        }
    }

    /// Build a message with a JSON payload.
    pub fn json<T: Serialize>(
        source: ProcessId,
        target: ProcessId,
        msg_type: impl Into<String>,
        body: &T,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(body)?;
        Ok(Self::new(source, target, msg_type, payload))
    }

    pub fn with_flags(mut self, flags: MessageFlags) -> Self {
        self.header.flags = flags;
        self
    }

    pub fn with_priority_hint(mut self, hint: u8) -> Self {
        self.header.priority_hint = hint;
        self
    }

    /// Decode the payload as JSON.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn is_kernel_notice(&self) -> bool {
        self.header.flags.contains(MessageFlags::KERNEL_NOTICE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_payload() {
        let msg = Message::json(ProcessId(1), ProcessId(2), "accrual.calculate", &json!({"hoursWorked": 80}))
            .unwrap();
        let body: serde_json::Value = msg.payload_json().unwrap();
        assert_eq!(body["hoursWorked"], 80);
    }

    #[test]
    fn test_flags() {
        let flags = MessageFlags::NONE.with(MessageFlags::REPLY_EXPECTED);
        assert!(flags.contains(MessageFlags::REPLY_EXPECTED));
        assert!(!flags.contains(MessageFlags::KERNEL_NOTICE));
    }
}
