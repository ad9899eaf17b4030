//! # Capsule Kernel IPC
//!
//! Capability-checked message passing between kernel processes.
//!
//! Every process owns one bounded [`mailbox`](crate::mailbox) registered
//! under a name. Sending requires a token granting `write` on
//! `(Mailbox, name)`. The router stamps each message with the next
//! sequence number of its `(source, target)` channel, so delivery is FIFO
//! per channel. No ordering holds across channels.

pub mod error;
pub mod mailbox;
pub mod message;
pub mod router;

pub use error::{IpcError, Result};
pub use mailbox::{MailboxStats, OverflowPolicy};
pub use message::{Message, MessageFlags, MessageHeader, KERNEL_PID, MAILBOX_FULL_NOTICE};
pub use router::{Delivery, ReceiveResult, Router, SendReceipt, WakeHook};
