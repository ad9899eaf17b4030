//! Bounded per-process mailboxes.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use capsule_kernel_sched::ProcessId;

use crate::message::Message;

/// What happens when a message arrives at a full mailbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming message.
    DropNewest,
    /// Evict the oldest queued message.
    DropOldest,
    /// Make the sender wait for room, up to the router's block timeout.
    #[default]
    BlockSender,
    /// Fail the send and tell the sender through its own mailbox.
    NotifySender,
}

/// Counters for one mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxStats {
    pub name: String,
    pub depth: usize,
    pub capacity: usize,
    pub policy: OverflowPolicy,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Debug)]
pub(crate) struct Mailbox {
    pub(crate) owner: ProcessId,
    pub(crate) name: String,
    pub(crate) capacity: usize,
    pub(crate) policy: OverflowPolicy,
    queue: VecDeque<Message>,
    pub(crate) delivered: u64,
    pub(crate) dropped: u64,
    /// Signalled when a message is queued.
    pub(crate) readable: Arc<Notify>,
    /// Signalled when a message is taken.
    pub(crate) writable: Arc<Notify>,
}

impl Mailbox {
    pub(crate) fn new(owner: ProcessId, name: String, capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            owner,
            name,
            capacity: capacity.max(1),
            policy,
            queue: VecDeque::new(),
            delivered: 0,
            dropped: 0,
            readable: Arc::new(Notify::new()),
            writable: Arc::new(Notify::new()),
        }
    }

    pub(crate) fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn push(&mut self, msg: Message) {
        self.queue.push_back(msg);
        self.delivered += 1;
        self.readable.notify_one();
    }

    pub(crate) fn evict_oldest(&mut self) -> Option<Message> {
        let evicted = self.queue.pop_front();
        if evicted.is_some() {
            self.dropped += 1;
        }
        evicted
    }

    /// Take the earliest message, or the earliest of type `filter`.
    pub(crate) fn take(&mut self, filter: Option<&str>) -> Option<Message> {
        let idx = match filter {
            None => 0,
            Some(ty) => self.queue.iter().position(|m| m.msg_type == ty)?,
        };
        let msg = self.queue.remove(idx)?;
        self.writable.notify_one();
        Some(msg)
    }

    /// Hand the mailbox and its queued messages to a new owner.
    pub(crate) fn retarget(&mut self, owner: ProcessId) {
        self.owner = owner;
        for msg in &mut self.queue {
            msg.header.target = owner;
        }
    }

    pub(crate) fn drain(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }

    /// Wake everyone blocked on this mailbox.
    pub(crate) fn wake_all(&self) {
        self.readable.notify_waiters();
        self.readable.notify_one();
        self.writable.notify_waiters();
        self.writable.notify_one();
    }

    pub(crate) fn stats(&self) -> MailboxStats {
        MailboxStats {
            name: self.name.clone(),
            depth: self.queue.len(),
            capacity: self.capacity,
            policy: self.policy,
            delivered: self.delivered,
            dropped: self.dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ty: &str, n: u8) -> Message {
        Message::new(ProcessId(1), ProcessId(2), ty, vec![n])
    }

    #[test]
    fn test_fifo_and_filter() {
        let mut mb = Mailbox::new(ProcessId(2), "m".into(), 8, OverflowPolicy::DropNewest);
        mb.push(msg("a", 1));
        mb.push(msg("b", 2));
        mb.push(msg("b", 3));
        assert_eq!(mb.take(Some("b")).unwrap().payload[0], 2);
        assert_eq!(mb.take(None).unwrap().payload[0], 1);
        assert!(mb.take(Some("a")).is_none());
        assert_eq!(mb.len(), 1);
    }

    #[test]
    fn test_capacity_floor() {
        let mb = Mailbox::new(ProcessId(2), "m".into(), 0, OverflowPolicy::DropNewest);
        assert_eq!(mb.capacity, 1);
        assert!(!mb.is_full());
    }
}
