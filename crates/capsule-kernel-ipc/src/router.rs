//! The message router.
//!
//! One mutex guards every mailbox, the name table and the per-channel
//! sequence counters. It is never held across an await: blocked senders and
//! receivers park on the mailbox's `Notify` and re-check under the lock
//! when woken.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use capsule_kernel_caps::{CapabilityEngine, CapabilityToken, ResourceType, Rights};
use capsule_kernel_core::SharedClock;
use capsule_kernel_sched::ProcessId;

use crate::error::{IpcError, Result};
use crate::mailbox::{Mailbox, MailboxStats, OverflowPolicy};
use crate::message::{Message, MessageFlags, KERNEL_PID, MAILBOX_FULL_NOTICE};

/// Called with the target pid after a message lands in its mailbox.
pub type WakeHook = Arc<dyn Fn(ProcessId) + Send + Sync>;

/// How a successful send was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Enqueued,
    /// Mailbox full under `DropNewest`; the message was discarded.
    DroppedNewest,
    /// Mailbox full under `DropOldest`; the head was evicted to make room.
    EvictedOldest,
}

/// Returned by [`Router::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    /// Sequence assigned on the (source, target) channel. `None` when the
    /// message was dropped before being sequenced.
    pub sequence: Option<u64>,
    pub timestamp: i64,
    pub delivery: Delivery,
}

/// Outcome of [`Router::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveResult {
    Message(Message),
    /// Non-blocking receive found nothing.
    Empty,
    Timeout,
    ShuttingDown,
}

impl ReceiveResult {
    pub fn into_message(self) -> Option<Message> {
        match self {
            ReceiveResult::Message(m) => Some(m),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RouterInner {
    mailboxes: HashMap<ProcessId, Mailbox>,
    names: HashMap<String, ProcessId>,
    sequences: HashMap<(ProcessId, ProcessId), u64>,
    shutting_down: bool,
}

impl RouterInner {
    fn stamp(&mut self, msg: &mut Message, now: i64) -> u64 {
        let seq = self
            .sequences
            .entry((msg.header.source, msg.header.target))
            .or_insert(0);
        *seq += 1;
        msg.header.sequence = *seq;
        msg.header.timestamp = now;
        *seq
    }

    /// Queue a mailbox-full notice for `sender` if it has a mailbox with room.
    fn notify_full(&mut self, sender: ProcessId, target: ProcessId, now: i64) {
        let has_room = self
            .mailboxes
            .get(&sender)
            .map_or(false, |mb| !mb.is_full());
        if !has_room {
            return;
        }
        let body = format!("{{\"target\":{}}}", target.0);
        let mut notice = Message::new(KERNEL_PID, sender, MAILBOX_FULL_NOTICE, body)
            .with_flags(MessageFlags::KERNEL_NOTICE);
        self.stamp(&mut notice, now);
        if let Some(mb) = self.mailboxes.get_mut(&sender) {
            mb.push(notice);
        }
    }
}

enum SendStep {
    Done(SendReceipt),
    Wait(Arc<tokio::sync::Notify>),
}

/// Routes messages between process mailboxes, checking a write capability
/// on the target mailbox for every send.
pub struct Router {
    caps: Arc<CapabilityEngine>,
    clock: SharedClock,
    block_send_timeout: Duration,
    inner: Mutex<RouterInner>,
    wake_hook: Mutex<Option<WakeHook>>,
}

impl Router {
    pub fn new(caps: Arc<CapabilityEngine>, clock: SharedClock, block_send_timeout: Duration) -> Self {
        Self {
            caps,
            clock,
            block_send_timeout,
            inner: Mutex::new(RouterInner::default()),
            wake_hook: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RouterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_wake_hook(&self, hook: WakeHook) {
        *self.wake_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    fn wake(&self, pid: ProcessId) {
        let hook = self
            .wake_hook
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(hook) = hook {
            hook(pid);
        }
    }

    /// Create the mailbox for `pid`, addressable as `name`.
    pub fn register_mailbox(
        &self,
        pid: ProcessId,
        name: impl Into<String>,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Result<()> {
        let name = name.into();
        let mut inner = self.lock();
        if inner.shutting_down {
            return Err(IpcError::ShuttingDown);
        }
        if inner.names.contains_key(&name) {
            return Err(IpcError::NameTaken(name));
        }
        inner.names.insert(name.clone(), pid);
        inner
            .mailboxes
            .insert(pid, Mailbox::new(pid, name.clone(), capacity, policy));
        debug!(%pid, mailbox = %name, capacity, ?policy, "mailbox registered");
        Ok(())
    }

    /// Remove `pid`'s mailbox. Returns the number of undelivered messages
    /// that were discarded.
    pub fn close_mailbox(&self, pid: ProcessId) -> Result<usize> {
        let mut inner = self.lock();
        let mut mailbox = inner
            .mailboxes
            .remove(&pid)
            .ok_or(IpcError::MailboxNotFound(pid))?;
        inner.names.remove(&mailbox.name);
        inner.sequences.retain(|(_, target), _| *target != pid);
        let discarded = mailbox.drain();
        mailbox.wake_all();
        debug!(%pid, mailbox = %mailbox.name, discarded, "mailbox closed");
        Ok(discarded)
    }

    /// Move `old`'s mailbox, queue included, to `new`. Returns the number of
    /// messages carried over.
    pub fn rebind_mailbox(&self, old: ProcessId, new: ProcessId) -> Result<usize> {
        let mut inner = self.lock();
        if inner.mailboxes.contains_key(&new) {
            return Err(IpcError::MailboxExists(new));
        }
        let mut mailbox = inner
            .mailboxes
            .remove(&old)
            .ok_or(IpcError::MailboxNotFound(old))?;
        mailbox.retarget(new);
        let carried = mailbox.len();
        let name = mailbox.name.clone();
        inner.names.insert(name.clone(), new);
        inner.mailboxes.insert(new, mailbox);
        let sequences = std::mem::take(&mut inner.sequences);
        inner.sequences = sequences
            .into_iter()
            .map(|((source, target), seq)| {
                let source = if source == old { new } else { source };
                let target = if target == old { new } else { target };
                ((source, target), seq)
            })
            .collect();
        debug!(%old, %new, mailbox = %name, carried, "mailbox rebound");
        Ok(carried)
    }

    /// Discard every message queued for `pid`, keeping the mailbox.
    pub fn clear_mailbox(&self, pid: ProcessId) -> Result<usize> {
        let mut inner = self.lock();
        let mailbox = inner
            .mailboxes
            .get_mut(&pid)
            .ok_or(IpcError::MailboxNotFound(pid))?;
        let discarded = mailbox.drain();
        mailbox.writable.notify_waiters();
        debug!(%pid, mailbox = %mailbox.name, discarded, "mailbox cleared");
        Ok(discarded)
    }

    /// Look up a mailbox owner by name.
    pub fn resolve(&self, name: &str) -> Option<ProcessId> {
        self.lock().names.get(name).copied()
    }

    pub fn mailbox_stats(&self, pid: ProcessId) -> Option<MailboxStats> {
        self.lock().mailboxes.get(&pid).map(|mb| mb.stats())
    }

    /// Stop accepting traffic and wake every blocked caller.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        inner.shutting_down = true;
        for mb in inner.mailboxes.values() {
            mb.wake_all();
        }
        info!(mailboxes = inner.mailboxes.len(), "router shutting down");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Send `msg` to `msg.header.target`.
    ///
    /// `token` must grant write on the target mailbox. The router assigns
    /// the sequence and timestamp, then applies the target's overflow policy
    /// when the mailbox is full.
    pub async fn send(&self, token: &CapabilityToken, mut msg: Message) -> Result<SendReceipt> {
        let target = msg.header.target;
        let name = {
            let inner = self.lock();
            if inner.shutting_down {
                return Err(IpcError::ShuttingDown);
            }
            inner
                .mailboxes
                .get(&target)
                .map(|mb| mb.name.clone())
                .ok_or(IpcError::MailboxNotFound(target))?
        };

        if let Err(err) = self
            .caps
            .check(token, &ResourceType::Mailbox, &name, Rights::write_only())
        {
            warn!(
                source = %msg.header.source,
                %target,
                mailbox = %name,
                reason = err.reason_code(),
                "send denied"
            );
            return Err(IpcError::SendPermissionDenied(err));
        }

        let deadline = Instant::now() + self.block_send_timeout;
        loop {
            let step = {
                let mut inner = self.lock();
                self.try_deliver(&mut inner, &mut msg)?
            };
            match step {
                SendStep::Done(receipt) => {
                    if receipt.delivery != Delivery::DroppedNewest {
                        self.wake(target);
                    }
                    return Ok(receipt);
                }
                SendStep::Wait(writable) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero()
                        || tokio::time::timeout(remaining, writable.notified())
                            .await
                            .is_err()
                    {
                        debug!(%target, "blocked send timed out");
                        return Err(IpcError::MailboxFull(target));
                    }
                }
            }
        }
    }

    fn try_deliver(&self, inner: &mut RouterInner, msg: &mut Message) -> Result<SendStep> {
        if inner.shutting_down {
            return Err(IpcError::ShuttingDown);
        }
        let now = self.clock.now_millis();
        let source = msg.header.source;
        let target = msg.header.target;

        let (full, policy) = inner
            .mailboxes
            .get(&target)
            .map(|mb| (mb.is_full(), mb.policy))
            .ok_or(IpcError::MailboxNotFound(target))?;

        let mut delivery = Delivery::Enqueued;
        if full {
            match policy {
                OverflowPolicy::DropNewest => {
                    if let Some(mb) = inner.mailboxes.get_mut(&target) {
                        mb.dropped += 1;
                    }
                    debug!(%source, %target, "mailbox full, dropped newest");
                    return Ok(SendStep::Done(SendReceipt {
                        sequence: None,
                        timestamp: now,
                        delivery: Delivery::DroppedNewest,
                    }));
                }
                OverflowPolicy::DropOldest => {
                    if let Some(mb) = inner.mailboxes.get_mut(&target) {
                        mb.evict_oldest();
                    }
                    delivery = Delivery::EvictedOldest;
                }
                OverflowPolicy::BlockSender => {
                    let writable = inner
                        .mailboxes
                        .get(&target)
                        .map(|mb| mb.writable.clone())
                        .ok_or(IpcError::MailboxNotFound(target))?;
                    return Ok(SendStep::Wait(writable));
                }
                OverflowPolicy::NotifySender => {
                    inner.notify_full(source, target, now);
                    warn!(%source, %target, "mailbox full, sender notified");
                    return Err(IpcError::MailboxFull(target));
                }
            }
        }

        let sequence = inner.stamp(msg, now);
        if let Some(mb) = inner.mailboxes.get_mut(&target) {
            mb.push(msg.clone());
        }
        debug!(%source, %target, sequence, msg_type = %msg.msg_type, "message delivered");
        Ok(SendStep::Done(SendReceipt {
            sequence: Some(sequence),
            timestamp: now,
            delivery,
        }))
    }

    /// Deliver a kernel-originated message without a capability check.
    /// Never blocks; a full mailbox fails with `MailboxFull`.
    pub fn post(&self, mut msg: Message) -> Result<SendReceipt> {
        msg.header.source = KERNEL_PID;
        msg.header.flags = msg.header.flags.with(MessageFlags::KERNEL_NOTICE);
        let target = msg.header.target;
        let receipt = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return Err(IpcError::ShuttingDown);
            }
            let now = self.clock.now_millis();
            let mb = inner
                .mailboxes
                .get(&target)
                .ok_or(IpcError::MailboxNotFound(target))?;
            if mb.is_full() {
                return Err(IpcError::MailboxFull(target));
            }
            let sequence = inner.stamp(&mut msg, now);
            if let Some(mb) = inner.mailboxes.get_mut(&target) {
                mb.push(msg);
            }
            SendReceipt {
                sequence: Some(sequence),
                timestamp: now,
                delivery: Delivery::Enqueued,
            }
        };
        self.wake(target);
        Ok(receipt)
    }

    /// Take the next message for `pid`, waiting up to `timeout_ms`.
    ///
    /// With a filter, the earliest message of that type is taken and other
    /// messages keep their place. `timeout_ms == 0` never waits.
    pub async fn receive(
        &self,
        pid: ProcessId,
        timeout_ms: u64,
        filter: Option<&str>,
    ) -> Result<ReceiveResult> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let readable = {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return Ok(ReceiveResult::ShuttingDown);
                }
                let mb = inner
                    .mailboxes
                    .get_mut(&pid)
                    .ok_or(IpcError::MailboxNotFound(pid))?;
                if let Some(msg) = mb.take(filter) {
                    return Ok(ReceiveResult::Message(msg));
                }
                if timeout_ms == 0 {
                    return Ok(ReceiveResult::Empty);
                }
                mb.readable.clone()
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero()
                || tokio::time::timeout(remaining, readable.notified())
                    .await
                    .is_err()
            {
                return Ok(ReceiveResult::Timeout);
            }
        }
    }

    /// Number of queued messages for `pid`.
    pub fn pending(&self, pid: ProcessId) -> usize {
        self.lock().mailboxes.get(&pid).map_or(0, |mb| mb.len())
    }

    /// Owner of the mailbox registered as `name`, with its capacity.
    pub fn owner_of(&self, name: &str) -> Option<(ProcessId, usize)> {
        let inner = self.lock();
        let pid = inner.names.get(name)?;
        inner.mailboxes.get(pid).map(|mb| (mb.owner, mb.capacity))
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Router")
            .field("mailboxes", &inner.mailboxes.len())
            .field("shutting_down", &inner.shutting_down)
            .finish_non_exhaustive()
    }
}
