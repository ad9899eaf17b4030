//! Process identifiers and descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::priority::Priority;
use crate::trap::ExitReason;

/// Process identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid:{}", self.0)
    }
}

/// Process state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawned, not yet schedulable.
    Created,
    Ready,
    Running,
    /// Blocked on a mailbox receive.
    Waiting,
    /// Blocked on I/O.
    Blocked,
    Completed,
}

impl ProcessState {
    pub fn is_terminal(&self) -> bool {
        *self == ProcessState::Completed
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Parameters for [`Scheduler::spawn`](crate::Scheduler::spawn).
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub name: String,
    pub priority: Priority,
    pub mailbox_capacity: usize,
    pub parent: Option<ProcessId>,
    pub execution_budget_ms: Option<u64>,
}

impl SpawnOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: Priority::Normal,
            mailbox_capacity: 64,
            parent: None,
            execution_budget_ms: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    pub fn parent(mut self, parent: ProcessId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn budget_ms(mut self, budget: u64) -> Self {
        self.execution_budget_ms = Some(budget);
        self
    }
}

/// Process descriptor, owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDescriptor {
    pub id: ProcessId,
    pub name: String,
    pub state: ProcessState,
    pub base_priority: Priority,
    pub mailbox_capacity: usize,
    /// Total CPU time charged.
    pub cpu_time_ms: u64,
    /// Time spent Ready since the last dispatch. Drives aging.
    pub wait_time_ms: u64,
    /// Time spent Ready over the whole lifetime.
    pub total_wait_ms: u64,
    pub parent_id: Option<ProcessId>,
    pub exit_reason: Option<ExitReason>,
    /// CPU time used in the current slice.
    pub slice_used_ms: u64,
    pub execution_budget_ms: Option<u64>,
    pub dispatch_count: u64,
}

impl ProcessDescriptor {
    pub(crate) fn new(id: ProcessId, opts: SpawnOptions) -> Self {
        Self {
            id,
            name: opts.name,
            state: ProcessState::Created,
            base_priority: opts.priority,
            mailbox_capacity: opts.mailbox_capacity,
            cpu_time_ms: 0,
            wait_time_ms: 0,
            total_wait_ms: 0,
            parent_id: opts.parent,
            exit_reason: None,
            slice_used_ms: 0,
            execution_budget_ms: opts.execution_budget_ms,
            dispatch_count: 0,
        }
    }

    /// Has the current slice run out?
    pub fn slice_exhausted(&self) -> bool {
        let slice = self.base_priority.base_slice_ms();
        slice > 0 && self.slice_used_ms >= slice
    }

    pub fn budget_exceeded(&self) -> bool {
        self.execution_budget_ms
            .map_or(false, |budget| self.cpu_time_ms >= budget)
    }
}
