//! Traps and exit reasons.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::process::ProcessId;

/// A fault raised while a module was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrapKind {
    /// Execution budget exhausted.
    Timeout,
    OutOfMemory,
    Unreachable,
    DivideByZero,
    Overflow,
    OutOfBounds,
    StackOverflow,
}

impl TrapKind {
    /// Resource traps may succeed on a plain restart. Logic traps will not.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TrapKind::Timeout | TrapKind::OutOfMemory)
    }
}

impl fmt::Display for TrapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TrapKind::Timeout => "timeout",
            TrapKind::OutOfMemory => "out_of_memory",
            TrapKind::Unreachable => "unreachable",
            TrapKind::DivideByZero => "divide_by_zero",
            TrapKind::Overflow => "overflow",
            TrapKind::OutOfBounds => "out_of_bounds",
            TrapKind::StackOverflow => "stack_overflow",
        };
        f.write_str(s)
    }
}

/// Why a process reached Completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "trap", rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    Crashed(TrapKind),
    Killed,
}

impl ExitReason {
    pub fn is_normal(&self) -> bool {
        matches!(self, ExitReason::Normal)
    }

    pub fn trap(&self) -> Option<TrapKind> {
        match self {
            ExitReason::Crashed(kind) => Some(*kind),
            _ => None,
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Normal => f.write_str("normal"),
            ExitReason::Crashed(kind) => write!(f, "crashed({})", kind),
            ExitReason::Killed => f.write_str("killed"),
        }
    }
}

/// Queued for the supervisor whenever a process completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitNotice {
    pub pid: ProcessId,
    pub name: String,
    pub reason: ExitReason,
    /// Scheduler time of the exit (Unix ms).
    pub at: i64,
    pub cpu_time_ms: u64,
}
