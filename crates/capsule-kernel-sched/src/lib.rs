//! # Capsule Kernel Scheduler
//!
//! Priority scheduling with aging for kernel modules. The scheduler owns
//! every [`ProcessDescriptor`]; all state changes go through its
//! operations, and time advances only through [`Scheduler::tick`].
//!
//! Faults do not restart anything here. A trapped or killed process
//! completes and leaves an [`ExitNotice`] for the supervisor.

pub mod error;
pub mod priority;
pub mod process;
pub mod scheduler;
pub mod trap;

pub use error::{Result, SchedError};
pub use priority::Priority;
pub use process::{ProcessDescriptor, ProcessId, ProcessState, SpawnOptions};
pub use scheduler::{FairnessReport, ProcessShare, Scheduler, SchedulerConfig};
pub use trap::{ExitNotice, ExitReason, TrapKind};
