//! # Capsule Kernel
//!
//! A capability-secured, message-passing kernel for rule modules whose
//! every calculation is sealed into a verifiable proof and recorded in a
//! supersede-chained ledger of time capsules.
//!
//! ## Overview
//!
//! - **Capabilities**: every mailbox, storage key, clock read and network
//!   fetch is guarded by an unforgeable, attenuable token
//! - **Scheduling**: priority scheduling with aging; faults become exit
//!   notices for the supervisor
//! - **IPC**: bounded mailboxes, per-channel FIFO, capability-checked sends
//! - **Modules**: manifest-declared capability grants, optional Ed25519
//!   signatures, hot swap without privilege escalation
//! - **Proofs**: Blake3 seals over canonical CBOR, checked for drift before
//!   being recorded as [`TimeCapsule`]s
//!
//! ## Key Concepts
//!
//! - **Proof**: immutable. A changed result is a new proof.
//! - **Capsule**: one per `(subject, dimension)` is active. Newer results
//!   supersede older ones; history is never rewritten.
//! - **Drift**: history that no longer agrees with itself. Legal drift
//!   quarantines the subject until an operator releases it.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use capsule_kernel::{Kernel, KernelConfig, RegisteredRule};
//! use serde_json::json;
//!
//! async fn example() {
//!     let kernel = Kernel::new(KernelConfig::default()).unwrap();
//!
//!     kernel.register_rule(RegisteredRule::new("bonus.compute", |inputs, trace| {
//!         let sales = inputs["sales"].as_f64().unwrap_or_default();
//!         trace.rule_step("bonus.rate", "ten percent of sales", None);
//!         Ok(json!({ "bonus": sales * 0.1 }))
//!     }));
//!
//!     let inv = kernel
//!         .invoke_with_proof("bonus.compute", &json!({ "sales": 1200.0 }), Some("rep-42"))
//!         .await
//!         .unwrap();
//!     assert!(inv.proof.verify());
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `capsule_kernel::core` - proofs, seals, capsules, clocks
//! - `capsule_kernel::caps` - capability engine
//! - `capsule_kernel::sched` - scheduler
//! - `capsule_kernel::ipc` - mailboxes and routing
//! - `capsule_kernel::store` - capsule ledger backends

pub mod audit;
pub mod behavior;
pub mod bridge;
pub mod config;
pub mod drift;
pub mod error;
pub mod kernel;
pub mod loader;
pub mod manifest;
pub mod rules;
pub mod supervisor;
pub mod syscall;

pub use capsule_kernel_caps as caps;
pub use capsule_kernel_core as core;
pub use capsule_kernel_ipc as ipc;
pub use capsule_kernel_sched as sched;
pub use capsule_kernel_store as store;

pub use audit::{AuditConfig, AuditEntry, AuditEvent, AuditLog};
pub use behavior::{ModuleBehavior, RULE_ERROR, RULE_RESULT};
pub use bridge::{Bridge, Invocation, InvocationContext, InvocationStatus};
pub use config::{IpcConfig, KernelConfig};
pub use drift::{DriftCategory, DriftConfig, DriftEngine, DriftEvent, DriftSeverity};
pub use error::{ErrorClass, KernelError, Result};
pub use kernel::{Kernel, KernelBuilder, StepOutcome};
pub use loader::{GrantPolicy, LoadResult, LoadedModule, LoaderConfig, ModuleLoader};
pub use manifest::{CapabilityRequest, ModuleManifest, ModuleType, ResourceLimits};
pub use rules::{RegisteredRule, RuleError, RuleRegistry};
pub use supervisor::{ChildSpec, EscalationLevel, RestartStrategy, Supervisor, SupervisorAction};
pub use syscall::{DenyNetwork, NetworkFetcher, Syscall, SyscallHost, SyscallKind, Syscalls};

pub use capsule_kernel_core::{
    Clock, LedgerExport, ManualClock, ProofBuilder, ProofId, ProofObject, SharedClock, TimeCapsule,
};
