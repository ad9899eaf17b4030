//! # Capsule Kernel Core
//!
//! Pure primitives for the Capsule Kernel: proof objects, seals, time
//! capsules, and canonicalization.
//!
//! This crate contains no I/O, no storage, no scheduling. It is pure
//! computation over sealed data structures.
//!
//! ## Key Types
//!
//! - [`ProofObject`] - A sealed record of one rule invocation
//! - [`ProofBuilder`] - Fluent construction and sealing of proofs
//! - [`TimeCapsule`] - A supersede-chained snapshot of a proof
//! - [`LedgerExport`] - Regulator-facing export with independent re-verification
//! - [`Frozen`] - Immutable snapshot of structured inputs/outputs
//! - [`Clock`] - Injectable time source
//!
//! ## Canonicalization
//!
//! Seals are Blake3 digests over deterministic CBOR. See the [`canonical`] module.

pub mod canonical;
pub mod capsule;
pub mod clock;
pub mod crypto;
pub mod error;
pub mod proof;
pub mod summary;
pub mod trace;
pub mod types;
pub mod value;

pub use canonical::{canonical_json_bytes, encode_canonical, json_to_cbor};
pub use capsule::{select_as_of, LedgerExport, LedgerVerification, TimeCapsule};
pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use crypto::{random_secret, Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use error::{CoreError, Result};
pub use proof::{seal, verify, AppliedRule, ProofBuilder, ProofObject, Seal, SealAlgorithm};
pub use summary::{HumanReadableSummary, CAP_REACHED_WARNING};
pub use trace::{ExecutionTrace, TraceRecorder, TraceStep};
pub use types::{CapsuleId, ProofId};
pub use value::Frozen;
