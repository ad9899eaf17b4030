//! CapsuleStore trait: the abstract interface for capsule persistence.
//!
//! Implementations include SQLite (primary) and in-memory (for tests).

use async_trait::async_trait;

use capsule_kernel_core::{select_as_of, CapsuleId, LedgerExport, ProofObject, TimeCapsule};

use crate::error::Result;

/// Async interface over the append-only capsule ledger.
///
/// # Invariants
///
/// - At most one active capsule per `(subject_id, dimension)`.
/// - Capsules are never deleted. The only mutation is `supersede`, which
///   flips the old capsule's `is_active` and `superseded_by` in the same
///   transaction that inserts its successor.
/// - Timelines come back in insertion order, oldest first.
#[async_trait]
pub trait CapsuleStore: Send + Sync {
    /// Store a new capsule.
    ///
    /// Fails with `Conflict` if the capsule is active and its key already
    /// has an active capsule, and with `Integrity` if it does not verify.
    async fn store(&self, capsule: &TimeCapsule) -> Result<()>;

    /// Get a capsule by id.
    async fn retrieve(&self, id: &CapsuleId) -> Result<Option<TimeCapsule>>;

    /// The active capsule for a key, if any.
    async fn active(&self, subject_id: &str, dimension: &str) -> Result<Option<TimeCapsule>>;

    /// Replace the active capsule `old` with a new one built from `proof`.
    ///
    /// The successor's `calculated_at` is the proof's timestamp.
    async fn supersede(
        &self,
        old: &CapsuleId,
        proof: ProofObject,
        effective_date: i64,
        ruleset_version: &str,
    ) -> Result<TimeCapsule>;

    /// Every capsule for a key, oldest first.
    async fn timeline(&self, subject_id: &str, dimension: &str) -> Result<Vec<TimeCapsule>>;

    /// Every capsule for a subject across all dimensions, grouped by
    /// dimension, each group oldest first.
    async fn subject_capsules(&self, subject_id: &str) -> Result<Vec<TimeCapsule>>;

    /// Total number of stored capsules.
    async fn count(&self) -> Result<usize>;

    /// The capsule that was current for a key at instant `t`.
    async fn as_of(&self, subject_id: &str, dimension: &str, t: i64) -> Result<Option<TimeCapsule>> {
        let timeline = self.timeline(subject_id, dimension).await?;
        Ok(select_as_of(&timeline, t).cloned())
    }

    /// Export a subject's full ledger for independent verification.
    async fn export_timeline(&self, subject_id: &str, exported_at: i64) -> Result<LedgerExport> {
        let capsules = self.subject_capsules(subject_id).await?;
        Ok(LedgerExport::new(subject_id, exported_at, capsules))
    }
}
