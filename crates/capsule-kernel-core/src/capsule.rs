//! Time capsules: immutable, supersede-chained snapshots of sealed proofs.
//!
//! A capsule's id covers everything except its forward link
//! (`superseded_by`) and `is_active`, the only two fields a repository is
//! allowed to change, and only once, when a successor is written.

use std::collections::{BTreeMap, HashMap};

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::canonical::encode_canonical;
use crate::crypto::Blake3Hash;
use crate::error::{CoreError, Result};
use crate::proof::ProofObject;
use crate::types::CapsuleId;

/// Domain prefix for capsule ids.
const CAPSULE_DOMAIN: &str = "capsule-kernel/capsule/v1";

/// Export format version.
pub const LEDGER_FORMAT_VERSION: u32 = 1;

/// A stored, sealed computation for one (subject, dimension) key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeCapsule {
    pub id: CapsuleId,
    pub subject_id: String,
    /// What was computed for the subject (e.g. `"accrual.calculate"`).
    pub dimension: String,
    /// When the system computed the value (Unix ms).
    pub calculated_at: i64,
    /// The instant the value applies to (Unix ms).
    pub effective_date: i64,
    pub ruleset_version: String,
    pub proof: ProofObject,
    pub supersedes: Option<CapsuleId>,
    pub superseded_by: Option<CapsuleId>,
    pub is_active: bool,
}

impl TimeCapsule {
    /// Create the first active capsule for a key.
    pub fn new(
        subject_id: impl Into<String>,
        dimension: impl Into<String>,
        proof: ProofObject,
        calculated_at: i64,
        effective_date: i64,
        ruleset_version: impl Into<String>,
    ) -> Result<Self> {
        Self::build(
            subject_id.into(),
            dimension.into(),
            proof,
            calculated_at,
            effective_date,
            ruleset_version.into(),
            None,
        )
    }

    /// Create the capsule that replaces `self`. `self` is left untouched;
    /// flipping its flags is the repository's job.
    pub fn successor(
        &self,
        proof: ProofObject,
        calculated_at: i64,
        effective_date: i64,
        ruleset_version: impl Into<String>,
    ) -> Result<Self> {
        Self::build(
            self.subject_id.clone(),
            self.dimension.clone(),
            proof,
            calculated_at,
            effective_date,
            ruleset_version.into(),
            Some(self.id),
        )
    }

    fn build(
        subject_id: String,
        dimension: String,
        proof: ProofObject,
        calculated_at: i64,
        effective_date: i64,
        ruleset_version: String,
        supersedes: Option<CapsuleId>,
    ) -> Result<Self> {
        let mut capsule = Self {
            id: CapsuleId::ZERO,
            subject_id,
            dimension,
            calculated_at,
            effective_date,
            ruleset_version,
            proof,
            supersedes,
            superseded_by: None,
            is_active: true,
        };
        capsule.id = capsule.compute_id()?;
        Ok(capsule)
    }

    /// Recompute the content-derived id.
    pub fn compute_id(&self) -> Result<CapsuleId> {
        let map = Value::Map(vec![
            (Value::Integer(0.into()), Value::Text(self.subject_id.clone())),
            (Value::Integer(1.into()), Value::Text(self.dimension.clone())),
            (Value::Integer(2.into()), Value::Integer(self.calculated_at.into())),
            (Value::Integer(3.into()), Value::Integer(self.effective_date.into())),
            (Value::Integer(4.into()), Value::Text(self.ruleset_version.clone())),
            (
                Value::Integer(5.into()),
                Value::Bytes(self.proof.seal().digest.0.to_vec()),
            ),
            (
                Value::Integer(6.into()),
                self.supersedes
                    .map_or(Value::Null, |id| Value::Bytes(id.0.to_vec())),
            ),
        ]);
        let bytes = encode_canonical(&map)?;
        Ok(CapsuleId(Blake3Hash::hash_domain(CAPSULE_DOMAIN, &bytes).0))
    }

    /// Check the id and the embedded proof's seal.
    pub fn verify(&self) -> Result<()> {
        if self.compute_id()? != self.id {
            return Err(CoreError::CapsuleTampered(self.id));
        }
        self.proof.verify_detailed()
    }

    /// Was the capsule already calculated at instant `t`?
    pub fn existed_at(&self, t: i64) -> bool {
        self.calculated_at <= t
    }
}

/// Pick the capsule that was active at instant `t` from a chronological
/// timeline: the last one calculated at or before `t`.
pub fn select_as_of(timeline: &[TimeCapsule], t: i64) -> Option<&TimeCapsule> {
    timeline.iter().rev().find(|c| c.existed_at(t))
}

/// Serialized ledger handed to auditors and regulators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerExport {
    pub format_version: u32,
    pub subject_id: String,
    pub exported_at: i64,
    /// Every capsule for the subject, grouped by dimension, oldest first.
    pub capsules: Vec<TimeCapsule>,
}

/// Outcome of re-verifying an export.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerVerification {
    pub total: usize,
    pub verified: usize,
    /// Capsules whose id or seal did not verify.
    pub tampered: Vec<CapsuleId>,
    /// Capsules whose supersede links do not line up.
    pub chain_breaks: Vec<CapsuleId>,
    /// Dimensions that do not have exactly one active capsule.
    pub active_violations: Vec<String>,
}

impl LedgerVerification {
    pub fn is_valid(&self) -> bool {
        self.tampered.is_empty() && self.chain_breaks.is_empty() && self.active_violations.is_empty()
    }
}

impl LedgerExport {
    pub fn new(subject_id: impl Into<String>, exported_at: i64, capsules: Vec<TimeCapsule>) -> Self {
        Self {
            format_version: LEDGER_FORMAT_VERSION,
            subject_id: subject_id.into(),
            exported_at,
            capsules,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Independently re-verify every capsule, its links, and the
    /// single-active rule per dimension.
    pub fn verify_all(&self) -> LedgerVerification {
        let mut report = LedgerVerification {
            total: self.capsules.len(),
            ..Default::default()
        };

        let by_id: HashMap<CapsuleId, &TimeCapsule> =
            self.capsules.iter().map(|c| (c.id, c)).collect();
        let mut active: BTreeMap<&str, usize> = BTreeMap::new();

        for capsule in &self.capsules {
            active.entry(capsule.dimension.as_str()).or_insert(0);
            if capsule.is_active {
                *active.entry(capsule.dimension.as_str()).or_insert(0) += 1;
            }

            if capsule.verify().is_ok() {
                report.verified += 1;
            } else {
                report.tampered.push(capsule.id);
            }

            let back_ok = match capsule.supersedes {
                Some(prev) => by_id
                    .get(&prev)
                    .map_or(false, |p| p.superseded_by == Some(capsule.id) && !p.is_active),
                None => true,
            };
            let forward_ok = match capsule.superseded_by {
                Some(next) => by_id
                    .get(&next)
                    .map_or(false, |n| n.supersedes == Some(capsule.id)) && !capsule.is_active,
                None => true,
            };
            if !back_ok || !forward_ok {
                report.chain_breaks.push(capsule.id);
            }
        }

        report.active_violations = active
            .into_iter()
            .filter(|(_, n)| *n != 1)
            .map(|(d, _)| d.to_string())
            .collect();
        report
    }
}
