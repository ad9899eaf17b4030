//! Proof objects: sealed records of a single rule invocation.
//!
//! A proof captures what was asked (`operation`, `inputs`), what came back
//! (`outputs`), how (`trace`, `applied_rules`) and why (`statute_refs`), then
//! seals all of it with a Blake3 digest over the canonical CBOR encoding.
//! Fields are private; the only way to obtain a `ProofObject` is to seal one
//! or to deserialize one, and [`ProofObject::verify`] catches any edit made
//! to a serialized copy.

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::canonical::{encode_canonical, json_to_cbor};
use crate::clock::{Clock, SystemClock};
use crate::crypto::Blake3Hash;
use crate::error::{CoreError, Result};
use crate::summary::HumanReadableSummary;
use crate::trace::ExecutionTrace;
use crate::types::ProofId;
use crate::value::Frozen;

/// Current proof schema version, bound into every seal.
pub const PROOF_VERSION: u8 = 1;

/// Domain prefix for seal digests.
const SEAL_DOMAIN: &str = "capsule-kernel/proof/v1";

/// Field keys of the sealed map (integer keys for compact encoding).
mod keys {
    pub const VERSION: u64 = 0;
    pub const OPERATION: u64 = 1;
    pub const TIMESTAMP: u64 = 2;
    pub const INPUTS: u64 = 3;
    pub const OUTPUTS: u64 = 4;
    pub const APPLIED_RULES: u64 = 5;
    pub const STATUTE_REFS: u64 = 6;
    pub const TRACE: u64 = 7;
    pub const CONFIDENCE: u64 = 8;
}

/// Digest function used for a seal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SealAlgorithm {
    #[serde(rename = "blake3-256")]
    Blake3_256,
}

impl SealAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SealAlgorithm::Blake3_256 => "blake3-256",
        }
    }
}

/// The tamper-evidence seal of a proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    pub algorithm: SealAlgorithm,
    pub digest: Blake3Hash,
}

/// A rule that contributed to an output.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AppliedRule {
    pub rule_id: String,
    pub description: String,
}

impl AppliedRule {
    pub fn new(rule_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            rule_id: rule_id.into(),
            description: description.into(),
        }
    }
}

/// A sealed, immutable record of one rule invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofObject {
    proof_id: ProofId,
    timestamp: i64,
    operation: String,
    inputs: Frozen,
    outputs: Frozen,
    applied_rules: Vec<AppliedRule>,
    statute_refs: Vec<String>,
    trace: ExecutionTrace,
    confidence: f64,
    seal: Seal,
    summary: HumanReadableSummary,
}

impl ProofObject {
    pub fn proof_id(&self) -> ProofId {
        self.proof_id
    }

    /// When the proof was sealed (Unix ms).
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn inputs(&self) -> &Frozen {
        &self.inputs
    }

    pub fn outputs(&self) -> &Frozen {
        &self.outputs
    }

    pub fn applied_rules(&self) -> &[AppliedRule] {
        &self.applied_rules
    }

    pub fn statute_refs(&self) -> &[String] {
        &self.statute_refs
    }

    pub fn trace(&self) -> &ExecutionTrace {
        &self.trace
    }

    /// System confidence in the result, within `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn seal(&self) -> &Seal {
        &self.seal
    }

    pub fn summary(&self) -> &HumanReadableSummary {
        &self.summary
    }

    /// Recompute the seal and summary and compare them with the stored ones.
    pub fn verify(&self) -> bool {
        self.verify_detailed().is_ok()
    }

    /// Like [`verify`](Self::verify) but reports what did not match.
    pub fn verify_detailed(&self) -> Result<()> {
        let digest = compute_digest(
            &self.operation,
            self.timestamp,
            &self.inputs,
            &self.outputs,
            &self.applied_rules,
            &self.statute_refs,
            &self.trace,
            self.confidence,
        )?;

        if self.seal.algorithm != SealAlgorithm::Blake3_256 || !digest.ct_eq(&self.seal.digest) {
            return Err(CoreError::SealMismatch {
                proof_id: self.proof_id,
                expected: self.seal.digest.to_hex(),
                actual: digest.to_hex(),
            });
        }
        if self.proof_id != ProofId(digest.0) {
            return Err(CoreError::SealMismatch {
                proof_id: self.proof_id,
                expected: ProofId(digest.0).to_hex(),
                actual: self.proof_id.to_hex(),
            });
        }

        let summary = HumanReadableSummary::generate(
            &self.operation,
            &self.outputs,
            &self.applied_rules,
            &self.statute_refs,
        );
        if summary != self.summary {
            return Err(CoreError::SealMismatch {
                proof_id: self.proof_id,
                expected: "regenerated summary".into(),
                actual: "stored summary differs".into(),
            });
        }
        Ok(())
    }

    /// True if the outputs report `capped: true`.
    pub fn is_capped(&self) -> bool {
        self.outputs.flag("capped")
    }
}

/// Builder for sealing proofs.
///
/// ```
/// use capsule_kernel_core::{ProofBuilder, ExecutionTrace};
/// use serde_json::json;
///
/// let proof = ProofBuilder::new("accrual.calculate")
///     .inputs(&json!({"hoursWorked": 30}))
///     .outputs(&json!({"accrued": 1}))
///     .trace(ExecutionTrace::empty())
///     .timestamp(1_736_870_400_000)
///     .seal()
///     .unwrap();
/// assert!(proof.verify());
/// ```
#[derive(Debug, Clone)]
pub struct ProofBuilder {
    operation: String,
    timestamp: Option<i64>,
    inputs: Frozen,
    outputs: Frozen,
    applied_rules: Vec<AppliedRule>,
    statute_refs: Vec<String>,
    trace: ExecutionTrace,
    confidence: f64,
}

impl ProofBuilder {
    /// Start a proof for `operation`.
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            timestamp: None,
            inputs: Frozen::default(),
            outputs: Frozen::default(),
            applied_rules: Vec::new(),
            statute_refs: Vec::new(),
            trace: ExecutionTrace::empty(),
            confidence: 1.0,
        }
    }

    /// Capture a private copy of the inputs.
    pub fn inputs(mut self, inputs: &serde_json::Value) -> Self {
        self.inputs = Frozen::new(inputs);
        self
    }

    /// Capture a private copy of the outputs.
    pub fn outputs(mut self, outputs: &serde_json::Value) -> Self {
        self.outputs = Frozen::new(outputs);
        self
    }

    pub fn trace(mut self, trace: ExecutionTrace) -> Self {
        self.trace = trace;
        self
    }

    pub fn applied_rule(mut self, rule: AppliedRule) -> Self {
        self.applied_rules.push(rule);
        self
    }

    pub fn statute_ref(mut self, reference: impl Into<String>) -> Self {
        self.statute_refs.push(reference.into());
        self
    }

    pub fn statute_refs<I, S>(mut self, refs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.statute_refs.extend(refs.into_iter().map(Into::into));
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Seal time in Unix ms. Defaults to the system clock.
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Compute the seal and produce the immutable proof.
    ///
    /// When no applied rules were given explicitly they are taken from the
    /// rule ids recorded in the trace.
    pub fn seal(self) -> Result<ProofObject> {
        if self.operation.trim().is_empty() {
            return Err(CoreError::EmptyOperation);
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(CoreError::InvalidConfidence(self.confidence));
        }

        let timestamp = self.timestamp.unwrap_or_else(|| SystemClock.now_millis());
        let applied_rules = if self.applied_rules.is_empty() {
            rules_from_trace(&self.trace)
        } else {
            self.applied_rules
        };

        let digest = compute_digest(
            &self.operation,
            timestamp,
            &self.inputs,
            &self.outputs,
            &applied_rules,
            &self.statute_refs,
            &self.trace,
            self.confidence,
        )?;
        let summary = HumanReadableSummary::generate(
            &self.operation,
            &self.outputs,
            &applied_rules,
            &self.statute_refs,
        );

        Ok(ProofObject {
            proof_id: ProofId(digest.0),
            timestamp,
            operation: self.operation,
            inputs: self.inputs,
            outputs: self.outputs,
            applied_rules,
            statute_refs: self.statute_refs,
            trace: self.trace,
            confidence: self.confidence,
            seal: Seal {
                algorithm: SealAlgorithm::Blake3_256,
                digest,
            },
            summary,
        })
    }
}

/// Seal an invocation in one call.
pub fn seal(
    operation: &str,
    inputs: &serde_json::Value,
    outputs: &serde_json::Value,
    trace: ExecutionTrace,
    statute_refs: &[String],
) -> Result<ProofObject> {
    ProofBuilder::new(operation)
        .inputs(inputs)
        .outputs(outputs)
        .trace(trace)
        .statute_refs(statute_refs.iter().cloned())
        .seal()
}

/// Verify a proof's seal.
pub fn verify(proof: &ProofObject) -> bool {
    proof.verify()
}

fn rules_from_trace(trace: &ExecutionTrace) -> Vec<AppliedRule> {
    trace
        .rule_ids()
        .into_iter()
        .map(|id| {
            let description = trace
                .steps
                .iter()
                .find(|s| s.rule_id.as_deref() == Some(id))
                .map(|s| s.description.clone())
                .unwrap_or_default();
            AppliedRule::new(id, description)
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn compute_digest(
    operation: &str,
    timestamp: i64,
    inputs: &Frozen,
    outputs: &Frozen,
    applied_rules: &[AppliedRule],
    statute_refs: &[String],
    trace: &ExecutionTrace,
    confidence: f64,
) -> Result<Blake3Hash> {
    let rules = applied_rules
        .iter()
        .map(|r| {
            Value::Array(vec![
                Value::Text(r.rule_id.clone()),
                Value::Text(r.description.clone()),
            ])
        })
        .collect();
    let refs = statute_refs.iter().map(|s| Value::Text(s.clone())).collect();

    let map = Value::Map(vec![
        (Value::Integer(keys::VERSION.into()), Value::Integer(PROOF_VERSION.into())),
        (Value::Integer(keys::OPERATION.into()), Value::Text(operation.to_string())),
        (Value::Integer(keys::TIMESTAMP.into()), Value::Integer(timestamp.into())),
        (Value::Integer(keys::INPUTS.into()), json_to_cbor(inputs.value())?),
        (Value::Integer(keys::OUTPUTS.into()), json_to_cbor(outputs.value())?),
        (Value::Integer(keys::APPLIED_RULES.into()), Value::Array(rules)),
        (Value::Integer(keys::STATUTE_REFS.into()), Value::Array(refs)),
        (Value::Integer(keys::TRACE.into()), trace.to_cbor()?),
        (Value::Integer(keys::CONFIDENCE.into()), Value::Float(confidence)),
    ]);

    let bytes = encode_canonical(&map)?;
    Ok(Blake3Hash::hash_domain(SEAL_DOMAIN, &bytes))
}
