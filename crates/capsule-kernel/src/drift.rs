//! Drift detection across sealed computations.
//!
//! A new proof is compared against the active capsule for the same subject
//! and dimension, and against the registered rule when one exists. Legal
//! severity quarantines the subject until someone releases it.
//!
//! Quarantine is per subject, not per dimension: a legal inconsistency in
//! one of a subject's records holds back every dimension of that subject
//! until review.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use capsule_kernel_core::{ProofId, ProofObject, SharedClock, TimeCapsule};
use capsule_kernel_store::CapsuleStore;

use crate::audit::{AuditEvent, AuditLog};
use crate::error::Result;
use crate::rules::RuleRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DriftCategory {
    /// The stored record itself no longer verifies.
    DataInconsistency,
    /// Same inputs, different outputs.
    CalculationDivergence,
    /// Backdated further than plausible.
    TemporalAnomaly,
    /// A value outside its domain, such as a negative balance.
    ImpossibleState,
}

impl fmt::Display for DriftCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftCategory::DataInconsistency => "dataInconsistency",
            DriftCategory::CalculationDivergence => "calculationDivergence",
            DriftCategory::TemporalAnomaly => "temporalAnomaly",
            DriftCategory::ImpossibleState => "impossibleState",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriftSeverity {
    Informational,
    Operational,
    /// Halts the computation path until reviewed.
    Legal,
}

impl fmt::Display for DriftSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriftSeverity::Informational => "INFORMATIONAL",
            DriftSeverity::Operational => "OPERATIONAL",
            DriftSeverity::Legal => "LEGAL",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftEvent {
    pub detected_at: i64,
    pub category: DriftCategory,
    pub severity: DriftSeverity,
    pub subject_id: String,
    pub dimension: String,
    /// Proof that triggered the event.
    pub proof_id: ProofId,
    pub evidence: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    /// Largest accepted gap between a capsule's effective date and its
    /// calculation time.
    pub max_backdate_ms: i64,
    /// Output fields allowed to go negative. Matched against the field name
    /// or its dotted path.
    pub signed_fields: Vec<String>,
    /// Events kept in memory. Oldest are dropped first.
    pub max_events: usize,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            // one year
            max_backdate_ms: 365 * 24 * 60 * 60 * 1000,
            signed_fields: Vec::new(),
            max_events: 10_000,
        }
    }
}

#[derive(Default)]
struct DriftState {
    events: Vec<DriftEvent>,
    quarantined: HashMap<String, DriftEvent>,
}

/// Classifies divergence between a new proof and what came before.
pub struct DriftEngine {
    config: DriftConfig,
    clock: SharedClock,
    repository: Arc<dyn CapsuleStore>,
    rules: Option<Arc<RuleRegistry>>,
    audit: Option<Arc<AuditLog>>,
    state: RwLock<DriftState>,
}

impl DriftEngine {
    pub fn new(config: DriftConfig, clock: SharedClock, repository: Arc<dyn CapsuleStore>) -> Self {
        Self {
            config,
            clock,
            repository,
            rules: None,
            audit: None,
            state: RwLock::new(DriftState::default()),
        }
    }

    /// Recompute from stored inputs with these rules.
    pub fn with_rules(mut self, rules: Arc<RuleRegistry>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &DriftConfig {
        &self.config
    }

    /// Check `proof` for `subject_id`/`dimension`, taking the proof's own
    /// timestamp as its effective date. Every event found is recorded; the
    /// most severe one is returned.
    pub async fn check(
        &self,
        subject_id: &str,
        dimension: &str,
        proof: &ProofObject,
    ) -> Result<Option<DriftEvent>> {
        self.check_with_effective_date(subject_id, dimension, proof, proof.timestamp())
            .await
    }

    /// Like [`check`](Self::check), for a proof that will be recorded as
    /// effective at `effective_date`.
    pub async fn check_with_effective_date(
        &self,
        subject_id: &str,
        dimension: &str,
        proof: &ProofObject,
        effective_date: i64,
    ) -> Result<Option<DriftEvent>> {
        let prior = self.repository.active(subject_id, dimension).await?;
        let now = self.clock.now_millis();
        let event = |category, severity, evidence| DriftEvent {
            detected_at: now,
            category,
            severity,
            subject_id: subject_id.to_string(),
            dimension: dimension.to_string(),
            proof_id: proof.proof_id(),
            evidence,
        };

        let mut found = Vec::new();

        let negatives = self.negative_fields(proof.outputs().value());
        if !negatives.is_empty() {
            found.push(event(
                DriftCategory::ImpossibleState,
                DriftSeverity::Legal,
                json!({ "negativeFields": negatives }),
            ));
        }

        if let Some(recomputed) = self.recompute(proof.operation(), proof.inputs().value()) {
            if &recomputed != proof.outputs().value() {
                found.push(event(
                    DriftCategory::CalculationDivergence,
                    DriftSeverity::Legal,
                    json!({
                        "source": "rule",
                        "recorded": proof.outputs().value(),
                        "recomputed": recomputed,
                    }),
                ));
            }
        }

        let backdate = proof.timestamp() - effective_date;
        if backdate > self.config.max_backdate_ms {
            found.push(event(
                DriftCategory::TemporalAnomaly,
                DriftSeverity::Operational,
                json!({
                    "calculatedAt": proof.timestamp(),
                    "effectiveDate": effective_date,
                    "backdateMs": backdate,
                }),
            ));
        }

        if let Some(prior) = prior {
            found.extend(self.compare_with_prior(&prior, proof, &event));
        }

        Ok(self.record(found))
    }

    fn compare_with_prior<F>(&self, prior: &TimeCapsule, proof: &ProofObject, event: &F) -> Vec<DriftEvent>
    where
        F: Fn(DriftCategory, DriftSeverity, Value) -> DriftEvent,
    {
        let mut found = Vec::new();

        if !prior.proof.verify() {
            found.push(event(
                DriftCategory::DataInconsistency,
                DriftSeverity::Legal,
                json!({ "capsuleId": prior.id.to_hex(), "reason": "prior proof fails verification" }),
            ));
            return found;
        }

        let same_inputs = match (prior.proof.inputs().canonical_bytes(), proof.inputs().canonical_bytes()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        };
        if same_inputs && prior.proof.outputs() != proof.outputs() {
            let mut evidence = json!({
                "priorCapsule": prior.id.to_hex(),
                "priorOutputs": prior.proof.outputs().value(),
                "newOutputs": proof.outputs().value(),
            });
            if let Some(recomputed) = self.recompute(prior.proof.operation(), prior.proof.inputs().value()) {
                evidence["recomputed"] = recomputed;
            }
            found.push(event(DriftCategory::CalculationDivergence, DriftSeverity::Legal, evidence));
        }
        found
    }

    fn recompute(&self, operation: &str, inputs: &Value) -> Option<Value> {
        let rule = self.rules.as_ref()?.get(operation)?;
        match rule.recompute(inputs) {
            Ok(outputs) => Some(outputs),
            Err(err) => {
                debug!(operation, error = %err, "recompute failed, skipping rule comparison");
                None
            }
        }
    }

    fn negative_fields(&self, outputs: &Value) -> Vec<String> {
        let mut out = Vec::new();
        collect_negatives(outputs, "", &mut out);
        out.retain(|path| {
            let name = path.rsplit('.').next().unwrap_or(path);
            !self
                .config
                .signed_fields
                .iter()
                .any(|f| f == path || f == name)
        });
        out
    }

    fn record(&self, found: Vec<DriftEvent>) -> Option<DriftEvent> {
        if found.is_empty() {
            return None;
        }
        let mut worst: Option<&DriftEvent> = None;
        for e in &found {
            if worst.map_or(true, |w| e.severity > w.severity) {
                worst = Some(e);
            }
        }
        let worst = worst.cloned();

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        for e in &found {
            match e.severity {
                DriftSeverity::Legal => {
                    error!(subject = %e.subject_id, dimension = %e.dimension, category = %e.category, "legal drift detected, quarantining subject");
                    state
                        .quarantined
                        .entry(e.subject_id.clone())
                        .or_insert_with(|| e.clone());
                }
                _ => {
                    warn!(subject = %e.subject_id, dimension = %e.dimension, category = %e.category, severity = %e.severity, "drift detected");
                }
            }
            if let Some(audit) = &self.audit {
                audit.append(
                    "drift",
                    AuditEvent::DriftDetected {
                        subject_id: e.subject_id.clone(),
                        dimension: e.dimension.clone(),
                        category: e.category.to_string(),
                        severity: e.severity.to_string(),
                    },
                );
            }
        }
        state.events.extend(found);
        let excess = state.events.len().saturating_sub(self.config.max_events);
        if excess > 0 {
            state.events.drain(..excess);
        }
        worst
    }

    pub fn is_quarantined(&self, subject_id: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .quarantined
            .contains_key(subject_id)
    }

    /// The event that put `subject_id` in quarantine.
    pub fn quarantine_reason(&self, subject_id: &str) -> Option<DriftEvent> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .quarantined
            .get(subject_id)
            .cloned()
    }

    pub fn quarantined(&self) -> Vec<String> {
        let mut subjects: Vec<String> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .quarantined
            .keys()
            .cloned()
            .collect();
        subjects.sort();
        subjects
    }

    /// Lift the quarantine after review. Returns false if the subject was
    /// not quarantined.
    pub fn release(&self, subject_id: &str) -> bool {
        let released = self
            .state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .quarantined
            .remove(subject_id)
            .is_some();
        if released {
            info!(subject = subject_id, "subject released from quarantine");
            if let Some(audit) = &self.audit {
                audit.append(
                    "drift",
                    AuditEvent::SubjectReleased {
                        subject_id: subject_id.to_string(),
                    },
                );
            }
        }
        released
    }

    pub fn events(&self) -> Vec<DriftEvent> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .clone()
    }

    pub fn events_for(&self, subject_id: &str) -> Vec<DriftEvent> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .events
            .iter()
            .filter(|e| e.subject_id == subject_id)
            .cloned()
            .collect()
    }
}

fn collect_negatives(value: &Value, path: &str, out: &mut Vec<String>) {
    match value {
        Value::Number(n) => {
            if n.as_f64().map_or(false, |x| x < 0.0) {
                out.push(path.to_string());
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                let child = if path.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", path, k)
                };
                collect_negatives(v, &child, out);
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                collect_negatives(v, &format!("{}[{}]", path, i), out);
            }
        }
        _ => {}
    }
}
