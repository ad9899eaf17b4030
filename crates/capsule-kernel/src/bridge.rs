//! The entry point host applications call: run a rule, seal the result,
//! check it for drift and record it as a time capsule.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use capsule_kernel_core::{ProofBuilder, ProofObject, SharedClock, TimeCapsule};
use capsule_kernel_store::CapsuleStore;

use crate::drift::{DriftEngine, DriftEvent, DriftSeverity};
use crate::error::{KernelError, Result};
use crate::rules::RuleRegistry;

/// Optional collaborators and keys for one invocation.
#[derive(Default, Clone, Copy)]
pub struct InvocationContext<'a> {
    pub subject_id: Option<&'a str>,
    /// Defaults to the operation name.
    pub dimension: Option<&'a str>,
    /// Defaults to the proof timestamp.
    pub effective_date: Option<i64>,
    pub repository: Option<&'a dyn CapsuleStore>,
    pub drift_engine: Option<&'a DriftEngine>,
}

impl<'a> InvocationContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject_id: &'a str) -> Self {
        self.subject_id = Some(subject_id);
        self
    }

    pub fn dimension(mut self, dimension: &'a str) -> Self {
        self.dimension = Some(dimension);
        self
    }

    pub fn effective_date(mut self, t: i64) -> Self {
        self.effective_date = Some(t);
        self
    }

    pub fn repository(mut self, repository: &'a dyn CapsuleStore) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn drift_engine(mut self, engine: &'a DriftEngine) -> Self {
        self.drift_engine = Some(engine);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvocationStatus {
    Accepted,
    /// Legal drift or a quarantined subject. Nothing was written.
    RecalculationRequired,
}

/// Result of [`Bridge::invoke_with_proof`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub result: Value,
    pub proof: ProofObject,
    /// The capsule written for this invocation, if one was.
    pub capsule: Option<TimeCapsule>,
    pub drift_detected: bool,
    pub drift: Option<DriftEvent>,
    pub status: InvocationStatus,
}

impl Invocation {
    pub fn is_accepted(&self) -> bool {
        self.status == InvocationStatus::Accepted
    }
}

/// Runs registered rules with proof.
pub struct Bridge {
    rules: Arc<RuleRegistry>,
    clock: SharedClock,
}

impl Bridge {
    pub fn new(rules: Arc<RuleRegistry>, clock: SharedClock) -> Self {
        Self { rules, clock }
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub async fn invoke_with_proof(
        &self,
        operation: &str,
        inputs: &Value,
        ctx: InvocationContext<'_>,
    ) -> Result<Invocation> {
        let rule = self
            .rules
            .get(operation)
            .ok_or_else(|| KernelError::UnknownOperation(operation.to_string()))?;

        let (outputs, trace) = rule.run(inputs)?;
        let proof = ProofBuilder::new(operation)
            .inputs(inputs)
            .outputs(&outputs)
            .trace(trace)
            .statute_refs(rule.statute_refs().iter().cloned())
            .confidence(rule.confidence_level())
            .timestamp(self.clock.now_millis())
            .seal()?;
        debug!(operation, proof = %proof.proof_id(), "invocation sealed");

        let mut invocation = Invocation {
            result: outputs,
            proof,
            capsule: None,
            drift_detected: false,
            drift: None,
            status: InvocationStatus::Accepted,
        };

        let Some(subject) = ctx.subject_id else {
            return Ok(invocation);
        };
        let dimension = ctx.dimension.unwrap_or(operation);
        let effective = ctx.effective_date.unwrap_or_else(|| invocation.proof.timestamp());

        if let Some(engine) = ctx.drift_engine {
            if engine.is_quarantined(subject) {
                warn!(subject, dimension, "subject quarantined, not recording");
                invocation.drift_detected = true;
                invocation.drift = engine.quarantine_reason(subject);
                invocation.status = InvocationStatus::RecalculationRequired;
                return Ok(invocation);
            }
            if let Some(event) = engine
                .check_with_effective_date(subject, dimension, &invocation.proof, effective)
                .await?
            {
                invocation.drift_detected = true;
                if event.severity == DriftSeverity::Legal {
                    invocation.status = InvocationStatus::RecalculationRequired;
                }
                invocation.drift = Some(event);
            }
        }

        if invocation.status != InvocationStatus::Accepted {
            return Ok(invocation);
        }

        if let Some(repo) = ctx.repository {
            let capsule = match repo.active(subject, dimension).await? {
                Some(prior) => {
                    repo.supersede(&prior.id, invocation.proof.clone(), effective, rule.ruleset_version())
                        .await?
                }
                None => {
                    let capsule = TimeCapsule::new(
                        subject,
                        dimension,
                        invocation.proof.clone(),
                        invocation.proof.timestamp(),
                        effective,
                        rule.ruleset_version(),
                    )?;
                    repo.store(&capsule).await?;
                    capsule
                }
            };
            info!(subject, dimension, capsule = %capsule.id, "capsule recorded");
            invocation.capsule = Some(capsule);
        }

        Ok(invocation)
    }
}
