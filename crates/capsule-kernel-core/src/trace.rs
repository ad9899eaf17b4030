//! Execution traces recorded while a business rule runs.

use std::time::Instant;

use ciborium::value::Value;
use serde::{Deserialize, Serialize};

use crate::canonical::json_to_cbor;
use crate::error::Result;

/// One recorded step of a rule evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceStep {
    /// Position in the trace (0-indexed).
    pub index: u32,
    /// What happened.
    pub description: String,
    /// Identifier of the rule applied at this step, if any.
    pub rule_id: Option<String>,
    /// Intermediate value produced by this step, if any.
    pub detail: Option<serde_json::Value>,
    /// Time spent in this step.
    pub duration_ms: u64,
}

/// The ordered record of how an output was produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub steps: Vec<TraceStep>,
    pub total_duration_ms: u64,
}

impl ExecutionTrace {
    /// Build a trace from explicit steps. Indices are renumbered.
    pub fn new(steps: Vec<TraceStep>, total_duration_ms: u64) -> Self {
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(i, mut s)| {
                s.index = i as u32;
                s
            })
            .collect();
        Self {
            steps,
            total_duration_ms,
        }
    }

    /// An empty trace.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Rule ids referenced by the steps, in order of first appearance.
    pub fn rule_ids(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for id in self.steps.iter().filter_map(|s| s.rule_id.as_deref()) {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }

    /// CBOR form used inside the proof seal.
    pub(crate) fn to_cbor(&self) -> Result<Value> {
        let mut steps = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let detail = match &step.detail {
                Some(v) => json_to_cbor(v)?,
                None => Value::Null,
            };
            steps.push(Value::Map(vec![
                (Value::Integer(0.into()), Value::Integer(step.index.into())),
                (Value::Integer(1.into()), Value::Text(step.description.clone())),
                (
                    Value::Integer(2.into()),
                    step.rule_id
                        .as_ref()
                        .map_or(Value::Null, |r| Value::Text(r.clone())),
                ),
                (Value::Integer(3.into()), detail),
                (Value::Integer(4.into()), Value::Integer(step.duration_ms.into())),
            ]));
        }
        Ok(Value::Map(vec![
            (Value::Integer(0.into()), Value::Array(steps)),
            (
                Value::Integer(1.into()),
                Value::Integer(self.total_duration_ms.into()),
            ),
        ]))
    }
}

/// Records trace steps with wall-clock durations.
///
/// ```
/// use capsule_kernel_core::TraceRecorder;
///
/// let mut rec = TraceRecorder::start();
/// rec.step("validate inputs");
/// rec.rule_step("accrual.ratio", "apply 1:30 ratio", Some(serde_json::json!(2.67)));
/// let trace = rec.finish();
/// assert_eq!(trace.steps.len(), 2);
/// ```
#[derive(Debug)]
pub struct TraceRecorder {
    started: Instant,
    last: Instant,
    steps: Vec<TraceStep>,
}

impl TraceRecorder {
    /// Begin recording.
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            last: now,
            steps: Vec::new(),
        }
    }

    /// Record a step with no rule attached.
    pub fn step(&mut self, description: impl Into<String>) {
        self.push(description.into(), None, None);
    }

    /// Record a step that applied a named rule.
    pub fn rule_step(
        &mut self,
        rule_id: impl Into<String>,
        description: impl Into<String>,
        detail: Option<serde_json::Value>,
    ) {
        self.push(description.into(), Some(rule_id.into()), detail);
    }

    fn push(&mut self, description: String, rule_id: Option<String>, detail: Option<serde_json::Value>) {
        let now = Instant::now();
        let duration_ms = now.duration_since(self.last).as_millis() as u64;
        self.last = now;
        self.steps.push(TraceStep {
            index: self.steps.len() as u32,
            description,
            rule_id,
            detail,
            duration_ms,
        });
    }

    /// Number of steps recorded so far.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Stop recording and produce the trace.
    pub fn finish(self) -> ExecutionTrace {
        ExecutionTrace {
            total_duration_ms: self.started.elapsed().as_millis() as u64,
            steps: self.steps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorder_numbers_steps() {
        let mut rec = TraceRecorder::start();
        rec.step("a");
        rec.rule_step("r1", "b", None);
        rec.rule_step("r1", "c", None);
        let trace = rec.finish();

        assert_eq!(trace.steps[2].index, 2);
        assert_eq!(trace.rule_ids(), vec!["r1"]);
    }

    #[test]
    fn test_new_renumbers() {
        let step = |i| TraceStep {
            index: i,
            description: "x".into(),
            rule_id: None,
            detail: None,
            duration_ms: 0,
        };
        let trace = ExecutionTrace::new(vec![step(9), step(9)], 3);
        assert_eq!(trace.steps[0].index, 0);
        assert_eq!(trace.steps[1].index, 1);
    }
}
