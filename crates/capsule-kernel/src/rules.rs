//! Business rules, registered by operation name.
//!
//! A rule is a pure function from inputs to outputs. It records what it did
//! on the [`TraceRecorder`] it is handed; the kernel seals the inputs, the
//! outputs and that trace into a proof. The kernel never looks inside a rule.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use capsule_kernel_core::{ExecutionTrace, TraceRecorder};
use capsule_kernel_sched::TrapKind;

/// Why a rule refused or failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// Inputs are missing or out of domain. Not retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("rule failed: {0}")]
    Failed(String),

    /// The rule hit a fault that should terminate the calling module.
    #[error("rule trapped: {0}")]
    Trap(TrapKind),
}

/// Signature every rule implements.
pub type RuleFn = dyn Fn(&Value, &mut TraceRecorder) -> Result<Value, RuleError> + Send + Sync;

/// A rule plus the metadata sealed alongside its results.
#[derive(Clone)]
pub struct RegisteredRule {
    operation: String,
    ruleset_version: String,
    statute_refs: Vec<String>,
    confidence: f64,
    func: Arc<RuleFn>,
}

impl RegisteredRule {
    pub fn new<F>(operation: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value, &mut TraceRecorder) -> Result<Value, RuleError> + Send + Sync + 'static,
    {
        Self {
            operation: operation.into(),
            ruleset_version: "unversioned".into(),
            statute_refs: Vec::new(),
            confidence: 1.0,
            func: Arc::new(func),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.ruleset_version = version.into();
        self
    }

    pub fn statute_ref(mut self, reference: impl Into<String>) -> Self {
        self.statute_refs.push(reference.into());
        self
    }

    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn ruleset_version(&self) -> &str {
        &self.ruleset_version
    }

    pub fn statute_refs(&self) -> &[String] {
        &self.statute_refs
    }

    pub fn confidence_level(&self) -> f64 {
        self.confidence
    }

    /// Run the rule and return its outputs with the recorded trace.
    pub fn run(&self, inputs: &Value) -> Result<(Value, ExecutionTrace), RuleError> {
        let mut recorder = TraceRecorder::start();
        let outputs = (self.func)(inputs, &mut recorder)?;
        Ok((outputs, recorder.finish()))
    }

    /// Run the rule for its outputs only, discarding the trace.
    pub fn recompute(&self, inputs: &Value) -> Result<Value, RuleError> {
        self.run(inputs).map(|(outputs, _)| outputs)
    }
}

impl fmt::Debug for RegisteredRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredRule")
            .field("operation", &self.operation)
            .field("ruleset_version", &self.ruleset_version)
            .field("statute_refs", &self.statute_refs)
            .finish_non_exhaustive()
    }
}

/// Operation name -> rule.
#[derive(Debug, Default)]
pub struct RuleRegistry {
    rules: RwLock<HashMap<String, Arc<RegisteredRule>>>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, replacing and returning any previous one for the
    /// same operation.
    pub fn register(&self, rule: RegisteredRule) -> Option<Arc<RegisteredRule>> {
        let operation = rule.operation.clone();
        debug!(operation = %operation, version = %rule.ruleset_version, "rule registered");
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(operation, Arc::new(rule))
    }

    pub fn unregister(&self, operation: &str) -> Option<Arc<RegisteredRule>> {
        self.rules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(operation)
    }

    pub fn get(&self, operation: &str) -> Option<Arc<RegisteredRule>> {
        self.rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(operation)
            .cloned()
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.get(operation).is_some()
    }

    /// Registered operation names, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        ops.sort();
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doubler() -> RegisteredRule {
        RegisteredRule::new("math.double", |inputs, trace| {
            let x = inputs["x"]
                .as_f64()
                .ok_or_else(|| RuleError::InvalidInput("x must be a number".into()))?;
            trace.rule_step("math.double", "multiply by two", Some(json!(x * 2.0)));
            Ok(json!({ "y": x * 2.0 }))
        })
        .version("v1")
        .statute_ref("Arithmetic §1")
    }

    #[test]
    fn test_run_records_trace() {
        let rule = doubler();
        let (out, trace) = rule.run(&json!({"x": 4})).unwrap();
        assert_eq!(out, json!({"y": 8.0}));
        assert_eq!(trace.rule_ids(), vec!["math.double"]);
        assert_eq!(rule.statute_refs(), ["Arithmetic §1".to_string()]);
    }

    #[test]
    fn test_invalid_input() {
        let err = doubler().run(&json!({"x": "four"})).unwrap_err();
        assert!(matches!(err, RuleError::InvalidInput(_)));
    }

    #[test]
    fn test_registry_replace_and_list() {
        let registry = RuleRegistry::new();
        assert!(registry.register(doubler()).is_none());
        let previous = registry.register(doubler().version("v2")).unwrap();
        assert_eq!(previous.ruleset_version(), "v1");
        assert_eq!(registry.get("math.double").unwrap().ruleset_version(), "v2");
        assert_eq!(registry.operations(), vec!["math.double".to_string()]);
        assert!(registry.unregister("math.double").is_some());
        assert!(!registry.contains("math.double"));
    }
}
