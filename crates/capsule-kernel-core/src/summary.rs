//! Deterministic human-readable summaries for proof objects.
//!
//! The summary is a pure function of the operation, outputs, applied rules and
//! statute references. Verification regenerates it and compares, so a summary
//! edited after sealing is detected like any other field.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::proof::AppliedRule;

/// Warning emitted when a computation hit its configured cap.
pub const CAP_REACHED_WARNING: &str =
    "Cap reached: the result was limited to its configured maximum";

/// Plain-language explanation of a sealed computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanReadableSummary {
    pub summary: String,
    pub key_findings: Vec<String>,
    pub legal_basis: Vec<String>,
    pub warnings: Vec<String>,
    pub reasoning: String,
}

impl HumanReadableSummary {
    /// Generate the summary for a computation.
    pub fn generate(
        operation: &str,
        outputs: &Value,
        applied_rules: &[AppliedRule],
        statute_refs: &[String],
    ) -> Self {
        let key_findings = findings(outputs);

        let mut warnings = Vec::new();
        if matches!(outputs.get("capped"), Some(Value::Bool(true))) {
            warnings.push(CAP_REACHED_WARNING.to_string());
        }
        for (key, value) in sorted_fields(outputs) {
            if let Some(n) = value.as_f64() {
                if n < 0.0 {
                    warnings.push(format!("Negative value for {}: {}", key, render(value)));
                }
            }
        }
        if applied_rules.is_empty() {
            warnings.push("No rules were recorded for this computation".to_string());
        }

        let rule_word = if applied_rules.len() == 1 { "rule" } else { "rules" };
        let summary = format!(
            "{} produced {} finding(s) under {} {}",
            operation,
            key_findings.len(),
            applied_rules.len(),
            rule_word
        );

        let reasoning = applied_rules
            .iter()
            .map(|r| format!("{}: {}", r.rule_id, r.description))
            .collect::<Vec<_>>()
            .join("; ");

        Self {
            summary,
            key_findings,
            legal_basis: statute_refs.to_vec(),
            warnings,
            reasoning,
        }
    }

    /// True if the cap-reached warning is present.
    pub fn cap_reached(&self) -> bool {
        self.warnings.iter().any(|w| w == CAP_REACHED_WARNING)
    }
}

fn sorted_fields(outputs: &Value) -> Vec<(&str, &Value)> {
    match outputs {
        Value::Object(map) => {
            let mut fields: Vec<_> = map.iter().map(|(k, v)| (k.as_str(), v)).collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            fields
        }
        _ => Vec::new(),
    }
}

fn findings(outputs: &Value) -> Vec<String> {
    match outputs {
        Value::Object(_) => sorted_fields(outputs)
            .into_iter()
            .map(|(k, v)| format!("{}: {}", k, render(v)))
            .collect(),
        Value::Null => Vec::new(),
        other => vec![format!("result: {}", render(other))],
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => i.to_string(),
            (None, Some(f)) => {
                let rounded = format!("{:.2}", f);
                rounded
                    .trim_end_matches('0')
                    .trim_end_matches('.')
                    .to_string()
            }
            _ => n.to_string(),
        },
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule() -> AppliedRule {
        AppliedRule::new("accrual.ratio", "1 hour per 30 worked")
    }

    #[test]
    fn test_cap_warning() {
        let s = HumanReadableSummary::generate(
            "accrual.calculate",
            &json!({"capped": true, "accrued": 2.0}),
            &[rule()],
            &["Reference Sick Time Act s.3".to_string()],
        );
        assert!(s.cap_reached());
        assert_eq!(s.legal_basis, vec!["Reference Sick Time Act s.3".to_string()]);
        assert_eq!(s.key_findings, vec!["accrued: 2", "capped: true"]);
    }

    #[test]
    fn test_no_cap_warning_when_false() {
        let s = HumanReadableSummary::generate("op", &json!({"capped": false}), &[rule()], &[]);
        assert!(!s.cap_reached());
        assert!(s.warnings.is_empty());
    }

    #[test]
    fn test_negative_value_warning() {
        let s = HumanReadableSummary::generate("op", &json!({"balance": -3}), &[rule()], &[]);
        assert_eq!(s.warnings, vec!["Negative value for balance: -3"]);
    }

    #[test]
    fn test_deterministic() {
        let outputs = json!({"b": 1.456, "a": "x"});
        let a = HumanReadableSummary::generate("op", &outputs, &[rule()], &[]);
        let b = HumanReadableSummary::generate("op", &outputs, &[rule()], &[]);
        assert_eq!(a, b);
        assert_eq!(a.key_findings, vec!["a: x", "b: 1.46"]);
        assert_eq!(a.reasoning, "accrual.ratio: 1 hour per 30 worked");
    }
}
