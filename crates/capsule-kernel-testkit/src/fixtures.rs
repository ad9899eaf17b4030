//! Test fixtures and helpers.
//!
//! A reference accrual rule to drive scenarios, and a kernel on a manual
//! clock with helpers for attaching clients.

use std::sync::{Arc, Once};

use serde_json::{json, Value};

use capsule_kernel::{
    CapabilityRequest, Kernel, KernelConfig, ModuleManifest, ModuleType, RegisteredRule, Result,
    RuleError,
};
use capsule_kernel_caps::{CapabilitySpec, CapabilityToken, ResourceType, Rights};
use capsule_kernel_core::{Keypair, ManualClock, TraceRecorder};
use capsule_kernel_sched::ProcessId;

/// Operation name of the reference rule.
pub const ACCRUAL_OPERATION: &str = "accrual.calculate";
/// Worked hours per accrued hour.
pub const ACCRUAL_RATIO: f64 = 30.0;
pub const LARGE_EMPLOYER_CAP: f64 = 72.0;
pub const SMALL_EMPLOYER_CAP: f64 = 40.0;

/// 2026-01-14T12:00:00Z
pub const FIXTURE_EPOCH_MS: i64 = 1_736_870_400_000;

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

fn accrue(inputs: &Value, trace: &mut TraceRecorder) -> std::result::Result<Value, RuleError> {
    let hours = inputs["hoursWorked"]
        .as_f64()
        .ok_or_else(|| RuleError::InvalidInput("hoursWorked must be a number".into()))?;
    if hours < 0.0 {
        return Err(RuleError::InvalidInput("hoursWorked must not be negative".into()));
    }
    let prior = inputs["yearlyAccrued"].as_f64().unwrap_or(0.0);
    let cap = match inputs["employerSize"].as_str() {
        Some("large") => LARGE_EMPLOYER_CAP,
        Some("small") => SMALL_EMPLOYER_CAP,
        other => {
            return Err(RuleError::InvalidInput(format!("unknown employerSize {other:?}")));
        }
    };

    let earned = round2(hours / ACCRUAL_RATIO);
    trace.rule_step("accrual.ratio", "1 hour per 30 worked", Some(json!(earned)));

    let (accrued, capped) = if prior + earned > cap {
        (round2((cap - prior).max(0.0)), true)
    } else {
        (earned, false)
    };
    trace.rule_step("accrual.cap", format!("yearly cap {cap}"), Some(json!(capped)));

    Ok(json!({
        "accrued": accrued,
        "yearlyAccrued": round2(prior + accrued),
        "capped": capped,
        "cap": cap,
    }))
}

/// The reference accrual rule: 1 hour per 30 worked, capped per employer
/// size.
pub fn accrual_rule() -> RegisteredRule {
    RegisteredRule::new(ACCRUAL_OPERATION, accrue)
        .version("2026.1")
        .statute_ref("Reference Sick Time Act §3(a)")
}

/// Accrual inputs in the shape the reference rule reads.
pub fn accrual_inputs(hours_worked: f64, employer_size: &str, yearly_accrued: f64) -> Value {
    json!({
        "hoursWorked": hours_worked,
        "employerSize": employer_size,
        "yearlyAccrued": yearly_accrued,
    })
}

/// A manifest for a rule module that may reply to any `client*` mailbox.
pub fn rule_manifest(module_id: &str) -> ModuleManifest {
    ModuleManifest::new(module_id, ModuleType::Rule, "1.0.0").capability(
        CapabilityRequest::new(ResourceType::Mailbox, "client*", Rights::write_only())
            .justification("reply to clients"),
    )
}

/// Deterministic signing key.
pub fn signing_keypair(seed: u8) -> Keypair {
    Keypair::from_seed(&[seed; 32])
}

/// A host endpoint attached to a kernel.
#[derive(Debug, Clone, Copy)]
pub struct Client {
    pub pid: ProcessId,
    pub token: CapabilityToken,
}

/// A kernel on a manual clock.
pub struct KernelFixture {
    pub kernel: Kernel,
    pub clock: Arc<ManualClock>,
}

impl KernelFixture {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    /// Panics if the config is rejected; fixtures are for tests.
    pub fn with_config(config: KernelConfig) -> Self {
        let clock = Arc::new(ManualClock::new(FIXTURE_EPOCH_MS));
        let kernel = Kernel::builder(config)
            .clock(clock.clone())
            .capability_secret([7; 32])
            .build()
            .expect("fixture kernel");
        kernel.register_rule(accrual_rule());
        Self { kernel, clock }
    }

    /// Attach a client mailbox named `name` holding write access to
    /// mailboxes matching `send_pattern`.
    pub fn client(&self, name: &str, send_pattern: &str) -> Result<Client> {
        let pid = self.kernel.attach_client(name)?;
        let token = self.kernel.issue_capability(
            CapabilitySpec::new(ResourceType::Mailbox, send_pattern, Rights::write_only()).owner(name),
        )?;
        Ok(Client { pid, token })
    }

    pub fn advance(&self, ms: i64) -> i64 {
        self.clock.advance(ms)
    }
}

impl Default for KernelFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a test subscriber once. Honors `RUST_LOG`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
