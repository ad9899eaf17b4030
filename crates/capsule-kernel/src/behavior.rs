//! What a loaded module does with each message it receives.

use std::fmt;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use capsule_kernel_core::ProofBuilder;
use capsule_kernel_ipc::{Message, MessageFlags};
use capsule_kernel_sched::TrapKind;

use crate::manifest::ModuleType;
use crate::rules::{RegisteredRule, RuleError};
use crate::syscall::Syscalls;

/// Reply type for a successful rule run.
pub const RULE_RESULT: &str = "rule.result";
/// Reply type when a rule rejects its input or fails.
pub const RULE_ERROR: &str = "rule.error";

/// The closed set of module behaviors.
#[derive(Clone)]
pub enum ModuleBehavior {
    /// Run a registered rule on the JSON payload and seal the result.
    Rule(Arc<RegisteredRule>),
    /// Forward every message to the mailbox registered as `target`.
    Relay { target: String },
    /// Append every message to the audit log.
    Audit,
}

impl ModuleBehavior {
    pub fn rule(rule: RegisteredRule) -> Self {
        ModuleBehavior::Rule(Arc::new(rule))
    }

    pub fn relay(target: impl Into<String>) -> Self {
        ModuleBehavior::Relay { target: target.into() }
    }

    pub fn module_type(&self) -> ModuleType {
        match self {
            ModuleBehavior::Rule(_) => ModuleType::Rule,
            ModuleBehavior::Relay { .. } => ModuleType::Relay,
            ModuleBehavior::Audit => ModuleType::Audit,
        }
    }

    /// Handle one message. `Ok(Some(reply))` asks the kernel to deliver the
    /// reply; `Err` traps the module.
    pub async fn handle(&self, msg: &Message, sys: &Syscalls<'_>) -> Result<Option<Message>, TrapKind> {
        match self {
            ModuleBehavior::Rule(rule) => handle_rule(rule, msg, sys),
            ModuleBehavior::Relay { target } => {
                let Some(to) = sys.resolve(target) else {
                    warn!(module = %sys.module_id(), %target, "relay target not registered, dropping");
                    return Ok(None);
                };
                let forwarded = Message::new(sys.pid(), to, msg.msg_type.clone(), msg.payload.clone())
                    .with_flags(msg.header.flags);
                Ok(Some(forwarded))
            }
            ModuleBehavior::Audit => {
                let text = String::from_utf8_lossy(&msg.payload);
                if let Err(err) = sys.audit_append(&msg.msg_type, &text).await {
                    warn!(module = %sys.module_id(), error = %err, "audit module could not append");
                }
                Ok(None)
            }
        }
    }
}

fn handle_rule(rule: &RegisteredRule, msg: &Message, sys: &Syscalls<'_>) -> Result<Option<Message>, TrapKind> {
    let wants_reply = msg.header.flags.contains(MessageFlags::REPLY_EXPECTED);
    let reply = |msg_type: &str, body: Value| {
        Ok(wants_reply.then(|| Message::new(sys.pid(), msg.header.source, msg_type, body.to_string())))
    };

    let inputs: Value = match msg.payload_json() {
        Ok(v) => v,
        Err(err) => {
            debug!(module = %sys.module_id(), error = %err, "payload is not JSON");
            return reply(RULE_ERROR, json!({ "operation": rule.operation(), "error": err.to_string() }));
        }
    };

    let (outputs, trace) = match rule.run(&inputs) {
        Ok(done) => done,
        Err(RuleError::Trap(kind)) => return Err(kind),
        Err(err) => {
            return reply(RULE_ERROR, json!({ "operation": rule.operation(), "error": err.to_string() }));
        }
    };

    let sealed = ProofBuilder::new(rule.operation())
        .inputs(&inputs)
        .outputs(&outputs)
        .trace(trace)
        .statute_refs(rule.statute_refs().iter().cloned())
        .confidence(rule.confidence_level())
        .timestamp(sys.kernel_time())
        .seal();
    let proof = match sealed {
        Ok(p) => p,
        Err(err) => {
            return reply(RULE_ERROR, json!({ "operation": rule.operation(), "error": err.to_string() }));
        }
    };

    debug!(module = %sys.module_id(), operation = %rule.operation(), proof = %proof.proof_id(), "rule sealed");
    reply(
        RULE_RESULT,
        json!({
            "operation": rule.operation(),
            "result": outputs,
            "proofId": proof.proof_id().to_hex(),
            "verified": proof.verify(),
        }),
    )
}

impl fmt::Debug for ModuleBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleBehavior::Rule(rule) => f.debug_tuple("Rule").field(&rule.operation()).finish(),
            ModuleBehavior::Relay { target } => f.debug_struct("Relay").field("target", target).finish(),
            ModuleBehavior::Audit => f.write_str("Audit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, AuditEvent, AuditLog};
    use crate::syscall::{DenyNetwork, SyscallHost, SyscallKind};
    use capsule_kernel_caps::{CapabilityEngine, CapabilitySpec, CapabilityToken, ResourceType, Rights};
    use capsule_kernel_core::{ManualClock, SharedClock};
    use capsule_kernel_ipc::{OverflowPolicy, Router};
    use capsule_kernel_sched::ProcessId;
    use std::time::Duration;

    struct Fixture {
        caps: Arc<CapabilityEngine>,
        router: Arc<Router>,
        audit: Arc<AuditLog>,
        host: SyscallHost,
    }

    fn fixture() -> Fixture {
        let clock: SharedClock = Arc::new(ManualClock::new(9_000));
        let caps = Arc::new(CapabilityEngine::new(clock.clone()));
        let router = Arc::new(Router::new(caps.clone(), clock.clone(), Duration::from_millis(50)));
        let audit = Arc::new(AuditLog::new(AuditConfig::default(), clock.clone()));
        let host = SyscallHost::new(caps.clone(), router.clone(), clock, audit.clone(), Arc::new(DenyNetwork));
        Fixture { caps, router, audit, host }
    }

    fn halver() -> RegisteredRule {
        RegisteredRule::new("math.halve", |inputs, trace| {
            let x = inputs["x"]
                .as_i64()
                .ok_or_else(|| RuleError::InvalidInput("x".into()))?;
            if x == i64::MIN {
                return Err(RuleError::Trap(TrapKind::Overflow));
            }
            trace.rule_step("math.halve", "integer halving", None);
            Ok(json!({ "y": x / 2 }))
        })
    }

    fn request(body: Value) -> Message {
        Message::new(ProcessId(7), ProcessId(3), "math.halve", body.to_string())
            .with_flags(MessageFlags::REPLY_EXPECTED)
    }

    #[tokio::test]
    async fn test_rule_replies_with_sealed_result() {
        let fx = fixture();
        let sys = Syscalls::new("halver", ProcessId(3), &[], &[], &fx.host);
        let behavior = ModuleBehavior::rule(halver());

        let reply = behavior.handle(&request(json!({"x": 10})), &sys).await.unwrap().unwrap();
        assert_eq!(reply.msg_type, RULE_RESULT);
        assert_eq!(reply.header.target, ProcessId(7));
        let body: Value = reply.payload_json().unwrap();
        assert_eq!(body["result"], json!({"y": 5}));
        assert_eq!(body["verified"], true);
    }

    #[tokio::test]
    async fn test_rule_error_and_trap() {
        let fx = fixture();
        let sys = Syscalls::new("halver", ProcessId(3), &[], &[], &fx.host);
        let behavior = ModuleBehavior::rule(halver());

        let reply = behavior.handle(&request(json!({"x": "ten"})), &sys).await.unwrap().unwrap();
        assert_eq!(reply.msg_type, RULE_ERROR);

        let trapped = behavior.handle(&request(json!({"x": i64::MIN})), &sys).await;
        assert_eq!(trapped, Err(TrapKind::Overflow));

        let no_reply = Message::new(ProcessId(7), ProcessId(3), "math.halve", "{\"x\":4}");
        assert!(behavior.handle(&no_reply, &sys).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_relay_forwards_from_own_pid() {
        let fx = fixture();
        fx.router
            .register_mailbox(ProcessId(11), "sink", 4, OverflowPolicy::DropNewest)
            .unwrap();
        let sys = Syscalls::new("relay", ProcessId(3), &[], &[], &fx.host);

        let out = ModuleBehavior::relay("sink")
            .handle(&request(json!({"x": 1})), &sys)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.header.source, ProcessId(3));
        assert_eq!(out.header.target, ProcessId(11));
        assert_eq!(out.msg_type, "math.halve");

        let missing = ModuleBehavior::relay("nowhere").handle(&request(json!({})), &sys).await;
        assert_eq!(missing, Ok(None));
    }

    #[tokio::test]
    async fn test_audit_module_appends() {
        let fx = fixture();
        let token: CapabilityToken = fx
            .caps
            .issue(CapabilitySpec::new(ResourceType::AuditLog, "*", Rights::write_only()).owner("auditor"))
            .unwrap();
        let tokens = [token];
        let allowed = [SyscallKind::AuditAppend];
        let sys = Syscalls::new("auditor", ProcessId(4), &allowed, &tokens, &fx.host);

        let msg = Message::new(ProcessId(7), ProcessId(4), "payroll", "run complete");
        assert_eq!(ModuleBehavior::Audit.handle(&msg, &sys).await, Ok(None));

        let last = fx.audit.last().unwrap();
        assert_eq!(last.source, "auditor");
        assert_eq!(
            last.event,
            AuditEvent::Custom {
                category: "payroll".into(),
                message: "run complete".into()
            }
        );
    }
}
