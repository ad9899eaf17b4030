//! Module lifecycle through the kernel: load, message, swap, crash, unload.

use serde_json::{json, Value};

use capsule_kernel::caps::{ResourceType, Rights};
use capsule_kernel::ipc::{Message, MessageFlags, ReceiveResult};
use capsule_kernel::sched::{ProcessState, TrapKind};
use capsule_kernel::{
    AuditEvent, CapabilityRequest, ChildSpec, EscalationLevel, KernelConfig, KernelError, ModuleBehavior,
    ModuleManifest, ModuleType, RegisteredRule, RuleError, StepOutcome, Syscall, SyscallKind, RULE_RESULT,
};
use capsule_kernel_testkit::fixtures::{
    accrual_inputs, accrual_rule, init_tracing, rule_manifest, signing_keypair, Client, KernelFixture,
};

fn checked_double() -> RegisteredRule {
    RegisteredRule::new("math.double", |inputs, trace| {
        let x = inputs["x"]
            .as_i64()
            .ok_or_else(|| RuleError::InvalidInput("x".into()))?;
        let y = x.checked_mul(2).ok_or(RuleError::Trap(TrapKind::Overflow))?;
        trace.rule_step("math.double", "x times 2", None);
        Ok(json!({ "y": y }))
    })
}

async fn request(fx: &KernelFixture, client: &Client, module: &str, msg_type: &str, body: Value) {
    let target = fx.kernel.router().resolve(module).unwrap();
    let msg = Message::new(client.pid, target, msg_type, body.to_string()).with_flags(MessageFlags::REPLY_EXPECTED);
    fx.kernel.send(client.pid, &client.token, msg).await.unwrap();
}

async fn reply_body(fx: &KernelFixture, client: &Client) -> Value {
    let reply = fx
        .kernel
        .receive(client.pid, 0, None)
        .await
        .unwrap()
        .into_message()
        .expect("a reply");
    reply.payload_json().unwrap()
}

#[tokio::test]
async fn test_accrual_module_replies_with_proof() {
    init_tracing();
    let fx = KernelFixture::new();
    fx.kernel
        .load_module(rule_manifest("accrual"), ModuleBehavior::rule(accrual_rule()))
        .unwrap();
    let client = fx.client("client-hr", "accrual").unwrap();

    request(&fx, &client, "accrual", "accrual.calculate", accrual_inputs(80.0, "large", 70.0)).await;
    assert_eq!(fx.kernel.run_until_idle(16).await.unwrap(), 1);

    let reply = fx
        .kernel
        .receive(client.pid, 0, Some(RULE_RESULT))
        .await
        .unwrap()
        .into_message()
        .unwrap();
    let body: Value = reply.payload_json().unwrap();
    assert_eq!(body["operation"], "accrual.calculate");
    assert_eq!(body["result"]["capped"], true);
    assert_eq!(body["verified"], true);
    assert_eq!(body["proofId"].as_str().unwrap().len(), 64);
}

#[tokio::test]
async fn test_relay_preserves_channel_order() {
    let fx = KernelFixture::new();
    let manifest = ModuleManifest::new("relay", ModuleType::Relay, "1.0.0").capability(
        CapabilityRequest::new(ResourceType::Mailbox, "client*", Rights::write_only()).justification("forward to clients"),
    );
    fx.kernel
        .load_module(manifest, ModuleBehavior::relay("client-sink"))
        .unwrap();
    let source = fx.client("client-source", "relay").unwrap();
    let sink = fx.client("client-sink", "nothing").unwrap();
    let relay = fx.kernel.router().resolve("relay").unwrap();

    let mut last = 0;
    for i in 0..5 {
        let receipt = fx
            .kernel
            .send(source.pid, &source.token, Message::new(source.pid, relay, "tick", i.to_string()))
            .await
            .unwrap();
        let seq = receipt.sequence.unwrap();
        assert!(seq > last);
        last = seq;
    }
    assert_eq!(fx.kernel.run_until_idle(32).await.unwrap(), 5);

    let mut seen = Vec::new();
    let mut last_seq = 0;
    while let ReceiveResult::Message(msg) = fx.kernel.receive(sink.pid, 0, None).await.unwrap() {
        assert_eq!(msg.header.source, relay);
        assert!(msg.header.sequence > last_seq);
        last_seq = msg.header.sequence;
        seen.push(String::from_utf8(msg.payload.to_vec()).unwrap());
    }
    assert_eq!(seen, ["0", "1", "2", "3", "4"]);
}

#[tokio::test]
async fn test_required_capability_denied_by_policy() {
    let mut config = KernelConfig::default();
    config.loader.grant_policy.deny_resource_types = vec![ResourceType::Network];
    let fx = KernelFixture::with_config(config);

    let manifest = rule_manifest("fetcher").capability(
        CapabilityRequest::new(ResourceType::Network, "https://*", Rights::execute_only()).justification("rates feed"),
    );
    let err = fx
        .kernel
        .load_module(manifest, ModuleBehavior::rule(checked_double()))
        .unwrap_err();

    assert!(matches!(err, KernelError::SpawnPermissionDenied { ref module_id, .. } if module_id == "fetcher"));
    assert!(fx.kernel.modules().is_empty());
    assert!(fx.kernel.router().resolve("fetcher").is_none());
    assert!(fx.kernel.capabilities().list_for_owner("fetcher").iter().all(|c| c.revoked));
}

#[tokio::test]
async fn test_optional_capability_denial_still_loads() {
    let mut config = KernelConfig::default();
    config.loader.grant_policy.deny_resource_types = vec![ResourceType::Network];
    let fx = KernelFixture::with_config(config);

    let manifest = rule_manifest("fetcher").capability(
        CapabilityRequest::new(ResourceType::Network, "https://*", Rights::execute_only())
            .justification("rates feed")
            .optional(),
    );
    let loaded = fx
        .kernel
        .load_module(manifest, ModuleBehavior::rule(checked_double()))
        .unwrap();
    assert_eq!(loaded.granted.len(), 1);
    assert_eq!(loaded.denied_optional.len(), 1);
}

#[tokio::test]
async fn test_signed_manifests_required() {
    let keypair = signing_keypair(3);
    let mut config = KernelConfig::default();
    config.loader.require_signatures = true;
    config.loader.trusted_key = Some(keypair.public_key().to_hex());
    let fx = KernelFixture::with_config(config);

    let unsigned = fx
        .kernel
        .load_module(rule_manifest("double"), ModuleBehavior::rule(checked_double()))
        .unwrap_err();
    assert!(matches!(unsigned, KernelError::SignatureMissing(_)));

    let forged = rule_manifest("double").signed(&signing_keypair(4)).unwrap();
    let err = fx
        .kernel
        .load_module(forged, ModuleBehavior::rule(checked_double()))
        .unwrap_err();
    assert!(matches!(err, KernelError::InvalidSignature(_)));

    let signed = rule_manifest("double").signed(&keypair).unwrap();
    fx.kernel
        .load_module(signed, ModuleBehavior::rule(checked_double()))
        .unwrap();
    assert!(fx.kernel.module("double").is_some());
}

#[tokio::test]
async fn test_hot_swap_keeps_process_and_rejects_escalation() {
    let fx = KernelFixture::new();
    let loaded = fx
        .kernel
        .load_module(rule_manifest("double"), ModuleBehavior::rule(checked_double()))
        .unwrap();
    let client = fx.client("client-ops", "double").unwrap();

    let mut v2 = rule_manifest("double");
    v2.version = "2.0.0".into();
    let tripler = RegisteredRule::new("math.double", |inputs, _| {
        Ok(json!({ "y": inputs["x"].as_i64().unwrap_or_default() * 3 }))
    });
    fx.kernel
        .hot_swap("double", v2, ModuleBehavior::rule(tripler))
        .unwrap();
    assert_eq!(fx.kernel.module("double").unwrap().pid, loaded.pid);
    assert_eq!(fx.kernel.module("double").unwrap().manifest.version, "2.0.0");

    request(&fx, &client, "double", "math.double", json!({"x": 5})).await;
    fx.kernel.run_until_idle(8).await.unwrap();
    assert_eq!(reply_body(&fx, &client).await["result"]["y"], 15);

    let greedy = rule_manifest("double").capability(
        CapabilityRequest::new(ResourceType::Storage, "*", Rights::read_write()).justification("cache"),
    );
    let err = fx
        .kernel
        .hot_swap("double", greedy, ModuleBehavior::rule(checked_double()))
        .unwrap_err();
    assert!(matches!(err, KernelError::EscalationRejected { .. }));
    assert_eq!(fx.kernel.module("double").unwrap().manifest.version, "2.0.0");
}

#[tokio::test]
async fn test_crash_loop_escalates() {
    let mut config = KernelConfig::default();
    config.supervisor = ChildSpec {
        max_restarts: 1,
        base_delay_ms: 0,
        ..ChildSpec::default()
    };
    let fx = KernelFixture::with_config(config);
    fx.kernel
        .load_module(rule_manifest("double"), ModuleBehavior::rule(checked_double()))
        .unwrap();
    let client = fx.client("client-ops", "double").unwrap();

    request(&fx, &client, "double", "math.double", json!({"x": i64::MAX})).await;
    assert!(matches!(fx.kernel.step().await.unwrap(), StepOutcome::Trapped { trap: TrapKind::Overflow, .. }));
    assert!(fx.kernel.escalations().is_empty());

    // restarted under the same name; the client's token still reaches it
    request(&fx, &client, "double", "math.double", json!({"x": i64::MAX})).await;
    assert!(matches!(fx.kernel.step().await.unwrap(), StepOutcome::Trapped { .. }));

    assert_eq!(fx.kernel.escalations(), vec![("double".to_string(), EscalationLevel::RestartSupervisor)]);
    let pid = fx.kernel.module("double").unwrap().pid;
    assert_eq!(fx.kernel.process(pid).unwrap().state, ProcessState::Completed);
    assert_eq!(fx.kernel.step().await.unwrap(), StepOutcome::Idle);

    let trapped = fx
        .kernel
        .audit()
        .entries()
        .into_iter()
        .filter(|e| matches!(e.event, AuditEvent::ProcessTrapped { .. }))
        .count();
    assert_eq!(trapped, 2);
    assert!(fx.kernel.verify_audit().is_ok());
}

fn stalling_double() -> RegisteredRule {
    RegisteredRule::new("math.double", |inputs, trace| {
        let x = inputs["x"]
            .as_i64()
            .ok_or_else(|| RuleError::InvalidInput("x".into()))?;
        if x < 0 {
            return Err(RuleError::Trap(TrapKind::Timeout));
        }
        trace.rule_step("math.double", "x times 2", None);
        Ok(json!({ "y": x * 2 }))
    })
}

fn quick_restarts() -> KernelConfig {
    let mut config = KernelConfig::default();
    config.supervisor = ChildSpec {
        base_delay_ms: 0,
        ..ChildSpec::default()
    };
    config
}

#[tokio::test]
async fn test_queued_messages_survive_state_preserving_restart() {
    let fx = KernelFixture::with_config(quick_restarts());
    let loaded = fx
        .kernel
        .load_module(rule_manifest("double"), ModuleBehavior::rule(stalling_double()))
        .unwrap();
    let client = fx.client("client-ops", "double").unwrap();

    request(&fx, &client, "double", "math.double", json!({"x": -1})).await;
    request(&fx, &client, "double", "math.double", json!({"x": 2})).await;
    request(&fx, &client, "double", "math.double", json!({"x": 3})).await;

    assert!(matches!(
        fx.kernel.step().await.unwrap(),
        StepOutcome::Trapped { trap: TrapKind::Timeout, .. }
    ));
    let restarted = fx.kernel.module("double").unwrap();
    assert_ne!(restarted.pid, loaded.pid);
    assert_eq!(restarted.tokens, loaded.granted);
    assert_eq!(fx.kernel.router().pending(restarted.pid), 2);
    assert!(fx.kernel.audit().entries().iter().any(|e| matches!(
        e.event,
        AuditEvent::ModuleRestarted { level: 1, .. }
    )));

    assert_eq!(fx.kernel.run_until_idle(16).await.unwrap(), 2);
    assert_eq!(reply_body(&fx, &client).await["result"]["y"], 4);
    assert_eq!(reply_body(&fx, &client).await["result"]["y"], 6);
}

#[tokio::test]
async fn test_reload_restart_clears_mailbox_and_regrants() {
    let fx = KernelFixture::with_config(quick_restarts());
    let loaded = fx
        .kernel
        .load_module(rule_manifest("double"), ModuleBehavior::rule(checked_double()))
        .unwrap();
    let client = fx.client("client-ops", "double").unwrap();

    request(&fx, &client, "double", "math.double", json!({"x": i64::MAX})).await;
    request(&fx, &client, "double", "math.double", json!({"x": 2})).await;

    assert!(matches!(
        fx.kernel.step().await.unwrap(),
        StepOutcome::Trapped { trap: TrapKind::Overflow, .. }
    ));
    let restarted = fx.kernel.module("double").unwrap();
    assert_eq!(fx.kernel.router().pending(restarted.pid), 0);
    assert_eq!(restarted.tokens.len(), loaded.granted.len());
    assert_ne!(restarted.tokens, loaded.granted);
    let caps = fx.kernel.capabilities();
    assert!(loaded.granted.iter().all(|t| caps.snapshot(t.id()).unwrap().revoked));
    assert!(restarted.tokens.iter().all(|t| !caps.snapshot(t.id()).unwrap().revoked));

    // the new grant still lets it answer
    request(&fx, &client, "double", "math.double", json!({"x": 5})).await;
    assert_eq!(fx.kernel.run_until_idle(16).await.unwrap(), 1);
    assert_eq!(reply_body(&fx, &client).await["result"]["y"], 10);
}

#[tokio::test]
async fn test_unload_revokes_and_closes_mailbox() {
    let fx = KernelFixture::new();
    let loaded = fx
        .kernel
        .load_module(rule_manifest("double"), ModuleBehavior::rule(checked_double()))
        .unwrap();
    let client = fx.client("client-ops", "double").unwrap();

    fx.kernel.unload_module("double").unwrap();
    assert!(fx.kernel.capabilities().list_for_owner("double").iter().all(|c| c.revoked));
    assert!(fx.kernel.router().resolve("double").is_none());
    assert_eq!(fx.kernel.process(loaded.pid).unwrap().state, ProcessState::Completed);

    let err = fx
        .kernel
        .send(client.pid, &client.token, Message::new(client.pid, loaded.pid, "math.double", "{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, KernelError::Ipc(_)));
    assert!(matches!(
        fx.kernel.unload_module("double"),
        Err(KernelError::ModuleNotFound(_))
    ));
}

#[tokio::test]
async fn test_module_syscalls_are_capability_checked() {
    let fx = KernelFixture::new();
    let manifest = rule_manifest("ledger")
        .capability(
            CapabilityRequest::new(ResourceType::Storage, "ledger.*", Rights::read_write()).justification("balances"),
        )
        .syscall(SyscallKind::StorageRead)
        .syscall(SyscallKind::StorageWrite);
    fx.kernel
        .load_module(manifest, ModuleBehavior::rule(checked_double()))
        .unwrap();

    fx.kernel
        .syscall(
            "ledger",
            Syscall::StorageWrite {
                key: "ledger.balance".into(),
                value: json!(12),
            },
        )
        .await
        .unwrap();
    let read = fx
        .kernel
        .syscall("ledger", Syscall::StorageRead { key: "ledger.balance".into() })
        .await
        .unwrap();
    assert_eq!(read, json!(12));

    let outside = fx
        .kernel
        .syscall("ledger", Syscall::StorageRead { key: "payroll.secret".into() })
        .await
        .unwrap_err();
    assert!(matches!(outside, KernelError::Capability(_)));

    let not_declared = fx.kernel.syscall("ledger", Syscall::Now).await.unwrap_err();
    assert!(matches!(not_declared, KernelError::SyscallNotAllowed { .. }));
    assert!(matches!(
        fx.kernel.audit().last().unwrap().event,
        AuditEvent::SyscallDenied { .. }
    ));
}

#[tokio::test]
async fn test_reply_without_capability_is_dropped() {
    let fx = KernelFixture::new();
    // no mailbox capability: the module can compute but not answer
    let manifest = ModuleManifest::new("mute", ModuleType::Rule, "1.0.0");
    fx.kernel
        .load_module(manifest, ModuleBehavior::rule(checked_double()))
        .unwrap();
    let client = fx.client("client-ops", "mute").unwrap();

    request(&fx, &client, "mute", "math.double", json!({"x": 2})).await;
    assert!(matches!(
        fx.kernel.step().await.unwrap(),
        StepOutcome::Handled { replied: false, .. }
    ));
    assert_eq!(fx.kernel.receive(client.pid, 0, None).await.unwrap(), ReceiveResult::Empty);
    assert!(matches!(
        fx.kernel.audit().last().unwrap().event,
        AuditEvent::CapabilityDenied { ref holder, .. } if holder == "mute"
    ));
}
