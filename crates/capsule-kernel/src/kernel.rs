//! The Kernel: one handle over capabilities, scheduling, IPC, modules,
//! proofs and the capsule ledger.
//!
//! Modules never run on their own. Each call to [`Kernel::step`] advances
//! the scheduler, takes one message for the dispatched module, runs its
//! behavior, routes the reply and feeds any exit to the supervisor.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use capsule_kernel_caps::{CapabilityEngine, CapabilitySpec, CapabilityToken, ResourceType, Rights};
use capsule_kernel_core::{system_clock, LedgerExport, SharedClock};
use capsule_kernel_ipc::{IpcError, Message, ReceiveResult, Router, SendReceipt};
use capsule_kernel_sched::{
    FairnessReport, ProcessDescriptor, ProcessId, Scheduler, SpawnOptions, TrapKind,
};
use capsule_kernel_store::{CapsuleStore, MemoryStore};

use crate::audit::{AuditEvent, AuditLog};
use crate::behavior::ModuleBehavior;
use crate::bridge::{Bridge, Invocation, InvocationContext};
use crate::config::KernelConfig;
use crate::drift::DriftEngine;
use crate::error::{KernelError, Result};
use crate::loader::{LoadResult, LoadedModule, ModuleLoader};
use crate::manifest::ModuleManifest;
use crate::rules::{RegisteredRule, RuleRegistry};
use crate::supervisor::{EscalationLevel, Supervisor, SupervisorAction};
use crate::syscall::{DenyNetwork, NetworkFetcher, Syscall, SyscallHost, Syscalls};

/// What one [`Kernel::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing was Ready.
    Idle,
    /// The dispatched module had no mail and now waits for some.
    Waiting { module_id: String },
    Handled {
        module_id: String,
        msg_type: String,
        replied: bool,
    },
    Trapped { module_id: String, trap: TrapKind },
}

#[derive(Debug, Clone)]
struct PendingRestart {
    module_id: String,
    level: EscalationLevel,
    due_at: i64,
}

/// Builder for a [`Kernel`] with non-default collaborators.
pub struct KernelBuilder {
    config: KernelConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn CapsuleStore>>,
    fetcher: Option<Arc<dyn NetworkFetcher>>,
    capability_secret: Option<[u8; 32]>,
}

impl KernelBuilder {
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn store(mut self, store: Arc<dyn CapsuleStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn network_fetcher(mut self, fetcher: Arc<dyn NetworkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Fixed key for token tags. Random when unset.
    pub fn capability_secret(mut self, secret: [u8; 32]) -> Self {
        self.capability_secret = Some(secret);
        self
    }

    pub fn build(self) -> Result<Kernel> {
        let config = self.config;
        let clock = self.clock.unwrap_or_else(system_clock);
        let store: Arc<dyn CapsuleStore> = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let fetcher: Arc<dyn NetworkFetcher> = self.fetcher.unwrap_or_else(|| Arc::new(DenyNetwork));

        let caps = Arc::new(match self.capability_secret {
            Some(secret) => CapabilityEngine::with_secret(secret, clock.clone()),
            None => CapabilityEngine::new(clock.clone()),
        });
        let sched = Arc::new(Mutex::new(Scheduler::new(config.scheduler)));
        let router = Arc::new(Router::new(
            caps.clone(),
            clock.clone(),
            Duration::from_millis(config.ipc.block_send_timeout_ms),
        ));
        let wake_target = sched.clone();
        router.set_wake_hook(Arc::new(move |pid| {
            let mut sched = wake_target.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(err) = sched.wake(pid) {
                debug!(%pid, error = %err, "wake ignored");
            }
        }));

        let audit = Arc::new(AuditLog::new(config.audit.clone(), clock.clone()));
        let rules = Arc::new(RuleRegistry::new());
        let drift = Arc::new(
            DriftEngine::new(config.drift.clone(), clock.clone(), store.clone())
                .with_rules(rules.clone())
                .with_audit(audit.clone()),
        );
        let bridge = Bridge::new(rules.clone(), clock.clone());
        let loader = ModuleLoader::new(
            caps.clone(),
            sched.clone(),
            router.clone(),
            audit.clone(),
            config.loader.clone(),
            config.ipc.clone(),
        )?;
        let host = SyscallHost::new(caps.clone(), router.clone(), clock.clone(), audit.clone(), fetcher);
        let supervisor = Mutex::new(Supervisor::new(config.supervisor.clone()));

        let version = env!("CARGO_PKG_VERSION").to_string();
        audit.append("kernel", AuditEvent::KernelStarted { version: version.clone() });
        info!(%version, "kernel started");

        Ok(Kernel {
            config,
            clock,
            caps,
            sched,
            router,
            audit,
            rules,
            store,
            drift,
            bridge,
            loader,
            host,
            supervisor,
            pending_restarts: Mutex::new(Vec::new()),
            escalations: Mutex::new(Vec::new()),
        })
    }
}

/// The kernel.
pub struct Kernel {
    config: KernelConfig,
    clock: SharedClock,
    caps: Arc<CapabilityEngine>,
    sched: Arc<Mutex<Scheduler>>,
    router: Arc<Router>,
    audit: Arc<AuditLog>,
    rules: Arc<RuleRegistry>,
    store: Arc<dyn CapsuleStore>,
    drift: Arc<DriftEngine>,
    bridge: Bridge,
    loader: ModuleLoader,
    host: SyscallHost,
    supervisor: Mutex<Supervisor>,
    pending_restarts: Mutex<Vec<PendingRestart>>,
    escalations: Mutex<Vec<(String, EscalationLevel)>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Kernel {
    /// A kernel on the system clock with an in-memory ledger.
    pub fn new(config: KernelConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn builder(config: KernelConfig) -> KernelBuilder {
        KernelBuilder {
            config,
            clock: None,
            store: None,
            fetcher: None,
            capability_secret: None,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn capabilities(&self) -> &Arc<CapabilityEngine> {
        &self.caps
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn rules(&self) -> &Arc<RuleRegistry> {
        &self.rules
    }

    pub fn store(&self) -> &Arc<dyn CapsuleStore> {
        &self.store
    }

    pub fn drift(&self) -> &Arc<DriftEngine> {
        &self.drift
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn syscall_host(&self) -> &SyscallHost {
        &self.host
    }

    // ─────────────────────────────────────────────────────────────────────
    // Rules and proofs
    // ─────────────────────────────────────────────────────────────────────

    pub fn register_rule(&self, rule: RegisteredRule) -> Option<Arc<RegisteredRule>> {
        self.rules.register(rule)
    }

    /// Run `operation` with proof. With a subject, the result is checked
    /// for drift and recorded in the kernel's ledger.
    pub async fn invoke_with_proof(
        &self,
        operation: &str,
        inputs: &Value,
        subject_id: Option<&str>,
    ) -> Result<Invocation> {
        let mut ctx = InvocationContext::new();
        if let Some(subject) = subject_id {
            ctx = ctx.subject(subject);
        }
        self.invoke_with_context(operation, inputs, ctx).await
    }

    /// [`invoke_with_proof`](Self::invoke_with_proof) with an explicit
    /// context. The kernel's ledger and drift engine fill in whatever the
    /// context leaves unset.
    pub async fn invoke_with_context<'a>(
        &'a self,
        operation: &str,
        inputs: &Value,
        mut ctx: InvocationContext<'a>,
    ) -> Result<Invocation> {
        if ctx.repository.is_none() {
            ctx = ctx.repository(self.store.as_ref());
        }
        if ctx.drift_engine.is_none() {
            ctx = ctx.drift_engine(&self.drift);
        }
        self.bridge.invoke_with_proof(operation, inputs, ctx).await
    }

    pub async fn export_timeline(&self, subject_id: &str) -> Result<LedgerExport> {
        Ok(self
            .store
            .export_timeline(subject_id, self.clock.now_millis())
            .await?)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Modules
    // ─────────────────────────────────────────────────────────────────────

    /// Load a module and put it under supervision.
    pub fn load_module(&self, manifest: ModuleManifest, behavior: ModuleBehavior) -> Result<LoadResult> {
        let result = self.loader.load(manifest, behavior)?;
        lock(&self.supervisor).watch(result.module_id.clone());
        Ok(result)
    }

    pub fn load_module_json(&self, manifest_json: &str, behavior: ModuleBehavior) -> Result<LoadResult> {
        self.load_module(ModuleManifest::from_json(manifest_json)?, behavior)
    }

    pub fn unload_module(&self, module_id: &str) -> Result<()> {
        lock(&self.supervisor).unwatch(module_id);
        lock(&self.pending_restarts).retain(|p| p.module_id != module_id);
        self.loader.unload(module_id)?;
        // the kill notice is of no interest to the supervisor
        self.drain_exits();
        Ok(())
    }

    pub fn hot_swap(&self, module_id: &str, manifest: ModuleManifest, behavior: ModuleBehavior) -> Result<()> {
        self.loader.hot_swap(module_id, manifest, behavior)
    }

    pub fn module(&self, module_id: &str) -> Option<LoadedModule> {
        self.loader.get(module_id)
    }

    pub fn modules(&self) -> Vec<String> {
        self.loader.modules()
    }

    /// Escalations the supervisor could not handle, oldest first.
    pub fn escalations(&self) -> Vec<(String, EscalationLevel)> {
        lock(&self.escalations).clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Capabilities and messaging
    // ─────────────────────────────────────────────────────────────────────

    pub fn issue_capability(&self, spec: CapabilitySpec) -> Result<CapabilityToken> {
        Ok(self.caps.issue(spec)?)
    }

    /// Give the host a mailbox named `name`. The endpoint is a process that
    /// is never scheduled.
    pub fn attach_client(&self, name: &str) -> Result<ProcessId> {
        let capacity = self.config.ipc.default_mailbox_capacity;
        let pid = lock(&self.sched).spawn(SpawnOptions::new(name).mailbox_capacity(capacity));
        if let Err(err) = self.router.register_mailbox(
            pid,
            name,
            capacity,
            self.config.ipc.default_overflow_policy,
        ) {
            let mut sched = lock(&self.sched);
            if let Err(err) = sched.kill(pid) {
                debug!(%pid, error = %err, "client process already gone");
            }
            sched.drain_exits();
            sched.reap(pid);
            return Err(err.into());
        }
        debug!(%pid, client = name, "client attached");
        Ok(pid)
    }

    /// Send as `from` with a capability check. Denials are audited.
    ///
    /// `from` must own a mailbox. The header's source is overwritten with
    /// it, so a caller cannot put words in another endpoint's mouth.
    pub async fn send(&self, from: ProcessId, token: &CapabilityToken, mut msg: Message) -> Result<SendReceipt> {
        if self.router.mailbox_stats(from).is_none() {
            return Err(KernelError::Ipc(IpcError::MailboxNotFound(from)));
        }
        if msg.header.source != from {
            warn!(%from, claimed = %msg.header.source, "message source rebound to sender");
            msg.header.source = from;
        }
        let source = from;
        let target = msg.header.target;
        match self.router.send(token, msg).await {
            Ok(receipt) => Ok(receipt),
            Err(IpcError::SendPermissionDenied(err)) => {
                let holder = self
                    .loader
                    .module_id_of(source)
                    .unwrap_or_else(|| source.to_string());
                let path = self
                    .router
                    .mailbox_stats(target)
                    .map(|s| s.name)
                    .unwrap_or_else(|| target.to_string());
                self.audit.append(
                    "ipc",
                    AuditEvent::CapabilityDenied {
                        holder,
                        resource: ResourceType::Mailbox.to_string(),
                        path,
                        reason: err.reason_code().to_string(),
                    },
                );
                Err(KernelError::Ipc(IpcError::SendPermissionDenied(err)))
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn receive(&self, pid: ProcessId, timeout_ms: u64, filter: Option<&str>) -> Result<ReceiveResult> {
        Ok(self.router.receive(pid, timeout_ms, filter).await?)
    }

    /// Run a syscall on behalf of a loaded module.
    pub async fn syscall(&self, module_id: &str, call: Syscall) -> Result<Value> {
        let module = self
            .loader
            .get(module_id)
            .ok_or_else(|| KernelError::ModuleNotFound(module_id.to_string()))?;
        let sys = Syscalls::new(
            &module.manifest.module_id,
            module.pid,
            &module.manifest.allowed_syscalls,
            &module.tokens,
            &self.host,
        );
        sys.invoke(call).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scheduling
    // ─────────────────────────────────────────────────────────────────────

    pub fn process(&self, pid: ProcessId) -> Option<ProcessDescriptor> {
        lock(&self.sched).descriptor(pid).cloned()
    }

    pub fn fairness_report(&self) -> FairnessReport {
        lock(&self.sched).fairness_report()
    }

    /// Dispatch one module for one message.
    pub async fn step(&self) -> Result<StepOutcome> {
        let now = self.clock.now_millis();
        self.run_due_restarts(now)?;

        let dispatched = lock(&self.sched).tick(now);
        self.handle_exits(now)?;
        let Some(pid) = dispatched else {
            return Ok(StepOutcome::Idle);
        };
        let Some(module) = self.loader.by_pid(pid) else {
            // not a module; nothing to run
            if let Err(err) = lock(&self.sched).complete(pid) {
                debug!(%pid, error = %err, "non-module process not completed");
            }
            self.drain_exits();
            return Ok(StepOutcome::Idle);
        };
        let module_id = module.manifest.module_id.clone();

        let msg = match self.router.receive(pid, 0, None).await? {
            ReceiveResult::Message(msg) => msg,
            ReceiveResult::Empty | ReceiveResult::Timeout => {
                self.park(pid);
                return Ok(StepOutcome::Waiting { module_id });
            }
            ReceiveResult::ShuttingDown => return Ok(StepOutcome::Idle),
        };

        let sys = Syscalls::new(
            &module.manifest.module_id,
            pid,
            &module.manifest.allowed_syscalls,
            &module.tokens,
            &self.host,
        );
        match module.behavior.handle(&msg, &sys).await {
            Ok(reply) => {
                let replied = match reply {
                    Some(reply) => self.deliver_reply(&module, reply).await,
                    None => false,
                };
                self.park(pid);
                Ok(StepOutcome::Handled {
                    module_id,
                    msg_type: msg.msg_type,
                    replied,
                })
            }
            Err(trap) => {
                {
                    let mut sched = lock(&self.sched);
                    if let Err(err) = sched.trap(pid, trap) {
                        warn!(%pid, error = %err, "trap on a process that already exited");
                    }
                }
                self.audit.append(
                    "kernel",
                    AuditEvent::ProcessTrapped {
                        module_id: module_id.clone(),
                        trap,
                    },
                );
                self.handle_exits(now)?;
                Ok(StepOutcome::Trapped { module_id, trap })
            }
        }
    }

    /// Step until nothing is Ready or `max_steps` is reached. Returns the
    /// number of messages handled.
    pub async fn run_until_idle(&self, max_steps: usize) -> Result<usize> {
        let mut handled = 0;
        for _ in 0..max_steps {
            match self.step().await? {
                StepOutcome::Idle => break,
                StepOutcome::Handled { .. } | StepOutcome::Trapped { .. } => handled += 1,
                StepOutcome::Waiting { .. } => {}
            }
        }
        Ok(handled)
    }

    /// Leave Running: back to Ready if mail is queued, else Waiting.
    fn park(&self, pid: ProcessId) {
        let mut sched = lock(&self.sched);
        let result = if self.router.pending(pid) > 0 {
            sched.yield_now(pid)
        } else {
            sched.wait(pid)
        };
        if let Err(err) = result {
            debug!(%pid, error = %err, "park skipped");
        }
    }

    async fn deliver_reply(&self, module: &LoadedModule, reply: Message) -> bool {
        let module_id = &module.manifest.module_id;
        let target = reply.header.target;
        let Some(name) = self.router.mailbox_stats(target).map(|s| s.name) else {
            debug!(module = %module_id, %target, "reply target gone");
            return false;
        };

        let now = self.clock.now_millis();
        let token = module.tokens.iter().find(|t| {
            self.caps.snapshot(t.id()).map_or(false, |cap| {
                cap.is_active(now) && cap.covers(&ResourceType::Mailbox, &name, &Rights::write_only())
            })
        });
        let Some(token) = token else {
            warn!(module = %module_id, mailbox = %name, "module holds no capability to reply");
            self.audit.append(
                "ipc",
                AuditEvent::CapabilityDenied {
                    holder: module_id.clone(),
                    resource: ResourceType::Mailbox.to_string(),
                    path: name,
                    reason: "no_capability".into(),
                },
            );
            return false;
        };

        match self.send(module.pid, token, reply).await {
            Ok(_) => true,
            Err(err) => {
                warn!(module = %module_id, mailbox = %name, error = %err, "reply not delivered");
                false
            }
        }
    }

    fn drain_exits(&self) -> usize {
        lock(&self.sched).drain_exits().len()
    }

    fn handle_exits(&self, now: i64) -> Result<()> {
        let exits = lock(&self.sched).drain_exits();
        for notice in exits {
            // exits of replaced processes are stale
            if self.loader.module_id_of(notice.pid).is_none() {
                continue;
            }
            let action = lock(&self.supervisor).on_exit(&notice, now);
            if action == SupervisorAction::None {
                continue;
            }
            self.audit.append(
                "supervisor",
                AuditEvent::SupervisorDecision {
                    module_id: notice.name.clone(),
                    action: action.to_string(),
                },
            );
            match action {
                SupervisorAction::Restart { level, delay_ms } => {
                    if delay_ms == 0 {
                        self.loader.restart(&notice.name, level.level())?;
                    } else {
                        lock(&self.pending_restarts).push(PendingRestart {
                            module_id: notice.name.clone(),
                            level,
                            due_at: now.saturating_add(delay_ms as i64),
                        });
                    }
                }
                SupervisorAction::Stop => {
                    info!(module = %notice.name, reason = %notice.reason, "module stopped");
                }
                SupervisorAction::Escalate(level) => {
                    error!(module = %notice.name, %level, "supervisor escalation");
                    lock(&self.escalations).push((notice.name.clone(), level));
                }
                SupervisorAction::None => {}
            }
        }
        Ok(())
    }

    fn run_due_restarts(&self, now: i64) -> Result<()> {
        let due: Vec<PendingRestart> = {
            let mut pending = lock(&self.pending_restarts);
            let (due, later) = pending.drain(..).partition(|p| p.due_at <= now);
            *pending = later;
            due
        };
        for restart in due {
            if self.loader.is_loaded(&restart.module_id) {
                self.loader.restart(&restart.module_id, restart.level.level())?;
            }
        }
        Ok(())
    }

    /// Re-verify the audit chain.
    pub fn verify_audit(&self) -> Result<usize> {
        self.audit.verify_chain()
    }

    /// Stop routing and record the shutdown.
    pub fn shutdown(&self) {
        self.router.shutdown();
        self.audit.append("kernel", AuditEvent::KernelShutdown);
        info!(modules = self.loader.modules().len(), "kernel shut down");
    }
}
