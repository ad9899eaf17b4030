//! Loading, unloading, hot-swapping and restarting modules.
//!
//! Loading is all-or-nothing: every capability issued for a module is
//! revoked again if a required request is refused or the process cannot be
//! set up. The module id doubles as the process name, the mailbox name and
//! the owner of its capabilities.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use capsule_kernel_caps::{
    Capability, CapabilityEngine, CapabilitySpec, CapabilityToken, ResourcePattern, ResourceType, Rights,
};
use capsule_kernel_core::Ed25519PublicKey;
use capsule_kernel_ipc::Router;
use capsule_kernel_sched::{ProcessId, Scheduler, SpawnOptions};

use crate::audit::{AuditEvent, AuditLog};
use crate::behavior::ModuleBehavior;
use crate::config::IpcConfig;
use crate::error::{KernelError, Result};
use crate::manifest::{CapabilityRequest, ModuleManifest};
use crate::supervisor::EscalationLevel;

/// What the loader will grant, whatever a manifest asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GrantPolicy {
    pub deny_resource_types: Vec<ResourceType>,
    /// Globs; a request whose pattern any of these match is refused.
    pub deny_patterns: Vec<String>,
    /// Upper bound on the rights of any single grant.
    pub max_rights: Rights,
}

impl Default for GrantPolicy {
    fn default() -> Self {
        Self {
            deny_resource_types: Vec::new(),
            deny_patterns: Vec::new(),
            max_rights: Rights::full(),
        }
    }
}

impl GrantPolicy {
    /// `Err(reason)` when the request must be refused.
    pub fn evaluate(&self, request: &CapabilityRequest) -> std::result::Result<(), String> {
        if self.deny_resource_types.contains(&request.resource_type) {
            return Err(format!("resource type {} is not grantable", request.resource_type));
        }
        for deny in &self.deny_patterns {
            let hit = ResourcePattern::new(deny).map_or(deny == &request.pattern, |p| p.matches(&request.pattern));
            if hit {
                return Err(format!("pattern {} is denied", request.pattern));
            }
        }
        if !request.rights.is_subset_of(&self.max_rights) {
            return Err(format!(
                "rights {} exceed policy maximum",
                request.rights.missing_from(&self.max_rights)
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub require_signatures: bool,
    /// Hex Ed25519 public key manifests must be signed with.
    pub trusted_key: Option<String>,
    pub grant_policy: GrantPolicy,
}

/// A module as the kernel holds it.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    pub manifest: ModuleManifest,
    pub behavior: Arc<ModuleBehavior>,
    pub pid: ProcessId,
    pub tokens: Vec<CapabilityToken>,
}

/// Returned by [`ModuleLoader::load`].
#[derive(Debug, Clone, PartialEq)]
pub struct LoadResult {
    pub module_id: String,
    pub pid: ProcessId,
    /// One entry per granted request, in manifest order.
    pub granted: Vec<CapabilityToken>,
    /// Optional requests the policy refused, described as `type:pattern:rights`.
    pub denied_optional: Vec<String>,
}

#[derive(Default)]
struct ModuleTable {
    modules: HashMap<String, LoadedModule>,
    by_pid: HashMap<ProcessId, String>,
}

pub struct ModuleLoader {
    caps: Arc<CapabilityEngine>,
    sched: Arc<Mutex<Scheduler>>,
    router: Arc<Router>,
    audit: Arc<AuditLog>,
    config: LoaderConfig,
    ipc: IpcConfig,
    trusted_key: Option<Ed25519PublicKey>,
    table: RwLock<ModuleTable>,
}

impl ModuleLoader {
    pub fn new(
        caps: Arc<CapabilityEngine>,
        sched: Arc<Mutex<Scheduler>>,
        router: Arc<Router>,
        audit: Arc<AuditLog>,
        config: LoaderConfig,
        ipc: IpcConfig,
    ) -> Result<Self> {
        let trusted_key = match &config.trusted_key {
            Some(hex) => Some(
                Ed25519PublicKey::from_hex(hex)
                    .map_err(|e| KernelError::Config(format!("loader.trusted_key: {}", e)))?,
            ),
            None => None,
        };
        if config.require_signatures && trusted_key.is_none() {
            return Err(KernelError::Config(
                "loader.require_signatures needs loader.trusted_key".into(),
            ));
        }
        Ok(Self {
            caps,
            sched,
            router,
            audit,
            config,
            ipc,
            trusted_key,
            table: RwLock::new(ModuleTable::default()),
        })
    }

    fn sched(&self) -> MutexGuard<'_, Scheduler> {
        self.sched.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_signature(&self, manifest: &ModuleManifest) -> Result<()> {
        match (&self.trusted_key, self.config.require_signatures) {
            (Some(key), true) => manifest.verify_signature(key),
            // verify whatever is present even when not required
            (Some(key), false) if manifest.signature.is_some() => manifest.verify_signature(key),
            _ => Ok(()),
        }
    }

    /// Load a module: validate, check the signature, grant capabilities,
    /// spawn the process, register its mailbox and make it Ready.
    pub fn load(&self, manifest: ModuleManifest, behavior: ModuleBehavior) -> Result<LoadResult> {
        manifest.validate()?;
        let module_id = manifest.module_id.clone();
        if self.is_loaded(&module_id) {
            return Err(KernelError::ModuleExists(module_id));
        }
        self.check_signature(&manifest)?;
        if behavior.module_type() != manifest.module_type {
            return Err(KernelError::InvalidManifest(format!(
                "{}: manifest declares {:?} but behavior is {:?}",
                module_id,
                manifest.module_type,
                behavior.module_type()
            )));
        }

        let (granted, denied_optional) = self.grant_all(&manifest)?;

        let limits = &manifest.resource_limits;
        let mut opts = SpawnOptions::new(&module_id)
            .priority(manifest.priority)
            .mailbox_capacity(limits.max_mailbox_depth);
        if limits.max_execution_time_ms > 0 {
            opts = opts.budget_ms(limits.max_execution_time_ms);
        }
        let policy = manifest
            .overflow_policy
            .unwrap_or(self.ipc.default_overflow_policy);

        let pid = self.sched().spawn(opts);
        if let Err(err) = self
            .router
            .register_mailbox(pid, &module_id, limits.max_mailbox_depth, policy)
        {
            self.rollback(&module_id, Some(pid));
            return Err(err.into());
        }
        let ready = self.sched().make_ready(pid);
        if let Err(err) = ready {
            if let Err(err) = self.router.close_mailbox(pid) {
                debug!(module = %module_id, %pid, error = %err, "mailbox already closed");
            }
            self.rollback(&module_id, Some(pid));
            return Err(err.into());
        }

        let loaded = LoadedModule {
            manifest: manifest.clone(),
            behavior: Arc::new(behavior),
            pid,
            tokens: granted.clone(),
        };
        {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            table.by_pid.insert(pid, module_id.clone());
            table.modules.insert(module_id.clone(), loaded);
        }

        self.audit.append(
            "loader",
            AuditEvent::ModuleLoaded {
                module_id: module_id.clone(),
                version: manifest.version.clone(),
                capabilities: granted.len(),
            },
        );
        info!(
            module = %module_id,
            version = %manifest.version,
            %pid,
            granted = granted.len(),
            denied_optional = denied_optional.len(),
            "module loaded"
        );

        Ok(LoadResult {
            module_id,
            pid,
            granted,
            denied_optional,
        })
    }

    fn grant_all(&self, manifest: &ModuleManifest) -> Result<(Vec<CapabilityToken>, Vec<String>)> {
        let module_id = &manifest.module_id;
        let mut granted = Vec::new();
        let mut denied_optional = Vec::new();

        for request in &manifest.required_capabilities {
            let decision = self.config.grant_policy.evaluate(request).and_then(|()| {
                self.caps
                    .issue(
                        CapabilitySpec::new(request.resource_type.clone(), &request.pattern, request.rights)
                            .owner(module_id.as_str()),
                    )
                    .map_err(|e| e.to_string())
            });
            match decision {
                Ok(token) => granted.push(token),
                Err(reason) if request.optional => {
                    debug!(module = %module_id, request = %request.describe(), %reason, "optional capability refused");
                    denied_optional.push(request.describe());
                }
                Err(reason) => {
                    warn!(module = %module_id, request = %request.describe(), %reason, "required capability refused");
                    self.rollback(module_id, None);
                    self.audit.append(
                        "loader",
                        AuditEvent::CapabilityDenied {
                            holder: module_id.clone(),
                            resource: request.resource_type.to_string(),
                            path: request.pattern.clone(),
                            reason: reason.clone(),
                        },
                    );
                    return Err(KernelError::SpawnPermissionDenied {
                        module_id: module_id.clone(),
                        request: request.describe(),
                        reason,
                    });
                }
            }
        }
        Ok((granted, denied_optional))
    }

    fn rollback(&self, module_id: &str, pid: Option<ProcessId>) {
        let revoked = self.caps.revoke_owner(module_id);
        if let Some(pid) = pid {
            let mut sched = self.sched();
            if let Err(err) = sched.kill(pid) {
                debug!(module = %module_id, %pid, error = %err, "rollback kill skipped");
            }
            sched.drain_exits();
            sched.reap(pid);
        }
        debug!(module = %module_id, revoked, "load rolled back");
    }

    /// Revoke the module's capabilities, close its mailbox and kill its
    /// process.
    pub fn unload(&self, module_id: &str) -> Result<LoadedModule> {
        let loaded = {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            let loaded = table
                .modules
                .remove(module_id)
                .ok_or_else(|| KernelError::ModuleNotFound(module_id.to_string()))?;
            table.by_pid.remove(&loaded.pid);
            loaded
        };

        let revoked = self.caps.revoke_owner(module_id);
        let discarded = self.router.close_mailbox(loaded.pid).unwrap_or(0);
        {
            let mut sched = self.sched();
            // already Completed if it trapped and was never restarted
            if let Err(err) = sched.kill(loaded.pid) {
                debug!(module = %module_id, pid = %loaded.pid, error = %err, "process already stopped");
            }
        }

        self.audit.append(
            "loader",
            AuditEvent::ModuleUnloaded {
                module_id: module_id.to_string(),
                revoked,
            },
        );
        info!(module = %module_id, pid = %loaded.pid, revoked, discarded, "module unloaded");
        Ok(loaded)
    }

    /// Replace a module's behavior and manifest in place. Every required
    /// request of the new manifest must already be held; capabilities,
    /// process and mailbox are kept.
    pub fn hot_swap(&self, module_id: &str, manifest: ModuleManifest, behavior: ModuleBehavior) -> Result<()> {
        manifest.validate()?;
        if manifest.module_id != module_id {
            return Err(KernelError::InvalidManifest(format!(
                "hot swap of {} with manifest for {}",
                module_id, manifest.module_id
            )));
        }
        if behavior.module_type() != manifest.module_type {
            return Err(KernelError::InvalidManifest(format!(
                "{}: manifest declares {:?} but behavior is {:?}",
                module_id,
                manifest.module_type,
                behavior.module_type()
            )));
        }
        self.check_signature(&manifest)?;

        let tokens = self
            .get(module_id)
            .ok_or_else(|| KernelError::ModuleNotFound(module_id.to_string()))?
            .tokens;
        let now_held: Vec<Capability> = self
            .caps
            .list_for_owner(module_id)
            .into_iter()
            .filter(|c| tokens.iter().any(|t| t.id() == c.id) && !c.revoked)
            .collect();

        for request in manifest.required_capabilities.iter().filter(|r| !r.optional) {
            if !held_covers(&now_held, request) {
                warn!(module = %module_id, request = %request.describe(), "hot swap needs a new capability");
                return Err(KernelError::EscalationRejected {
                    module_id: module_id.to_string(),
                    request: request.describe(),
                });
            }
        }

        let from_version = {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            let entry = table
                .modules
                .get_mut(module_id)
                .ok_or_else(|| KernelError::ModuleNotFound(module_id.to_string()))?;
            let from = entry.manifest.version.clone();
            entry.manifest = manifest.clone();
            entry.behavior = Arc::new(behavior);
            from
        };

        self.audit.append(
            "loader",
            AuditEvent::ModuleSwapped {
                module_id: module_id.to_string(),
                from_version: from_version.clone(),
                to_version: manifest.version.clone(),
            },
        );
        info!(module = %module_id, from = %from_version, to = %manifest.version, "module hot-swapped");
        Ok(())
    }

    /// Give a module a fresh process under the same name. Returns the new
    /// pid.
    ///
    /// Level 1 hands the existing mailbox, queue included, to the new
    /// process. Level 2 empties the mailbox first. Level 3 and above also
    /// re-validate the manifest and replace its capabilities with a fresh
    /// grant.
    pub fn restart(&self, module_id: &str, level: u8) -> Result<ProcessId> {
        let loaded = self
            .get(module_id)
            .ok_or_else(|| KernelError::ModuleNotFound(module_id.to_string()))?;

        let mut tokens = loaded.tokens.clone();
        if level >= EscalationLevel::ReloadModule.level() {
            loaded.manifest.validate()?;
            self.check_signature(&loaded.manifest)?;
            let revoked = self.caps.revoke_owner(module_id);
            let (granted, denied_optional) = self.grant_all(&loaded.manifest)?;
            debug!(
                module = %module_id,
                revoked,
                granted = granted.len(),
                denied_optional = denied_optional.len(),
                "capabilities re-granted"
            );
            tokens = granted;
        }

        let limits = &loaded.manifest.resource_limits;
        let pid = {
            let mut sched = self.sched();
            if let Err(err) = sched.kill(loaded.pid) {
                debug!(module = %module_id, pid = %loaded.pid, error = %err, "old process already gone");
            }
            sched.reap(loaded.pid);
            let mut opts = SpawnOptions::new(module_id)
                .priority(loaded.manifest.priority)
                .mailbox_capacity(limits.max_mailbox_depth);
            if limits.max_execution_time_ms > 0 {
                opts = opts.budget_ms(limits.max_execution_time_ms);
            }
            sched.spawn(opts)
        };

        // L1 carries queued messages over; higher levels start empty
        let discarded = if level <= EscalationLevel::RestartWithState.level() {
            self.router.rebind_mailbox(loaded.pid, pid)?;
            0
        } else {
            let discarded = self.router.clear_mailbox(loaded.pid)?;
            self.router.rebind_mailbox(loaded.pid, pid)?;
            discarded
        };
        self.sched().make_ready(pid)?;

        {
            let mut table = self.table.write().unwrap_or_else(|e| e.into_inner());
            table.by_pid.remove(&loaded.pid);
            table.by_pid.insert(pid, module_id.to_string());
            if let Some(entry) = table.modules.get_mut(module_id) {
                entry.pid = pid;
                entry.tokens = tokens;
            }
        }

        self.audit.append(
            "loader",
            AuditEvent::ModuleRestarted {
                module_id: module_id.to_string(),
                level,
            },
        );
        info!(module = %module_id, old = %loaded.pid, new = %pid, level, discarded, "module restarted");
        Ok(pid)
    }

    pub fn get(&self, module_id: &str) -> Option<LoadedModule> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .modules
            .get(module_id)
            .cloned()
    }

    pub fn by_pid(&self, pid: ProcessId) -> Option<LoadedModule> {
        let table = self.table.read().unwrap_or_else(|e| e.into_inner());
        table
            .by_pid
            .get(&pid)
            .and_then(|id| table.modules.get(id))
            .cloned()
    }

    pub fn module_id_of(&self, pid: ProcessId) -> Option<String> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .by_pid
            .get(&pid)
            .cloned()
    }

    pub fn is_loaded(&self, module_id: &str) -> bool {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .modules
            .contains_key(module_id)
    }

    /// Loaded module ids, sorted.
    pub fn modules(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .modules
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

fn held_covers(held: &[Capability], request: &CapabilityRequest) -> bool {
    let Ok(wanted) = ResourcePattern::new(&request.pattern) else {
        return false;
    };
    held.iter().any(|cap| {
        cap.resource_type == request.resource_type
            && cap.pattern.covers(&wanted)
            && request.rights.is_subset_of(&cap.rights)
    })
}
