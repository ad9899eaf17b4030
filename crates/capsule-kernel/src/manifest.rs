//! Module manifests.
//!
//! A manifest is JSON with camelCase keys. The optional `signature` is an
//! Ed25519 signature (hex) over the domain-separated canonical encoding of
//! the manifest with the signature field removed.

use serde::{Deserialize, Serialize};

use capsule_kernel_caps::{ResourcePattern, ResourceType, Rights};
use capsule_kernel_core::{canonical_json_bytes, Ed25519PublicKey, Ed25519Signature, Keypair};
use capsule_kernel_ipc::OverflowPolicy;
use capsule_kernel_sched::Priority;

use crate::error::{KernelError, Result};
use crate::syscall::SyscallKind;

const SIGN_DOMAIN: &[u8] = b"capsule-kernel/manifest/v1\0";

/// Closed set of module kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ModuleType {
    /// Runs a registered business rule on each request.
    Rule,
    /// Forwards every message to another mailbox.
    Relay,
    /// Writes every message to the audit log.
    Audit,
}

/// One capability a module asks for at load time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityRequest {
    pub resource_type: ResourceType,
    pub pattern: String,
    pub rights: Rights,
    pub justification: String,
    /// Optional requests may be refused without failing the load.
    #[serde(default)]
    pub optional: bool,
}

impl CapabilityRequest {
    pub fn new(resource_type: ResourceType, pattern: impl Into<String>, rights: Rights) -> Self {
        Self {
            resource_type,
            pattern: pattern.into(),
            rights,
            justification: String::new(),
            optional: false,
        }
    }

    pub fn justification(mut self, why: impl Into<String>) -> Self {
        self.justification = why.into();
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// `type:pattern:rights`, used in errors and audit entries.
    pub fn describe(&self) -> String {
        format!("{}:{}:{}", self.resource_type, self.pattern, self.rights)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    pub max_memory_bytes: u64,
    /// Total execution budget. Zero means unbounded.
    pub max_execution_time_ms: u64,
    pub max_mailbox_depth: usize,
    pub max_concurrent_requests: u32,
    pub cpu_quota_percent: u8,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: 16 * 1024 * 1024,
            max_execution_time_ms: 0,
            max_mailbox_depth: 64,
            max_concurrent_requests: 1,
            cpu_quota_percent: 100,
        }
    }
}

/// Declaration a module is loaded from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleManifest {
    pub module_id: String,
    pub module_type: ModuleType,
    pub version: String,
    #[serde(default)]
    pub required_capabilities: Vec<CapabilityRequest>,
    #[serde(default)]
    pub allowed_syscalls: Vec<SyscallKind>,
    #[serde(default)]
    pub resource_limits: ResourceLimits,
    #[serde(default)]
    pub priority: Priority,
    /// Falls back to the kernel's default policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overflow_policy: Option<OverflowPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl ModuleManifest {
    pub fn new(module_id: impl Into<String>, module_type: ModuleType, version: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            module_type,
            version: version.into(),
            required_capabilities: Vec::new(),
            allowed_syscalls: Vec::new(),
            resource_limits: ResourceLimits::default(),
            priority: Priority::Normal,
            overflow_policy: None,
            signature: None,
        }
    }

    pub fn capability(mut self, request: CapabilityRequest) -> Self {
        self.required_capabilities.push(request);
        self
    }

    pub fn syscall(mut self, kind: SyscallKind) -> Self {
        if !self.allowed_syscalls.contains(&kind) {
            self.allowed_syscalls.push(kind);
        }
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.overflow_policy = Some(policy);
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| KernelError::InvalidManifest(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| KernelError::InvalidManifest(e.to_string()))
    }

    /// Structural checks beyond what deserialization enforces.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(KernelError::InvalidManifest(msg));

        if self.module_id.is_empty()
            || !self
                .module_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return invalid(format!("bad module id {:?}", self.module_id));
        }
        if self.version.trim().is_empty() {
            return invalid(format!("{}: empty version", self.module_id));
        }
        for req in &self.required_capabilities {
            if ResourcePattern::new(&req.pattern).is_err() {
                return invalid(format!("{}: bad pattern {:?}", self.module_id, req.pattern));
            }
            if req.rights.is_empty() {
                return invalid(format!("{}: request {} grants nothing", self.module_id, req.describe()));
            }
            if req.justification.trim().is_empty() {
                return invalid(format!("{}: request {} lacks a justification", self.module_id, req.describe()));
            }
        }
        let limits = &self.resource_limits;
        if limits.max_mailbox_depth == 0 {
            return invalid(format!("{}: maxMailboxDepth must be positive", self.module_id));
        }
        if limits.max_concurrent_requests == 0 {
            return invalid(format!("{}: maxConcurrentRequests must be positive", self.module_id));
        }
        if limits.cpu_quota_percent == 0 || limits.cpu_quota_percent > 100 {
            return invalid(format!("{}: cpuQuotaPercent must be 1-100", self.module_id));
        }
        Ok(())
    }

    /// Bytes covered by the signature.
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let value = serde_json::to_value(&unsigned).map_err(|e| KernelError::InvalidManifest(e.to_string()))?;
        let mut out = SIGN_DOMAIN.to_vec();
        out.extend_from_slice(&canonical_json_bytes(&value)?);
        Ok(out)
    }

    /// Sign in place with `keypair`.
    pub fn sign(&mut self, keypair: &Keypair) -> Result<()> {
        let sig = keypair.sign(&self.signing_bytes()?);
        self.signature = Some(sig.to_hex());
        Ok(())
    }

    pub fn signed(mut self, keypair: &Keypair) -> Result<Self> {
        self.sign(keypair)?;
        Ok(self)
    }

    /// Check the signature against a trusted key.
    pub fn verify_signature(&self, key: &Ed25519PublicKey) -> Result<()> {
        let hex = self
            .signature
            .as_deref()
            .ok_or_else(|| KernelError::SignatureMissing(self.module_id.clone()))?;
        let sig = Ed25519Signature::from_hex(hex)
            .map_err(|_| KernelError::InvalidSignature(self.module_id.clone()))?;
        key.verify(&self.signing_bytes()?, &sig)
            .map_err(|_| KernelError::InvalidSignature(self.module_id.clone()))
    }
}
