//! Kernel configuration, loaded from TOML. Every section and field is
//! optional; missing values take their defaults.

use std::path::Path;

use serde::{Deserialize, Serialize};

use capsule_kernel_ipc::OverflowPolicy;
use capsule_kernel_sched::SchedulerConfig;

use crate::audit::AuditConfig;
use crate::drift::DriftConfig;
use crate::error::{KernelError, Result};
use crate::loader::LoaderConfig;
use crate::supervisor::ChildSpec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    /// Capacity of host client mailboxes.
    pub default_mailbox_capacity: usize,
    /// Used when a manifest names no overflow policy.
    pub default_overflow_policy: OverflowPolicy,
    /// How long a `BlockSender` send waits for room.
    pub block_send_timeout_ms: u64,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            default_mailbox_capacity: 64,
            default_overflow_policy: OverflowPolicy::BlockSender,
            block_send_timeout_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub scheduler: SchedulerConfig,
    pub ipc: IpcConfig,
    pub supervisor: ChildSpec,
    pub drift: DriftConfig,
    pub audit: AuditConfig,
    pub loader: LoaderConfig,
}

impl KernelConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| KernelError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).map_err(|e| KernelError::Config(e.to_string()))
    }
}
