//! Append-only, hash-chained kernel audit log.
//!
//! Each entry commits to the previous entry's hash, so removing, reordering
//! or editing any retained entry breaks the chain. The log is bounded: when
//! it is full the oldest entry is dropped and the chain is anchored at the
//! dropped entry's hash.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use capsule_kernel_core::{Blake3Hash, SharedClock};
use capsule_kernel_sched::TrapKind;

use crate::error::{KernelError, Result};

const GENESIS_DOMAIN: &[u8] = b"capsule-kernel/audit/genesis";
const ENTRY_DOMAIN: &str = "capsule-kernel/audit/entry";

/// Hash every chain starts from.
pub fn genesis_hash() -> Blake3Hash {
    Blake3Hash::hash(GENESIS_DOMAIN)
}

/// Something the kernel decided or observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    KernelStarted { version: String },
    KernelShutdown,
    ModuleLoaded { module_id: String, version: String, capabilities: usize },
    ModuleUnloaded { module_id: String, revoked: usize },
    ModuleSwapped { module_id: String, from_version: String, to_version: String },
    ModuleRestarted { module_id: String, level: u8 },
    CapabilityDenied { holder: String, resource: String, path: String, reason: String },
    SyscallDenied { module_id: String, syscall: String, reason: String },
    ProcessTrapped { module_id: String, trap: TrapKind },
    SupervisorDecision { module_id: String, action: String },
    DriftDetected { subject_id: String, dimension: String, category: String, severity: String },
    SubjectReleased { subject_id: String },
    /// Appended by a module through the `AuditAppend` syscall.
    Custom { category: String, message: String },
}

/// One link in the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: i64,
    pub source: String,
    pub event: AuditEvent,
    pub prev_hash: Blake3Hash,
    pub hash: Blake3Hash,
}

impl AuditEntry {
    fn compute_hash(
        sequence: u64,
        timestamp: i64,
        source: &str,
        event: &AuditEvent,
        prev_hash: &Blake3Hash,
    ) -> Blake3Hash {
        let mut data = Vec::with_capacity(128);
        data.extend_from_slice(prev_hash.as_bytes());
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&timestamp.to_le_bytes());
        data.extend_from_slice(&(source.len() as u64).to_le_bytes());
        data.extend_from_slice(source.as_bytes());
        data.extend_from_slice(&serde_json::to_vec(event).unwrap_or_default());
        Blake3Hash::hash_domain(ENTRY_DOMAIN, &data)
    }

    /// Whether the stored hash matches the entry's contents.
    pub fn verify(&self) -> bool {
        Self::compute_hash(self.sequence, self.timestamp, &self.source, &self.event, &self.prev_hash)
            .ct_eq(&self.hash)
    }
}

/// Audit log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Entries retained in memory.
    pub max_entries: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditStats {
    /// Entries ever appended.
    pub appended: u64,
    pub retained: usize,
    /// Entries dropped off the front.
    pub dropped: u64,
    pub head: Blake3Hash,
}

struct AuditInner {
    entries: VecDeque<AuditEntry>,
    next_sequence: u64,
    head: Blake3Hash,
    /// `prev_hash` of the oldest retained entry.
    anchor: Blake3Hash,
    dropped: u64,
}

/// The kernel audit log.
pub struct AuditLog {
    config: AuditConfig,
    clock: SharedClock,
    inner: Mutex<AuditInner>,
}

impl AuditLog {
    pub fn new(config: AuditConfig, clock: SharedClock) -> Self {
        let genesis = genesis_hash();
        Self {
            inner: Mutex::new(AuditInner {
                entries: VecDeque::with_capacity(config.max_entries.min(1024)),
                next_sequence: 1,
                head: genesis,
                anchor: genesis,
                dropped: 0,
            }),
            config,
            clock,
        }
    }

    fn lock(&self) -> MutexGuard<'_, AuditInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event. This is the only way entries are created.
    pub fn append(&self, source: impl Into<String>, event: AuditEvent) -> AuditEntry {
        let source = source.into();
        let timestamp = self.clock.now_millis();
        let mut inner = self.lock();

        let sequence = inner.next_sequence;
        let prev_hash = inner.head;
        let hash = AuditEntry::compute_hash(sequence, timestamp, &source, &event, &prev_hash);
        let entry = AuditEntry {
            sequence,
            timestamp,
            source,
            event,
            prev_hash,
            hash,
        };

        inner.next_sequence += 1;
        inner.head = hash;
        inner.entries.push_back(entry.clone());
        while inner.entries.len() > self.config.max_entries.max(1) {
            if let Some(oldest) = inner.entries.pop_front() {
                inner.anchor = oldest.hash;
                inner.dropped += 1;
            }
        }

        debug!(seq = sequence, source = %entry.source, "audit entry appended");
        entry
    }

    /// Re-hash every retained entry and check the links. Returns the number
    /// of entries verified.
    pub fn verify_chain(&self) -> Result<usize> {
        let inner = self.lock();
        let count = verify_entries(inner.entries.iter(), inner.anchor)?;
        if count > 0 && !inner.head.ct_eq(&inner.entries[count - 1].hash) {
            error!("audit head does not match last entry");
            return Err(KernelError::AuditChainBroken(inner.entries[count - 1].sequence));
        }
        Ok(count)
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.lock().entries.iter().cloned().collect()
    }

    pub fn entries_by_source(&self, source: &str) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.source == source)
            .cloned()
            .collect()
    }

    /// Entries with `from <= sequence <= to`.
    pub fn range(&self, from: u64, to: u64) -> Vec<AuditEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| e.sequence >= from && e.sequence <= to)
            .cloned()
            .collect()
    }

    pub fn last(&self) -> Option<AuditEntry> {
        self.lock().entries.back().cloned()
    }

    pub fn stats(&self) -> AuditStats {
        let inner = self.lock();
        AuditStats {
            appended: inner.next_sequence - 1,
            retained: inner.entries.len(),
            dropped: inner.dropped,
            head: inner.head,
        }
    }

    #[cfg(test)]
    fn tamper<F: FnOnce(&mut AuditEntry)>(&self, index: usize, f: F) {
        if let Some(entry) = self.lock().entries.get_mut(index) {
            f(entry);
        }
    }
}

/// Verify a run of exported entries starting from `anchor` (the genesis
/// hash for a complete log).
pub fn verify_entries<'a, I>(entries: I, anchor: Blake3Hash) -> Result<usize>
where
    I: IntoIterator<Item = &'a AuditEntry>,
{
    let mut prev = anchor;
    let mut prev_seq: Option<u64> = None;
    let mut count = 0;
    for entry in entries {
        let linked = entry.prev_hash.ct_eq(&prev);
        let ordered = prev_seq.map_or(true, |s| entry.sequence == s + 1);
        if !linked || !ordered || !entry.verify() {
            error!(seq = entry.sequence, "audit chain broken");
            return Err(KernelError::AuditChainBroken(entry.sequence));
        }
        prev = entry.hash;
        prev_seq = Some(entry.sequence);
        count += 1;
    }
    Ok(count)
}
