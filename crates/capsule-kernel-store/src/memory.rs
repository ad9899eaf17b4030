//! In-memory implementation of the CapsuleStore trait.
//!
//! Same semantics as SQLite, no persistence. Thread-safe via RwLock.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use capsule_kernel_core::{CapsuleId, ProofObject, TimeCapsule};

use crate::error::{Result, StoreError};
use crate::traits::CapsuleStore;

type Key = (String, String);

/// In-memory capsule store.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    capsules: HashMap<CapsuleId, TimeCapsule>,
    /// Key -> capsule ids in insertion order.
    timelines: HashMap<Key, Vec<CapsuleId>>,
    /// Key -> active capsule id.
    active: HashMap<Key, CapsuleId>,
    /// Subject -> dimensions in first-seen order.
    dimensions: HashMap<String, Vec<String>>,
}

impl MemoryStoreInner {
    fn insert(&mut self, capsule: TimeCapsule) {
        let key = (capsule.subject_id.clone(), capsule.dimension.clone());
        let dims = self.dimensions.entry(capsule.subject_id.clone()).or_default();
        if !dims.contains(&capsule.dimension) {
            dims.push(capsule.dimension.clone());
        }
        if capsule.is_active {
            self.active.insert(key.clone(), capsule.id);
        }
        self.timelines.entry(key).or_default().push(capsule.id);
        self.capsules.insert(capsule.id, capsule);
    }

    fn timeline(&self, subject_id: &str, dimension: &str) -> Vec<TimeCapsule> {
        self.timelines
            .get(&(subject_id.to_string(), dimension.to_string()))
            .map(|ids| ids.iter().filter_map(|id| self.capsules.get(id).cloned()).collect())
            .unwrap_or_default()
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MemoryStoreInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, MemoryStoreInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CapsuleStore for MemoryStore {
    async fn store(&self, capsule: &TimeCapsule) -> Result<()> {
        capsule.verify()?;
        let mut inner = self.write();
        if inner.capsules.contains_key(&capsule.id) {
            return Err(StoreError::Duplicate(capsule.id));
        }
        if capsule.is_active {
            let key = (capsule.subject_id.clone(), capsule.dimension.clone());
            if let Some(active) = inner.active.get(&key) {
                return Err(StoreError::Conflict {
                    subject_id: capsule.subject_id.clone(),
                    dimension: capsule.dimension.clone(),
                    active: *active,
                });
            }
        }
        inner.insert(capsule.clone());
        debug!(capsule = %capsule.id, subject = %capsule.subject_id, dimension = %capsule.dimension, "capsule stored");
        Ok(())
    }

    async fn retrieve(&self, id: &CapsuleId) -> Result<Option<TimeCapsule>> {
        Ok(self.read().capsules.get(id).cloned())
    }

    async fn active(&self, subject_id: &str, dimension: &str) -> Result<Option<TimeCapsule>> {
        let inner = self.read();
        Ok(inner
            .active
            .get(&(subject_id.to_string(), dimension.to_string()))
            .and_then(|id| inner.capsules.get(id).cloned()))
    }

    async fn supersede(
        &self,
        old: &CapsuleId,
        proof: ProofObject,
        effective_date: i64,
        ruleset_version: &str,
    ) -> Result<TimeCapsule> {
        let mut inner = self.write();
        let previous = inner.capsules.get(old).cloned().ok_or(StoreError::NotFound(*old))?;
        if !previous.is_active {
            return Err(StoreError::AlreadySuperseded(*old));
        }

        let calculated_at = proof.timestamp();
        let next = previous.successor(proof, calculated_at, effective_date, ruleset_version)?;
        next.proof.verify_detailed()?;

        if let Some(prev) = inner.capsules.get_mut(old) {
            prev.is_active = false;
            prev.superseded_by = Some(next.id);
        }
        inner.insert(next.clone());
        debug!(old = %old, new = %next.id, "capsule superseded");
        Ok(next)
    }

    async fn timeline(&self, subject_id: &str, dimension: &str) -> Result<Vec<TimeCapsule>> {
        Ok(self.read().timeline(subject_id, dimension))
    }

    async fn subject_capsules(&self, subject_id: &str) -> Result<Vec<TimeCapsule>> {
        let inner = self.read();
        Ok(inner
            .dimensions
            .get(subject_id)
            .map(|dims| {
                dims.iter()
                    .flat_map(|d| inner.timeline(subject_id, d))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.read().capsules.len())
    }
}
