//! The capability engine: a single table of capabilities behind one lock.
//!
//! Capabilities live in an arena keyed by [`CapabilityId`]. Two indexes sit
//! next to it: parent → children (for cascading revocation) and owner →
//! capabilities (for unload). Every mutation, including the use counter bump
//! on a successful check, happens under the write guard.

use std::collections::HashMap;
use std::sync::RwLock;

use tracing::{debug, info, warn};

use capsule_kernel_core::{random_secret, Blake3Hash, SharedClock};

use crate::capability::{Capability, CapabilityId, CapabilityToken, Conditions};
use crate::error::{CapabilityError, Result};
use crate::pattern::ResourcePattern;
use crate::rights::{ResourceType, Rights};

/// Request for a fresh root capability.
#[derive(Debug, Clone)]
pub struct CapabilitySpec {
    pub owner: String,
    pub resource_type: ResourceType,
    pub pattern: String,
    pub rights: Rights,
    pub ttl_ms: Option<i64>,
    pub max_uses: Option<u64>,
}

impl CapabilitySpec {
    pub fn new(resource_type: ResourceType, pattern: impl Into<String>, rights: Rights) -> Self {
        Self {
            owner: String::new(),
            resource_type,
            pattern: pattern.into(),
            rights,
            ttl_ms: None,
            max_uses: None,
        }
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn ttl_ms(mut self, ttl: i64) -> Self {
        self.ttl_ms = Some(ttl);
        self
    }

    pub fn max_uses(mut self, max: u64) -> Self {
        self.max_uses = Some(max);
        self
    }
}

/// Counters over the capability table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapabilityStats {
    pub total: usize,
    pub active: usize,
    pub revoked: usize,
    pub expired: usize,
    pub delegated: usize,
}

#[derive(Default)]
struct EngineInner {
    next_id: u64,
    caps: HashMap<CapabilityId, Capability>,
    children: HashMap<CapabilityId, Vec<CapabilityId>>,
    by_owner: HashMap<String, Vec<CapabilityId>>,
}

impl EngineInner {
    fn allocate(&mut self) -> CapabilityId {
        self.next_id += 1;
        CapabilityId(self.next_id)
    }

    fn insert(&mut self, cap: Capability) {
        if let Some(parent) = cap.parent {
            self.children.entry(parent).or_default().push(cap.id);
        }
        self.by_owner.entry(cap.owner.clone()).or_default().push(cap.id);
        self.caps.insert(cap.id, cap);
    }

    /// Revoke `root` and everything delegated from it. Returns how many
    /// capabilities changed state.
    fn revoke_tree(&mut self, root: CapabilityId, now: i64) -> usize {
        let mut count = 0;
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(cap) = self.caps.get_mut(&id) {
                if !cap.revoked {
                    cap.revoked = true;
                    cap.revoked_at = Some(now);
                    count += 1;
                }
            }
            if let Some(kids) = self.children.get(&id) {
                stack.extend(kids.iter().copied());
            }
        }
        count
    }

    fn remove(&mut self, id: CapabilityId) {
        if let Some(cap) = self.caps.remove(&id) {
            if let Some(ids) = self.by_owner.get_mut(&cap.owner) {
                ids.retain(|c| *c != id);
                if ids.is_empty() {
                    self.by_owner.remove(&cap.owner);
                }
            }
            if let Some(parent) = cap.parent {
                if let Some(kids) = self.children.get_mut(&parent) {
                    kids.retain(|c| *c != id);
                }
            }
        }
    }
}

/// Issues, checks, delegates and revokes capabilities.
pub struct CapabilityEngine {
    secret: [u8; 32],
    clock: SharedClock,
    inner: RwLock<EngineInner>,
}

impl CapabilityEngine {
    /// Create an engine with a random token secret.
    pub fn new(clock: SharedClock) -> Self {
        Self::with_secret(random_secret(), clock)
    }

    /// Create an engine with a fixed token secret.
    pub fn with_secret(secret: [u8; 32], clock: SharedClock) -> Self {
        Self {
            secret,
            clock,
            inner: RwLock::new(EngineInner::default()),
        }
    }

    fn tag_for(&self, id: CapabilityId) -> Blake3Hash {
        let mut msg = [0u8; 12];
        msg[..4].copy_from_slice(b"cap:");
        msg[4..].copy_from_slice(&id.0.to_le_bytes());
        Blake3Hash::keyed(&self.secret, &msg)
    }

    fn token_for(&self, id: CapabilityId) -> CapabilityToken {
        CapabilityToken::new(id, self.tag_for(id))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EngineInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EngineInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a root capability.
    pub fn issue(&self, spec: CapabilitySpec) -> Result<CapabilityToken> {
        let pattern = ResourcePattern::new(&spec.pattern)?;
        let now = self.clock.now_millis();

        let mut inner = self.write();
        let id = inner.allocate();
        inner.insert(Capability {
            id,
            owner: spec.owner.clone(),
            resource_type: spec.resource_type.clone(),
            pattern,
            rights: spec.rights,
            conditions: Conditions {
                expires_at: spec.ttl_ms.map(|ttl| now.saturating_add(ttl)),
                max_uses: spec.max_uses,
            },
            use_count: 0,
            parent: None,
            issued_at: now,
            revoked: false,
            revoked_at: None,
        });
        drop(inner);

        debug!(
            cap = %id,
            owner = %spec.owner,
            resource = %spec.resource_type,
            pattern = %spec.pattern,
            rights = %spec.rights,
            "capability issued"
        );
        Ok(self.token_for(id))
    }

    /// Check a token against a request and consume one use on success.
    ///
    /// Checks run in a fixed order and fail closed: token, existence,
    /// revocation, resource type, pattern, rights, expiry, use limit.
    pub fn check(
        &self,
        token: &CapabilityToken,
        resource_type: &ResourceType,
        path: &str,
        required: Rights,
    ) -> Result<Capability> {
        let result = self.check_inner(token, resource_type, path, required);
        if let Err(ref err) = result {
            debug!(
                cap = %token.id(),
                resource = %resource_type,
                path,
                reason = err.reason_code(),
                "capability check denied"
            );
        }
        result
    }

    fn check_inner(
        &self,
        token: &CapabilityToken,
        resource_type: &ResourceType,
        path: &str,
        required: Rights,
    ) -> Result<Capability> {
        if !self.tag_for(token.id()).ct_eq(token.tag()) {
            return Err(CapabilityError::InvalidToken);
        }
        let now = self.clock.now_millis();

        let mut inner = self.write();
        let cap = inner
            .caps
            .get(&token.id())
            .ok_or(CapabilityError::NotFound(token.id()))?;

        if cap.revoked {
            return Err(CapabilityError::Revoked(cap.id));
        }
        if &cap.resource_type != resource_type {
            return Err(CapabilityError::ResourceTypeMismatch {
                held: cap.resource_type.clone(),
                requested: resource_type.clone(),
            });
        }
        if !cap.pattern.matches(path) {
            return Err(CapabilityError::PatternMismatch {
                pattern: cap.pattern.to_string(),
                path: path.to_string(),
            });
        }
        if !required.is_subset_of(&cap.rights) {
            return Err(CapabilityError::InsufficientRights {
                required,
                held: cap.rights,
            });
        }
        if cap.conditions.is_expired(now) {
            return Err(CapabilityError::Expired(cap.id));
        }
        if cap.conditions.is_exhausted(cap.use_count) {
            return Err(CapabilityError::UsageLimitExceeded(cap.id));
        }

        // a delegated use also spends every ancestor's budget
        let mut chain = vec![cap.id];
        let mut next = cap.parent;
        while let Some(id) = next {
            let ancestor = inner.caps.get(&id).ok_or(CapabilityError::NotFound(id))?;
            if ancestor.revoked {
                return Err(CapabilityError::Revoked(id));
            }
            if ancestor.conditions.is_expired(now) {
                return Err(CapabilityError::Expired(id));
            }
            if ancestor.conditions.is_exhausted(ancestor.use_count) {
                return Err(CapabilityError::UsageLimitExceeded(id));
            }
            chain.push(id);
            next = ancestor.parent;
        }

        for id in &chain {
            if let Some(c) = inner.caps.get_mut(id) {
                c.use_count += 1;
            }
        }
        inner
            .caps
            .get(&token.id())
            .cloned()
            .ok_or(CapabilityError::NotFound(token.id()))
    }

    /// Boolean form of [`check`](Self::check).
    pub fn validate(
        &self,
        token: &CapabilityToken,
        resource_type: &ResourceType,
        path: &str,
        required: Rights,
    ) -> bool {
        self.check(token, resource_type, path, required).is_ok()
    }

    /// Derive a narrower capability for another holder.
    ///
    /// The child's rights must be a subset of the parent's and its expiry is
    /// the earlier of the parent's and `ttl_ms`. Its use limit is what the
    /// parent has left, and each of its uses is charged to the parent too.
    pub fn delegate(
        &self,
        token: &CapabilityToken,
        rights: Rights,
        owner: impl Into<String>,
        ttl_ms: Option<i64>,
    ) -> Result<CapabilityToken> {
        if !self.tag_for(token.id()).ct_eq(token.tag()) {
            return Err(CapabilityError::InvalidToken);
        }
        let owner = owner.into();
        let now = self.clock.now_millis();

        let mut inner = self.write();
        let parent = inner
            .caps
            .get(&token.id())
            .ok_or(CapabilityError::NotFound(token.id()))?
            .clone();

        if parent.revoked {
            return Err(CapabilityError::Revoked(parent.id));
        }
        if parent.conditions.is_expired(now) {
            return Err(CapabilityError::Expired(parent.id));
        }
        if parent.conditions.is_exhausted(parent.use_count) {
            return Err(CapabilityError::UsageLimitExceeded(parent.id));
        }
        if !parent.rights.delegate {
            return Err(CapabilityError::DelegationNotPermitted(parent.id));
        }
        if !rights.is_subset_of(&parent.rights) {
            return Err(CapabilityError::DelegationExceedsGrant {
                excess: rights.missing_from(&parent.rights),
            });
        }

        let requested = Conditions {
            expires_at: ttl_ms.map(|ttl| now.saturating_add(ttl)),
            max_uses: parent
                .conditions
                .max_uses
                .map(|max| max.saturating_sub(parent.use_count)),
        };
        let id = inner.allocate();
        inner.insert(Capability {
            id,
            owner: owner.clone(),
            resource_type: parent.resource_type.clone(),
            pattern: parent.pattern.clone(),
            rights,
            conditions: requested.narrowed_by(&parent.conditions),
            use_count: 0,
            parent: Some(parent.id),
            issued_at: now,
            revoked: false,
            revoked_at: None,
        });
        drop(inner);

        debug!(parent = %parent.id, child = %id, owner = %owner, rights = %rights, "capability delegated");
        Ok(self.token_for(id))
    }

    /// Revoke a capability and all its descendants.
    pub fn revoke(&self, id: CapabilityId) -> usize {
        let now = self.clock.now_millis();
        let count = self.write().revoke_tree(id, now);
        if count > 0 {
            info!(cap = %id, revoked = count, "capability revoked");
        }
        count
    }

    /// Revoke everything held by `owner`, cascading into delegations.
    pub fn revoke_owner(&self, owner: &str) -> usize {
        let now = self.clock.now_millis();
        let mut inner = self.write();
        let ids = inner.by_owner.get(owner).cloned().unwrap_or_default();
        let count: usize = ids.into_iter().map(|id| inner.revoke_tree(id, now)).sum();
        drop(inner);
        if count > 0 {
            info!(owner, revoked = count, "owner capabilities revoked");
        }
        count
    }

    /// Copy of a capability record.
    pub fn snapshot(&self, id: CapabilityId) -> Option<Capability> {
        self.read().caps.get(&id).cloned()
    }

    /// Capabilities held by `owner`, in issue order.
    pub fn list_for_owner(&self, owner: &str) -> Vec<Capability> {
        let inner = self.read();
        inner
            .by_owner
            .get(owner)
            .map(|ids| ids.iter().filter_map(|id| inner.caps.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// A live token for `id`, if the capability exists. Lets the kernel hand
    /// a module back the tokens it already holds.
    pub fn token(&self, id: CapabilityId) -> Option<CapabilityToken> {
        self.read().caps.contains_key(&id).then(|| self.token_for(id))
    }

    pub fn stats(&self) -> CapabilityStats {
        let now = self.clock.now_millis();
        let inner = self.read();
        let mut stats = CapabilityStats {
            total: inner.caps.len(),
            ..Default::default()
        };
        for cap in inner.caps.values() {
            if cap.revoked {
                stats.revoked += 1;
            } else if cap.conditions.is_expired(now) {
                stats.expired += 1;
            } else if cap.is_active(now) {
                stats.active += 1;
            }
            if cap.is_delegated() {
                stats.delegated += 1;
            }
        }
        stats
    }

    /// Drop expired or revoked capabilities that have no live descendants.
    /// Returns how many records were removed.
    pub fn sweep_expired(&self, now: i64) -> usize {
        let mut inner = self.write();
        let dead: Vec<CapabilityId> = inner
            .caps
            .values()
            .filter(|c| c.revoked || c.conditions.is_expired(now))
            .filter(|c| {
                inner
                    .children
                    .get(&c.id)
                    .map_or(true, |kids| kids.is_empty())
            })
            .map(|c| c.id)
            .collect();
        for id in &dead {
            inner.remove(*id);
            inner.children.remove(id);
        }
        drop(inner);
        if !dead.is_empty() {
            warn!(removed = dead.len(), "swept dead capabilities");
        }
        dead.len()
    }
}

impl std::fmt::Debug for CapabilityEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityEngine")
            .field("capabilities", &self.read().caps.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capsule_kernel_core::{Clock, ManualClock};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn engine() -> (CapabilityEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        (CapabilityEngine::with_secret([7u8; 32], clock.clone()), clock)
    }

    fn accrual(engine: &CapabilityEngine, rights: Rights) -> CapabilityToken {
        engine
            .issue(CapabilitySpec::new(ResourceType::Channel, "accrual.*", rights).owner("rules"))
            .unwrap()
    }

    #[test]
    fn test_accrual_channel_scenario() {
        let (engine, _) = engine();
        let token = accrual(&engine, Rights::read_write());
        assert!(engine.validate(&token, &ResourceType::Channel, "accrual.calculate", Rights::read_only()));
        assert!(!engine.validate(&token, &ResourceType::Channel, "compliance.check", Rights::read_only()));
    }

    #[test]
    fn test_exhausted_parent_cannot_delegate() {
        let (engine, _) = engine();
        let parent = engine
            .issue(CapabilitySpec::new(ResourceType::Channel, "accrual.*", Rights::full()).max_uses(1))
            .unwrap();
        assert!(engine.validate(&parent, &ResourceType::Channel, "accrual.calculate", Rights::read_only()));
        assert!(!engine.validate(&parent, &ResourceType::Channel, "accrual.calculate", Rights::read_only()));

        assert_eq!(
            engine.delegate(&parent, Rights::read_only(), "helper", None),
            Err(CapabilityError::UsageLimitExceeded(parent.id()))
        );
    }

    #[test]
    fn test_delegation_shares_parent_use_budget() {
        let (engine, _) = engine();
        let parent = engine
            .issue(CapabilitySpec::new(ResourceType::Channel, "accrual.*", Rights::full()).max_uses(3))
            .unwrap();
        assert!(engine.validate(&parent, &ResourceType::Channel, "accrual.calculate", Rights::read_only()));

        let a = engine.delegate(&parent, Rights::read_only(), "a", None).unwrap();
        let b = engine.delegate(&parent, Rights::read_only(), "b", None).unwrap();
        assert_eq!(engine.snapshot(a.id()).unwrap().conditions.max_uses, Some(2));

        let uses = [&a, &b, &a, &b, &parent]
            .iter()
            .filter(|t| engine.validate(t, &ResourceType::Channel, "accrual.calculate", Rights::read_only()))
            .count();
        assert_eq!(uses, 2);
        assert_eq!(engine.snapshot(parent.id()).unwrap().use_count, 3);
    }

    #[test]
    fn test_check_order_reports_first_failure() {
        let (engine, _) = engine();
        let token = accrual(&engine, Rights::read_only());

        let err = engine
            .check(&token, &ResourceType::Mailbox, "compliance.check", Rights::full())
            .unwrap_err();
        assert!(matches!(err, CapabilityError::ResourceTypeMismatch { .. }));

        let err = engine
            .check(&token, &ResourceType::Channel, "compliance.check", Rights::full())
            .unwrap_err();
        assert!(matches!(err, CapabilityError::PatternMismatch { .. }));

        let err = engine
            .check(&token, &ResourceType::Channel, "accrual.x", Rights::read_write())
            .unwrap_err();
        assert_eq!(
            err,
            CapabilityError::InsufficientRights {
                required: Rights::read_write(),
                held: Rights::read_only(),
            }
        );
    }

    #[test]
    fn test_forged_token_rejected() {
        let (engine, _) = engine();
        let token = accrual(&engine, Rights::full());
        let forged = CapabilityToken::forged(token.id());
        assert_eq!(
            engine.check(&forged, &ResourceType::Channel, "accrual.x", Rights::read_only()),
            Err(CapabilityError::InvalidToken)
        );

        let other = CapabilityEngine::with_secret([8u8; 32], Arc::new(ManualClock::new(0)));
        let foreign = other
            .issue(CapabilitySpec::new(ResourceType::Channel, "*", Rights::full()))
            .unwrap();
        assert!(!engine.validate(&foreign, &ResourceType::Channel, "accrual.x", Rights::NONE));
    }

    #[test]
    fn test_expiry() {
        let (engine, clock) = engine();
        let token = engine
            .issue(CapabilitySpec::new(ResourceType::Clock, "*", Rights::read_only()).ttl_ms(500))
            .unwrap();
        assert!(engine.validate(&token, &ResourceType::Clock, "now", Rights::read_only()));
        clock.advance(500);
        assert_eq!(
            engine.check(&token, &ResourceType::Clock, "now", Rights::read_only()),
            Err(CapabilityError::Expired(token.id()))
        );
    }

    #[test]
    fn test_use_limit() {
        let (engine, _) = engine();
        let token = engine
            .issue(CapabilitySpec::new(ResourceType::Storage, "emp-*", Rights::read_only()).max_uses(2))
            .unwrap();
        assert!(engine.validate(&token, &ResourceType::Storage, "emp-1", Rights::read_only()));
        assert!(engine.validate(&token, &ResourceType::Storage, "emp-2", Rights::read_only()));
        assert_eq!(
            engine.check(&token, &ResourceType::Storage, "emp-3", Rights::read_only()),
            Err(CapabilityError::UsageLimitExceeded(token.id()))
        );
        assert_eq!(engine.snapshot(token.id()).unwrap().use_count, 2);
    }

    #[test]
    fn test_failed_check_does_not_consume_use() {
        let (engine, _) = engine();
        let token = engine
            .issue(CapabilitySpec::new(ResourceType::Storage, "emp-*", Rights::read_only()).max_uses(1))
            .unwrap();
        assert!(!engine.validate(&token, &ResourceType::Storage, "other", Rights::read_only()));
        assert!(engine.validate(&token, &ResourceType::Storage, "emp-1", Rights::read_only()));
    }

    #[test]
    fn test_delegation_subset() {
        let (engine, _) = engine();
        let parent = accrual(&engine, Rights::read_only().with(crate::Right::Delegate));

        let child = engine.delegate(&parent, Rights::read_only(), "relay", None).unwrap();
        assert!(engine.validate(&child, &ResourceType::Channel, "accrual.calculate", Rights::read_only()));

        let err = engine.delegate(&parent, Rights::read_write(), "relay", None).unwrap_err();
        assert_eq!(
            err,
            CapabilityError::DelegationExceedsGrant {
                excess: Rights::write_only()
            }
        );
    }

    #[test]
    fn test_delegation_requires_delegate_right() {
        let (engine, _) = engine();
        let parent = accrual(&engine, Rights::read_write());
        assert_eq!(
            engine.delegate(&parent, Rights::read_only(), "relay", None),
            Err(CapabilityError::DelegationNotPermitted(parent.id()))
        );
    }

    #[test]
    fn test_delegation_narrows_conditions() {
        let (engine, _) = engine();
        let parent = engine
            .issue(
                CapabilitySpec::new(ResourceType::Channel, "accrual.*", Rights::full())
                    .ttl_ms(100)
                    .max_uses(5),
            )
            .unwrap();
        let child = engine.delegate(&parent, Rights::read_only(), "relay", Some(10_000)).unwrap();
        let snap = engine.snapshot(child.id()).unwrap();
        assert_eq!(snap.conditions.expires_at, Some(1_100));
        assert_eq!(snap.conditions.max_uses, Some(5));
        assert_eq!(snap.parent, Some(parent.id()));
    }

    #[test]
    fn test_cascading_revoke() {
        let (engine, _) = engine();
        let root = accrual(&engine, Rights::full());
        let mid = engine.delegate(&root, Rights::full(), "a", None).unwrap();
        let leaf = engine.delegate(&mid, Rights::read_only(), "b", None).unwrap();
        let sibling = accrual(&engine, Rights::read_only());

        assert_eq!(engine.revoke(root.id()), 3);
        for token in [&root, &mid, &leaf] {
            assert_eq!(
                engine.check(token, &ResourceType::Channel, "accrual.x", Rights::NONE),
                Err(CapabilityError::Revoked(token.id()))
            );
        }
        assert!(engine.validate(&sibling, &ResourceType::Channel, "accrual.x", Rights::read_only()));
        assert_eq!(engine.revoke(root.id()), 0);
    }

    #[test]
    fn test_revoke_owner_and_listing() {
        let (engine, _) = engine();
        engine
            .issue(CapabilitySpec::new(ResourceType::Clock, "*", Rights::read_only()).owner("m1"))
            .unwrap();
        engine
            .issue(CapabilitySpec::new(ResourceType::Storage, "*", Rights::read_only()).owner("m1"))
            .unwrap();
        engine
            .issue(CapabilitySpec::new(ResourceType::Storage, "*", Rights::read_only()).owner("m2"))
            .unwrap();
        assert_eq!(engine.list_for_owner("m1").len(), 2);
        assert_eq!(engine.revoke_owner("m1"), 2);
        let stats = engine.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.revoked, 2);
        assert_eq!(stats.active, 1);
    }

    #[test]
    fn test_sweep_keeps_parents_of_live_children() {
        let (engine, clock) = engine();
        let short = engine
            .issue(CapabilitySpec::new(ResourceType::Clock, "*", Rights::read_only()).ttl_ms(10))
            .unwrap();
        let root = accrual(&engine, Rights::full());
        let child = engine.delegate(&root, Rights::read_only(), "x", None).unwrap();
        engine.revoke(child.id());
        clock.advance(20);

        assert_eq!(engine.sweep_expired(clock.now_millis()), 2);
        assert!(engine.snapshot(short.id()).is_none());
        assert!(engine.snapshot(child.id()).is_none());
        assert!(engine.snapshot(root.id()).is_some());
    }

    fn arb_rights() -> impl Strategy<Value = Rights> {
        (any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
            |(read, write, execute, delegate, revoke)| Rights {
                read,
                write,
                execute,
                delegate,
                revoke,
            },
        )
    }

    proptest! {
        #[test]
        fn prop_validate_implies_grant_covers(
            held in arb_rights(),
            required in arb_rights(),
            suffix in "[a-z]{0,8}",
            other in "[a-z]{1,8}\\.[a-z]{0,8}",
        ) {
            let (engine, _) = engine();
            let token = accrual(&engine, held);
            for path in [format!("accrual.{}", suffix), other] {
                if engine.validate(&token, &ResourceType::Channel, &path, required) {
                    prop_assert!(path.starts_with("accrual."));
                    prop_assert!(required.is_subset_of(&held));
                }
            }
        }

        #[test]
        fn prop_delegated_rights_within_parent(parent in arb_rights(), asked in arb_rights()) {
            let (engine, _) = engine();
            let token = accrual(&engine, parent);
            match engine.delegate(&token, asked, "child", None) {
                Ok(child) => {
                    let snap = engine.snapshot(child.id()).unwrap();
                    prop_assert!(snap.rights.is_subset_of(&parent));
                }
                Err(CapabilityError::DelegationNotPermitted(_)) => prop_assert!(!parent.delegate),
                Err(CapabilityError::DelegationExceedsGrant { .. }) => {
                    prop_assert!(!asked.is_subset_of(&parent))
                }
                Err(e) => prop_assert!(false, "unexpected error {:?}", e),
            }
        }

        #[test]
        fn prop_delegation_tree_never_exceeds_root_limit(
            max_uses in 1u64..6,
            // (delegate from holder index, or use holder index)
            ops in prop::collection::vec((any::<bool>(), 0usize..8), 1..40),
        ) {
            let (engine, _) = engine();
            let root = engine
                .issue(CapabilitySpec::new(ResourceType::Channel, "accrual.*", Rights::full()).max_uses(max_uses))
                .unwrap();
            let mut holders = vec![root];
            let mut successes = 0u64;

            for (delegate, pick) in ops {
                let token = holders[pick % holders.len()];
                if delegate {
                    if let Ok(child) = engine.delegate(&token, Rights::full(), "child", None) {
                        holders.push(child);
                    }
                } else if engine.validate(&token, &ResourceType::Channel, "accrual.calculate", Rights::read_only()) {
                    successes += 1;
                }
            }
            prop_assert!(successes <= max_uses);
        }
    }
}
