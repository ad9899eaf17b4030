//! Capability records and the unforgeable tokens that name them.

use std::fmt;

use serde::{Deserialize, Serialize};

use capsule_kernel_core::Blake3Hash;

use crate::pattern::ResourcePattern;
use crate::rights::{ResourceType, Rights};

/// Engine-assigned capability identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CapabilityId(pub u64);

impl fmt::Display for CapabilityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cap#{}", self.0)
    }
}

/// What a holder presents to exercise a capability.
///
/// The tag is a keyed Blake3 MAC over the id, so a token can only come from
/// the engine that issued it.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CapabilityToken {
    id: CapabilityId,
    tag: Blake3Hash,
}

impl CapabilityToken {
    pub(crate) fn new(id: CapabilityId, tag: Blake3Hash) -> Self {
        Self { id, tag }
    }

    pub fn id(&self) -> CapabilityId {
        self.id
    }

    pub(crate) fn tag(&self) -> &Blake3Hash {
        &self.tag
    }

    /// A token with the same id and a garbage tag. Only useful in tests.
    #[doc(hidden)]
    pub fn forged(id: CapabilityId) -> Self {
        Self {
            id,
            tag: Blake3Hash::ZERO,
        }
    }
}

impl fmt::Debug for CapabilityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityToken")
            .field("id", &self.id)
            .field("tag", &"<redacted>")
            .finish()
    }
}

/// Limits on a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conditions {
    /// Expiry instant (Unix ms), exclusive.
    pub expires_at: Option<i64>,
    /// Maximum number of successful checks. `None` is unlimited.
    pub max_uses: Option<u64>,
}

impl Conditions {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map_or(false, |exp| now >= exp)
    }

    pub fn is_exhausted(&self, uses: u64) -> bool {
        self.max_uses.map_or(false, |max| uses >= max)
    }

    pub fn is_valid(&self, now: i64, uses: u64) -> bool {
        !self.is_expired(now) && !self.is_exhausted(uses)
    }

    /// Combine with a parent's conditions: earliest expiry, smallest limit.
    pub fn narrowed_by(&self, parent: &Conditions) -> Conditions {
        Conditions {
            expires_at: min_opt(self.expires_at, parent.expires_at),
            max_uses: min_opt(self.max_uses, parent.max_uses),
        }
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// A capability as held in the engine's table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub id: CapabilityId,
    /// Holder (usually a module id).
    pub owner: String,
    pub resource_type: ResourceType,
    pub pattern: ResourcePattern,
    pub rights: Rights,
    pub conditions: Conditions,
    pub use_count: u64,
    /// Capability this one was delegated from.
    pub parent: Option<CapabilityId>,
    pub issued_at: i64,
    pub revoked: bool,
    pub revoked_at: Option<i64>,
}

impl Capability {
    pub fn is_active(&self, now: i64) -> bool {
        !self.revoked && self.conditions.is_valid(now, self.use_count)
    }

    pub fn is_delegated(&self) -> bool {
        self.parent.is_some()
    }

    /// Does this capability cover the request, ignoring liveness?
    pub fn covers(&self, resource_type: &ResourceType, path: &str, rights: &Rights) -> bool {
        &self.resource_type == resource_type && self.pattern.matches(path) && rights.is_subset_of(&self.rights)
    }
}
