//! # Capsule Kernel Capabilities
//!
//! Unforgeable, attenuable access tokens. Every resource a module touches
//! (channels, mailboxes, storage, the network, the clock, the audit log) is
//! guarded by a capability issued from a [`CapabilityEngine`].
//!
//! ## Model
//!
//! - A capability names a resource type, a glob pattern over resource
//!   paths, a set of [`Rights`], and optional expiry and use limits.
//! - Holders get a [`CapabilityToken`]; the engine keeps the record.
//! - Delegation creates a child with a subset of the parent's rights.
//!   Revoking a parent revokes every descendant.

pub mod capability;
pub mod engine;
pub mod error;
pub mod pattern;
pub mod rights;

pub use capability::{Capability, CapabilityId, CapabilityToken, Conditions};
pub use engine::{CapabilityEngine, CapabilitySpec, CapabilityStats};
pub use error::{CapabilityError, Result};
pub use pattern::ResourcePattern;
pub use rights::{ResourceType, Right, Rights};
