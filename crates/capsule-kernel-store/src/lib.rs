//! # Capsule Kernel Store
//!
//! Persistence for the time-capsule ledger.
//!
//! The [`CapsuleStore`] trait defines the interface. Two backends:
//!
//! - [`SqliteStore`]: rusqlite with bundled SQLite, async via
//!   `spawn_blocking`. A partial unique index keeps one active capsule per
//!   `(subject, dimension)`.
//! - [`MemoryStore`]: same semantics, in memory, for tests and embedding.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

#[cfg(test)]
mod conformance;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::CapsuleStore;
