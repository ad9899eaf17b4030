//! Database schema migrations for SQLite.
//!
//! Each migration transforms the schema from version N to N+1 and runs in
//! the same transaction as its `schema_migrations` row.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection, now: i64) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;
        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now],
            )?;
        }
        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: capsule ledger.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE capsules (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,  -- insertion order
            capsule_id BLOB NOT NULL UNIQUE,        -- 32 bytes, Blake3
            subject_id TEXT NOT NULL,
            dimension TEXT NOT NULL,
            calculated_at INTEGER NOT NULL,         -- Unix ms
            effective_date INTEGER NOT NULL,        -- Unix ms
            ruleset_version TEXT NOT NULL,
            proof_id BLOB NOT NULL,                 -- 32 bytes, seal digest
            proof TEXT NOT NULL,                    -- sealed proof object, JSON
            supersedes BLOB,                        -- 32 bytes, nullable
            superseded_by BLOB,                     -- 32 bytes, nullable
            is_active INTEGER NOT NULL
        );

        -- One active capsule per key, enforced by the database.
        CREATE UNIQUE INDEX idx_capsules_single_active
            ON capsules(subject_id, dimension) WHERE is_active = 1;

        CREATE INDEX idx_capsules_key ON capsules(subject_id, dimension, seq);
        CREATE INDEX idx_capsules_proof ON capsules(proof_id);
        "#,
    )?;
    Ok(())
}
