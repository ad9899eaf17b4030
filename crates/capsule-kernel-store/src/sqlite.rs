//! SQLite implementation of the CapsuleStore trait.
//!
//! This is the primary ledger backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via `tokio::task::spawn_blocking`. A partial
//! unique index enforces the single-active rule in the database itself.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use capsule_kernel_core::{CapsuleId, Clock, ProofObject, SystemClock, TimeCapsule};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::CapsuleStore;

const SELECT_COLUMNS: &str = "capsule_id, subject_id, dimension, calculated_at, effective_date, \
     ruleset_version, proof, supersedes, superseded_by, is_active";

/// SQLite-based capsule store.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path, creating and migrating it
    /// as needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn, SystemClock.now_millis())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn, SystemClock.now_millis())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut guard)
        })
        .await?
    }
}

fn id_from_blob(bytes: Vec<u8>, column: usize) -> rusqlite::Result<CapsuleId> {
    let arr: [u8; 32] = bytes.try_into().map_err(|_| {
        rusqlite::Error::InvalidColumnType(column, "capsule id".into(), rusqlite::types::Type::Blob)
    })?;
    Ok(CapsuleId::from_bytes(arr))
}

fn row_to_capsule(row: &Row<'_>) -> rusqlite::Result<TimeCapsule> {
    let proof_json: String = row.get(6)?;
    let proof: ProofObject = serde_json::from_str(&proof_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let supersedes: Option<Vec<u8>> = row.get(7)?;
    let superseded_by: Option<Vec<u8>> = row.get(8)?;

    Ok(TimeCapsule {
        id: id_from_blob(row.get(0)?, 0)?,
        subject_id: row.get(1)?,
        dimension: row.get(2)?,
        calculated_at: row.get(3)?,
        effective_date: row.get(4)?,
        ruleset_version: row.get(5)?,
        proof,
        supersedes: supersedes.map(|b| id_from_blob(b, 7)).transpose()?,
        superseded_by: superseded_by.map(|b| id_from_blob(b, 8)).transpose()?,
        is_active: row.get::<_, i64>(9)? != 0,
    })
}

fn insert_capsule(conn: &Connection, capsule: &TimeCapsule) -> Result<()> {
    let proof_json = serde_json::to_string(&capsule.proof)?;
    conn.execute(
        "INSERT INTO capsules (
            capsule_id, subject_id, dimension, calculated_at, effective_date,
            ruleset_version, proof_id, proof, supersedes, superseded_by, is_active
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            capsule.id.as_bytes().as_slice(),
            capsule.subject_id,
            capsule.dimension,
            capsule.calculated_at,
            capsule.effective_date,
            capsule.ruleset_version,
            capsule.proof.proof_id().as_bytes().as_slice(),
            proof_json,
            capsule.supersedes.map(|id| id.0.to_vec()),
            capsule.superseded_by.map(|id| id.0.to_vec()),
            capsule.is_active as i64,
        ],
    )?;
    Ok(())
}

fn select_by_id(conn: &Connection, id: &CapsuleId) -> Result<Option<TimeCapsule>> {
    let sql = format!("SELECT {} FROM capsules WHERE capsule_id = ?1", SELECT_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.as_bytes().as_slice()], row_to_capsule)
        .optional()?)
}

fn select_active(conn: &Connection, subject_id: &str, dimension: &str) -> Result<Option<TimeCapsule>> {
    let sql = format!(
        "SELECT {} FROM capsules WHERE subject_id = ?1 AND dimension = ?2 AND is_active = 1",
        SELECT_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![subject_id, dimension], row_to_capsule)
        .optional()?)
}

fn select_many(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<TimeCapsule>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, row_to_capsule)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[async_trait]
impl CapsuleStore for SqliteStore {
    async fn store(&self, capsule: &TimeCapsule) -> Result<()> {
        capsule.verify()?;
        let capsule = capsule.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            if select_by_id(&tx, &capsule.id)?.is_some() {
                return Err(StoreError::Duplicate(capsule.id));
            }
            if capsule.is_active {
                if let Some(active) = select_active(&tx, &capsule.subject_id, &capsule.dimension)? {
                    return Err(StoreError::Conflict {
                        subject_id: capsule.subject_id.clone(),
                        dimension: capsule.dimension.clone(),
                        active: active.id,
                    });
                }
            }
            insert_capsule(&tx, &capsule)?;
            tx.commit()?;
            debug!(capsule = %capsule.id, subject = %capsule.subject_id, dimension = %capsule.dimension, "capsule stored");
            Ok(())
        })
        .await
    }

    async fn retrieve(&self, id: &CapsuleId) -> Result<Option<TimeCapsule>> {
        let id = *id;
        self.blocking(move |conn| select_by_id(conn, &id)).await
    }

    async fn active(&self, subject_id: &str, dimension: &str) -> Result<Option<TimeCapsule>> {
        let (subject_id, dimension) = (subject_id.to_string(), dimension.to_string());
        self.blocking(move |conn| select_active(conn, &subject_id, &dimension))
            .await
    }

    async fn supersede(
        &self,
        old: &CapsuleId,
        proof: ProofObject,
        effective_date: i64,
        ruleset_version: &str,
    ) -> Result<TimeCapsule> {
        let old = *old;
        let ruleset_version = ruleset_version.to_string();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let previous = select_by_id(&tx, &old)?.ok_or(StoreError::NotFound(old))?;
            if !previous.is_active {
                return Err(StoreError::AlreadySuperseded(old));
            }

            let calculated_at = proof.timestamp();
            let next = previous.successor(proof, calculated_at, effective_date, ruleset_version)?;
            next.proof.verify_detailed()?;

            let updated = tx.execute(
                "UPDATE capsules SET is_active = 0, superseded_by = ?1
                 WHERE capsule_id = ?2 AND is_active = 1",
                params![next.id.as_bytes().as_slice(), old.as_bytes().as_slice()],
            )?;
            if updated != 1 {
                return Err(StoreError::AlreadySuperseded(old));
            }
            insert_capsule(&tx, &next)?;
            tx.commit()?;
            debug!(old = %old, new = %next.id, "capsule superseded");
            Ok(next)
        })
        .await
    }

    async fn timeline(&self, subject_id: &str, dimension: &str) -> Result<Vec<TimeCapsule>> {
        let (subject_id, dimension) = (subject_id.to_string(), dimension.to_string());
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {} FROM capsules WHERE subject_id = ?1 AND dimension = ?2 ORDER BY seq",
                SELECT_COLUMNS
            );
            select_many(conn, &sql, params![subject_id, dimension])
        })
        .await
    }

    async fn subject_capsules(&self, subject_id: &str) -> Result<Vec<TimeCapsule>> {
        let subject_id = subject_id.to_string();
        self.blocking(move |conn| {
            // dimensions in first-seen order, then each timeline in insertion order
            let sql = format!(
                "SELECT {cols} FROM capsules c
                 JOIN (SELECT dimension AS d, MIN(seq) AS first_seq FROM capsules
                       WHERE subject_id = ?1 GROUP BY dimension) f
                   ON c.dimension = f.d
                 WHERE c.subject_id = ?1
                 ORDER BY f.first_seq, c.seq",
                cols = SELECT_COLUMNS
                    .split(", ")
                    .map(|c| format!("c.{}", c.trim()))
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            select_many(conn, &sql, params![subject_id])
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.blocking(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM capsules", [], |row| row.get(0))?;
            Ok(n as usize)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;

    #[tokio::test]
    async fn test_store_and_retrieve() {
        conformance::store_and_retrieve(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_single_active() {
        conformance::single_active(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_supersede_chain() {
        conformance::supersede_chain(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_as_of() {
        conformance::as_of(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_export() {
        conformance::export(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_rejects_tampered() {
        conformance::rejects_tampered(&SqliteStore::open_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn test_partial_index_blocks_second_active() {
        let store = SqliteStore::open_memory().unwrap();
        let first = conformance::capsule("emp-1", 0.0, 10);
        store.store(&first).await.unwrap();

        // bypass the pre-check and hit the index directly
        let second = conformance::capsule("emp-1", 5.0, 20);
        let result = store
            .blocking(move |conn| insert_capsule(conn, &second))
            .await;
        assert!(matches!(result, Err(StoreError::Database(_))));
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capsules.db");

        let first = conformance::capsule("emp-1", 0.0, 10);
        {
            let store = SqliteStore::open(&path).unwrap();
            store.store(&first).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let loaded = store.retrieve(&first.id).await.unwrap().unwrap();
        assert_eq!(loaded, first);
        assert!(loaded.verify().is_ok());
    }
}
