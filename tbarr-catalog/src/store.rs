//! The `CatalogStore` connection wrapper: WAL mode, foreign keys on,
//! schema migration via `PRAGMA user_version`, and self-backup.

use std::path::Path;

use anyhow::{Context, Result};
use rusqlite::Connection;

use crate::schema::{CURRENT_SCHEMA_VERSION, DDL};

pub struct CatalogStore {
    pub(crate) conn: Connection,
}

impl CatalogStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).with_context(|| format!("opening catalog at {path:?}"))?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests and by the restore-verification
    /// dry-run path (§8) that never wants to touch disk.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        let mut store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&mut self) -> Result<()> {
        let version: i64 = self.conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version > CURRENT_SCHEMA_VERSION {
            anyhow::bail!(
                "catalog schema version {version} is newer than this binary supports ({CURRENT_SCHEMA_VERSION})"
            );
        }
        self.conn.execute_batch(DDL)?;
        if version != CURRENT_SCHEMA_VERSION {
            self.conn
                .execute_batch(&format!("PRAGMA user_version = {CURRENT_SCHEMA_VERSION}"))?;
            log::info!("catalog schema migrated from version {version} to {CURRENT_SCHEMA_VERSION}");
        }
        Ok(())
    }

    /// Runs `f` inside an explicit transaction, committing on `Ok` and
    /// rolling back on `Err` (rusqlite's `Drop` does this automatically,
    /// but multi-statement catalog operations -- e.g. finalizing a backup
    /// set plus its segment and catalog entries -- must not observe a
    /// partially-applied state even under a concurrent reader).
    pub fn with_transaction<T>(&mut self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let tx = self.conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Backs up the live catalog to `dest`, used before any destructive
    /// catalog rebuild and by the operator-triggered catalog export.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        let mut dst = Connection::open(dest)?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dst)?;
        backup.run_to_completion(100, std::time::Duration::from_millis(50), None)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn opens_in_memory_and_migrates() {
        let store = CatalogStore::open_in_memory().unwrap();
        let version: i64 = store
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let store = CatalogStore::open_in_memory().unwrap();
        let err = store
            .conn
            .execute(
                "INSERT INTO tapes (uuid, label, pool_id, status, capacity_bytes) VALUES (?1, ?2, 999, 'blank', 0)",
                rusqlite::params!["11111111-1111-1111-1111-111111111111", "T1"],
            )
            .unwrap_err();
        assert!(err.to_string().contains("FOREIGN KEY") || err.to_string().contains("constraint"));
    }
}
