use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use tbarr_types::Pool;

use crate::store::CatalogStore;

impl CatalogStore {
    pub fn create_pool(&self, name: &str, retention_days: Option<u32>) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO pools (name, retention_days) VALUES (?1, ?2)",
            params![name, retention_days],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_pool(&self, id: i64) -> Result<Option<Pool>> {
        self.conn
            .query_row(
                "SELECT id, name, retention_days FROM pools WHERE id = ?1",
                params![id],
                row_to_pool,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn get_pool_by_name(&self, name: &str) -> Result<Option<Pool>> {
        self.conn
            .query_row(
                "SELECT id, name, retention_days FROM pools WHERE name = ?1",
                params![name],
                row_to_pool,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_pools(&self) -> Result<Vec<Pool>> {
        let mut stmt = self.conn.prepare("SELECT id, name, retention_days FROM pools ORDER BY name")?;
        let rows = stmt.query_map([], row_to_pool)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes a pool if no tape is still assigned to it (§3). The
    /// schema's own `ON DELETE RESTRICT` on `backup_jobs.pool_id` is the
    /// backstop for the other referencing case; the spec only calls out
    /// tapes as the guard a caller needs a clear error for.
    pub fn delete_pool(&self, id: i64) -> Result<()> {
        let tape_count: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM tapes WHERE pool_id = ?1", params![id], |row| row.get(0))?;
        if tape_count > 0 {
            anyhow::bail!("pool {id} still has {tape_count} tape(s) assigned to it");
        }
        self.conn.execute("DELETE FROM pools WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_pool(row: &rusqlite::Row) -> rusqlite::Result<Pool> {
    Ok(Pool {
        id: row.get(0)?,
        name: row.get(1)?,
        retention_days: row.get(2)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::CatalogStore;

    #[test]
    fn creates_and_finds_a_pool() {
        let store = CatalogStore::open_in_memory().unwrap();
        let id = store.create_pool("DAILY", Some(30)).unwrap();
        let pool = store.get_pool(id).unwrap().unwrap();
        assert_eq!(pool.name, "DAILY");
        assert_eq!(pool.retention_days, Some(30));
        assert_eq!(store.list_pools().unwrap().len(), 1);
    }

    #[test]
    fn deletes_an_unused_pool() {
        let store = CatalogStore::open_in_memory().unwrap();
        let id = store.create_pool("DAILY", None).unwrap();
        store.delete_pool(id).unwrap();
        assert!(store.get_pool(id).unwrap().is_none());
    }

    #[test]
    fn refuses_to_delete_a_pool_with_a_tape_assigned() {
        use crate::tapes::NewTape;
        use tbarr_types::CompressionType;
        use uuid::Uuid;

        let store = CatalogStore::open_in_memory().unwrap();
        let id = store.create_pool("DAILY", None).unwrap();
        store
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id: id,
                capacity_bytes: 1000,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();

        assert!(store.delete_pool(id).is_err());
        assert!(store.get_pool(id).unwrap().is_some());
    }
}
