use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use tbarr_types::{BackupJob, BackupSource, BackupType, Timestamp};

use crate::enums::{backup_type_from_str, backup_type_to_str};
use crate::store::CatalogStore;
use crate::util::sql_parse_err;

const JOB_COLUMNS: &str = "SELECT id, name, source_json, pool_id, backup_type, schedule, retention_days,
    enabled, last_run, next_run FROM backup_jobs";

impl CatalogStore {
    pub fn create_job(
        &self,
        name: &str,
        source: &BackupSource,
        pool_id: i64,
        backup_type: BackupType,
        schedule: Option<&str>,
        retention_days: Option<u32>,
    ) -> Result<i64> {
        let source_json = serde_json::to_string(source)?;
        self.conn.execute(
            "INSERT INTO backup_jobs (name, source_json, pool_id, backup_type, schedule, retention_days)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![name, source_json, pool_id, backup_type_to_str(backup_type), schedule, retention_days],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<BackupJob>> {
        self.conn
            .query_row(&format!("{JOB_COLUMNS} WHERE id = ?1"), params![id], row_to_job)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_job_by_name(&self, name: &str) -> Result<Option<BackupJob>> {
        self.conn
            .query_row(&format!("{JOB_COLUMNS} WHERE name = ?1"), params![name], row_to_job)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_enabled_jobs(&self) -> Result<Vec<BackupJob>> {
        let mut stmt = self.conn.prepare(&format!("{JOB_COLUMNS} WHERE enabled = 1 ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_jobs(&self) -> Result<Vec<BackupJob>> {
        let mut stmt = self.conn.prepare(&format!("{JOB_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_job)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Called once per scheduler tick after a job starts (or is
    /// rescheduled), so `next_run` always reflects the live cron
    /// evaluation rather than a stale value from job creation.
    pub fn update_job_schedule(&self, id: i64, last_run: Option<Timestamp>, next_run: Option<Timestamp>) -> Result<()> {
        self.conn.execute(
            "UPDATE backup_jobs SET last_run = ?1, next_run = ?2 WHERE id = ?3",
            params![last_run, next_run, id],
        )?;
        Ok(())
    }

    pub fn set_job_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        self.conn.execute("UPDATE backup_jobs SET enabled = ?1 WHERE id = ?2", params![enabled, id])?;
        Ok(())
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<BackupJob> {
    let source_json: String = row.get(2)?;
    let backup_type: String = row.get(4)?;
    Ok(BackupJob {
        id: row.get(0)?,
        name: row.get(1)?,
        source: serde_json::from_str(&source_json).map_err(|e| sql_parse_err("source_json", e))?,
        pool_id: row.get(3)?,
        backup_type: backup_type_from_str(&backup_type).map_err(|e| sql_parse_err("backup_type", e))?,
        schedule: row.get(5)?,
        retention_days: row.get(6)?,
        enabled: row.get(7)?,
        last_run: row.get(8)?,
        next_run: row.get(9)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_source() -> BackupSource {
        BackupSource {
            path: "/srv/data".into(),
            include: vec!["**/*".into()],
            exclude: vec!["**/*.tmp".into()],
            source_type: tbarr_types::SourceType::Local,
        }
    }

    #[test]
    fn creates_and_finds_a_job_with_its_source() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let id = store
            .create_job("nightly", &sample_source(), pool_id, BackupType::Incremental, Some("0 0 2 * * *"), Some(90))
            .unwrap();

        let job = store.get_job(id).unwrap().unwrap();
        assert_eq!(job.name, "nightly");
        assert_eq!(job.source.path, "/srv/data");
        assert_eq!(job.backup_type, BackupType::Incremental);
        assert!(job.enabled);
    }

    #[test]
    fn lists_only_enabled_jobs() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let id = store
            .create_job("nightly", &sample_source(), pool_id, BackupType::Full, None, None)
            .unwrap();
        store.set_job_enabled(id, false).unwrap();
        assert!(store.list_enabled_jobs().unwrap().is_empty());
        assert_eq!(store.list_jobs().unwrap().len(), 1);
    }
}
