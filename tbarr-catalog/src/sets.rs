use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use tbarr_types::{BackupSet, BackupSetStatus, BackupType, CompressionType, TapeSegment, Timestamp};

use crate::enums::{backup_set_status_from_str, backup_set_status_to_str, backup_type_from_str, backup_type_to_str};
use crate::store::CatalogStore;
use crate::util::sql_parse_err;

const SET_COLUMNS: &str = "SELECT id, job_id, primary_tape_id, backup_type, start_time, end_time, status,
    file_count, total_bytes, start_file_number, end_file_number, parent_set_id, checksum, encryption_key_id,
    encryption_tag, compression_type FROM backup_sets";

const SEGMENT_COLUMNS: &str =
    "SELECT id, backup_set_id, tape_id, sequence_number, start_file_number, end_file_number FROM tape_segments";

impl CatalogStore {
    /// Opens a new set in `pending` status (§4.5 step 2); the pipeline
    /// transitions it to `running` once the tape is positioned.
    pub fn begin_backup_set(
        &self,
        job_id: i64,
        primary_tape_id: i64,
        backup_type: BackupType,
        start_time: Timestamp,
        start_file_number: u64,
        parent_set_id: Option<i64>,
        compression_type: CompressionType,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO backup_sets (
                job_id, primary_tape_id, backup_type, start_time, status,
                start_file_number, parent_set_id, compression_type
            ) VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7)",
            params![
                job_id,
                primary_tape_id,
                backup_type_to_str(backup_type),
                start_time,
                start_file_number as i64,
                parent_set_id,
                compression_type.to_string(),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_backup_set(&self, id: i64) -> Result<Option<BackupSet>> {
        self.conn
            .query_row(&format!("{SET_COLUMNS} WHERE id = ?1"), params![id], row_to_set)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_backup_sets_for_job(&self, job_id: i64) -> Result<Vec<BackupSet>> {
        let mut stmt = self.conn.prepare(&format!("{SET_COLUMNS} WHERE job_id = ?1 ORDER BY start_time"))?;
        let rows = stmt.query_map(params![job_id], row_to_set)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Most recent completed set for a job, the basis of the next
    /// incremental diff (§4.4).
    pub fn latest_completed_set_for_job(&self, job_id: i64) -> Result<Option<BackupSet>> {
        self.conn
            .query_row(
                &format!("{SET_COLUMNS} WHERE job_id = ?1 AND status = 'completed' ORDER BY start_time DESC LIMIT 1"),
                params![job_id],
                row_to_set,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn set_backup_set_status(&self, id: i64, status: BackupSetStatus, end_time: Option<Timestamp>) -> Result<()> {
        self.conn.execute(
            "UPDATE backup_sets SET status = ?1, end_time = ?2 WHERE id = ?3",
            params![backup_set_status_to_str(status), end_time, id],
        )?;
        Ok(())
    }

    /// Finalizes a completed set's summary counters and checksum (§4.5
    /// step 7), called once inside the same transaction that writes its
    /// last catalog entries.
    pub fn finish_backup_set(
        &self,
        id: i64,
        end_time: Timestamp,
        file_count: u64,
        total_bytes: u64,
        end_file_number: u64,
        checksum: &str,
        encryption_tag: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE backup_sets SET status = 'completed', end_time = ?1, file_count = ?2, total_bytes = ?3,
             end_file_number = ?4, checksum = ?5, encryption_tag = ?6 WHERE id = ?7",
            params![end_time, file_count as i64, total_bytes as i64, end_file_number as i64, checksum, encryption_tag, id],
        )?;
        Ok(())
    }

    /// Appends the next spanning segment for a set (§4.5 step 5): sequence
    /// numbers are assigned by the caller from 1, contiguous and
    /// monotonic, enforced by the schema's unique constraint.
    pub fn add_tape_segment(
        &self,
        backup_set_id: i64,
        tape_id: i64,
        sequence_number: u32,
        start_file_number: u64,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tape_segments (backup_set_id, tape_id, sequence_number, start_file_number)
             VALUES (?1, ?2, ?3, ?4)",
            params![backup_set_id, tape_id, sequence_number, start_file_number as i64],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn close_tape_segment(&self, id: i64, end_file_number: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE tape_segments SET end_file_number = ?1 WHERE id = ?2",
            params![end_file_number as i64, id],
        )?;
        Ok(())
    }

    pub fn list_segments_for_set(&self, backup_set_id: i64) -> Result<Vec<TapeSegment>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SEGMENT_COLUMNS} WHERE backup_set_id = ?1 ORDER BY sequence_number"))?;
        let rows = stmt.query_map(params![backup_set_id], row_to_segment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every segment ever written to `tape_id`, across all backup sets.
    /// The Backup Pipeline uses the greatest `end_file_number` here to
    /// position for an append rather than parsing the on-tape TOC, which
    /// does not record per-tape file-number boundaries.
    pub fn list_segments_for_tape(&self, tape_id: i64) -> Result<Vec<TapeSegment>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{SEGMENT_COLUMNS} WHERE tape_id = ?1 ORDER BY id"))?;
        let rows = stmt.query_map(params![tape_id], row_to_segment)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes a backup set and, via `ON DELETE CASCADE`, its segments and
    /// catalog entries. Refuses while the set is still `pending`/`running`,
    /// since that corresponds to a tape write in progress -- the spec
    /// names this guard explicitly only for pools and tapes, but an
    /// in-flight set is exactly the same kind of "still in use" case.
    pub fn delete_backup_set(&self, id: i64) -> Result<()> {
        let set = self.get_backup_set(id)?.ok_or_else(|| anyhow::anyhow!("no such backup set {id}"))?;
        if matches!(set.status, BackupSetStatus::Pending | BackupSetStatus::Running) {
            anyhow::bail!("backup set {id} is still {:?}, refusing to delete", set.status);
        }
        self.conn.execute("DELETE FROM backup_sets WHERE id = ?1", params![id])?;
        Ok(())
    }
}

fn row_to_set(row: &rusqlite::Row) -> rusqlite::Result<BackupSet> {
    let backup_type: String = row.get(3)?;
    let status: String = row.get(6)?;
    let compression: String = row.get(15)?;
    Ok(BackupSet {
        id: row.get(0)?,
        job_id: row.get(1)?,
        primary_tape_id: row.get(2)?,
        backup_type: backup_type_from_str(&backup_type).map_err(|e| sql_parse_err("backup_type", e))?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        status: backup_set_status_from_str(&status).map_err(|e| sql_parse_err("status", e))?,
        file_count: row.get::<_, i64>(7)? as u64,
        total_bytes: row.get::<_, i64>(8)? as u64,
        start_file_number: row.get::<_, i64>(9)? as u64,
        end_file_number: row.get::<_, Option<i64>>(10)?.map(|v| v as u64),
        parent_set_id: row.get(11)?,
        checksum: row.get(12)?,
        encryption_key_id: row.get(13)?,
        encryption_tag: row.get(14)?,
        compression_type: compression.parse().map_err(|e| sql_parse_err("compression", e))?,
    })
}

fn row_to_segment(row: &rusqlite::Row) -> rusqlite::Result<TapeSegment> {
    Ok(TapeSegment {
        id: row.get(0)?,
        backup_set_id: row.get(1)?,
        tape_id: row.get(2)?,
        sequence_number: row.get::<_, i64>(3)? as u32,
        start_file_number: row.get::<_, i64>(4)? as u64,
        end_file_number: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
    })
}
