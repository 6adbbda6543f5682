use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use tbarr_types::{CompressionType, Fingerprint, Tape, TapeStatus};

use crate::enums::{tape_status_from_str, tape_status_to_str};
use crate::store::CatalogStore;
use crate::util::sql_parse_err;

#[derive(Debug, Clone)]
pub struct NewTape {
    pub uuid: Uuid,
    pub barcode: Option<String>,
    pub label: String,
    pub pool_id: i64,
    pub capacity_bytes: u64,
    pub encryption_key_fingerprint: Option<Fingerprint>,
    pub compression_type: CompressionType,
    pub lto_generation: Option<u8>,
}

impl CatalogStore {
    pub fn create_tape(&self, tape: &NewTape) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tapes (
                uuid, barcode, label, pool_id, status, capacity_bytes,
                encryption_key_fingerprint, compression_type, lto_generation
            ) VALUES (?1, ?2, ?3, ?4, 'blank', ?5, ?6, ?7, ?8)",
            params![
                tape.uuid.to_string(),
                tape.barcode,
                tape.label,
                tape.pool_id,
                tape.capacity_bytes as i64,
                tape.encryption_key_fingerprint.as_ref().map(|f| f.to_string()),
                tape.compression_type.to_string(),
                tape.lto_generation,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_tape(&self, id: i64) -> Result<Option<Tape>> {
        self.conn
            .query_row(&format!("{TAPE_COLUMNS} WHERE id = ?1"), params![id], row_to_tape)
            .optional()
            .map_err(Into::into)
    }

    pub fn get_tape_by_uuid(&self, uuid: Uuid) -> Result<Option<Tape>> {
        self.conn
            .query_row(
                &format!("{TAPE_COLUMNS} WHERE uuid = ?1"),
                params![uuid.to_string()],
                row_to_tape,
            )
            .optional()
            .map_err(Into::into)
    }

    pub fn list_tapes_in_pool(&self, pool_id: i64) -> Result<Vec<Tape>> {
        let mut stmt = self.conn.prepare(&format!("{TAPE_COLUMNS} WHERE pool_id = ?1 ORDER BY id"))?;
        let rows = stmt.query_map(params![pool_id], row_to_tape)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_tapes_by_status(&self, status: TapeStatus) -> Result<Vec<Tape>> {
        let mut stmt = self.conn.prepare(&format!("{TAPE_COLUMNS} WHERE status = ?1 ORDER BY id"))?;
        let rows = stmt.query_map(params![tape_status_to_str(status)], row_to_tape)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Applies a status transition, rejecting whatever
    /// `TapeStatus::can_transition` (§4.7) would reject rather than
    /// trusting the caller.
    pub fn transition_tape_status(&self, id: i64, next: TapeStatus, manual: bool) -> Result<()> {
        let tape = self
            .get_tape(id)?
            .ok_or_else(|| anyhow::anyhow!("no such tape {id}"))?;
        if !tape.status.can_transition(next, manual) {
            anyhow::bail!("tape {id}: {:?} -> {:?} is not a permitted transition", tape.status, next);
        }
        self.conn.execute(
            "UPDATE tapes SET status = ?1 WHERE id = ?2",
            params![tape_status_to_str(next), id],
        )?;
        Ok(())
    }

    /// Records bytes written and bumps the write counter, called once per
    /// tape segment finalized (§4.5).
    pub fn record_tape_write(&self, id: i64, additional_bytes: u64, written_at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE tapes SET used_bytes = used_bytes + ?1, write_count = write_count + 1,
             last_written_at = ?2 WHERE id = ?3",
            params![additional_bytes as i64, written_at, id],
        )?;
        Ok(())
    }

    /// Deletes a tape if no backup set has ever written a segment to it
    /// (§3). `list_segments_for_tape` already covers a set's primary tape
    /// as well as any successor tape it spanned onto, since every segment
    /// -- including the first -- is recorded there.
    pub fn delete_tape(&self, id: i64) -> Result<()> {
        let segments = self.list_segments_for_tape(id)?;
        if !segments.is_empty() {
            anyhow::bail!("tape {id} still has {} tape segment(s) recorded against it", segments.len());
        }
        self.conn.execute("DELETE FROM tapes WHERE id = ?1", params![id])?;
        Ok(())
    }
}

const TAPE_COLUMNS: &str = "SELECT id, uuid, barcode, label, pool_id, status, capacity_bytes, used_bytes,
    write_count, last_written_at, offsite_location, encryption_key_fingerprint, compression_type,
    lto_generation FROM tapes";

fn row_to_tape(row: &rusqlite::Row) -> rusqlite::Result<Tape> {
    let uuid: String = row.get(1)?;
    let status: String = row.get(5)?;
    let fingerprint: Option<String> = row.get(11)?;
    let compression: String = row.get(12)?;
    Ok(Tape {
        id: row.get(0)?,
        uuid: uuid.parse().map_err(|e| sql_parse_err("uuid", e))?,
        barcode: row.get(2)?,
        label: row.get(3)?,
        pool_id: row.get(4)?,
        status: tape_status_from_str(&status).map_err(|e| sql_parse_err("status", e))?,
        capacity_bytes: row.get::<_, i64>(6)? as u64,
        used_bytes: row.get::<_, i64>(7)? as u64,
        write_count: row.get::<_, i64>(8)? as u32,
        last_written_at: row.get(9)?,
        offsite_location: row.get(10)?,
        encryption_key_fingerprint: fingerprint
            .map(|f| f.parse::<Fingerprint>())
            .transpose()
            .map_err(|e| sql_parse_err("fingerprint", e))?,
        compression_type: compression.parse().map_err(|e| sql_parse_err("compression", e))?,
        lto_generation: row.get(13)?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn creates_a_tape_in_blank_status() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let id = store
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: Some("BC001".into()),
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 2_000_000_000_000,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::Zstd,
                lto_generation: Some(8),
            })
            .unwrap();

        let tape = store.get_tape(id).unwrap().unwrap();
        assert_eq!(tape.status, TapeStatus::Blank);
        assert_eq!(tape.compression_type, CompressionType::Zstd);
    }

    #[test]
    fn rejects_illegal_status_transition() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let id = store
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-002".into(),
                pool_id,
                capacity_bytes: 1000,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();

        assert!(store.transition_tape_status(id, TapeStatus::Full, false).is_err());
        store.transition_tape_status(id, TapeStatus::Active, false).unwrap();
        assert!(store.transition_tape_status(id, TapeStatus::Blank, true).is_err());
    }

    #[test]
    fn deletes_a_tape_with_no_segments_written() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let id = store
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 1000,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();

        store.delete_tape(id).unwrap();
        assert!(store.get_tape(id).unwrap().is_none());
    }

    #[test]
    fn refuses_to_delete_a_tape_a_backup_set_has_written_to() {
        use tbarr_types::{BackupSource, BackupType, SourceType};

        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let id = store
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 1000,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();
        let job_id = store
            .create_job(
                "nightly",
                &BackupSource { path: "/srv".into(), include: vec![], exclude: vec![], source_type: SourceType::Local },
                pool_id,
                BackupType::Full,
                None,
                None,
            )
            .unwrap();
        let set_id = store.begin_backup_set(job_id, id, BackupType::Full, 1000, 1, None, CompressionType::None).unwrap();
        store.add_tape_segment(set_id, id, 1, 1).unwrap();

        assert!(store.delete_tape(id).is_err());
        assert!(store.get_tape(id).unwrap().is_some());
    }
}
