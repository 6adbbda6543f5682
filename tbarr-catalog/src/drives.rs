use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use tbarr_types::{Drive, DriveOperationalStatus};

use crate::enums::{drive_status_from_str, drive_status_to_str};
use crate::store::CatalogStore;

const DRIVE_COLUMNS: &str =
    "SELECT id, device_path, display_name, vendor, model, serial, enabled, current_tape, status FROM drives";

impl CatalogStore {
    pub fn register_drive(&self, device_path: &str, display_name: &str) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO drives (device_path, display_name, status) VALUES (?1, ?2, 'offline')
             ON CONFLICT(device_path) DO UPDATE SET display_name = excluded.display_name",
            params![device_path, display_name],
        )?;
        self.conn
            .query_row("SELECT id FROM drives WHERE device_path = ?1", params![device_path], |row| row.get(0))
            .map_err(Into::into)
    }

    pub fn get_drive(&self, id: i64) -> Result<Option<Drive>> {
        self.conn
            .query_row(&format!("{DRIVE_COLUMNS} WHERE id = ?1"), params![id], row_to_drive)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_drives(&self) -> Result<Vec<Drive>> {
        let mut stmt = self.conn.prepare(&format!("{DRIVE_COLUMNS} ORDER BY id"))?;
        let rows = stmt.query_map([], row_to_drive)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn set_drive_status(&self, id: i64, status: DriveOperationalStatus, current_tape: Option<Uuid>) -> Result<()> {
        self.conn.execute(
            "UPDATE drives SET status = ?1, current_tape = ?2 WHERE id = ?3",
            params![drive_status_to_str(status), current_tape.map(|u| u.to_string()), id],
        )?;
        Ok(())
    }
}

fn row_to_drive(row: &rusqlite::Row) -> rusqlite::Result<Drive> {
    let status: String = row.get(8)?;
    let current_tape: Option<String> = row.get(7)?;
    Ok(Drive {
        id: row.get(0)?,
        device_path: row.get(1)?,
        display_name: row.get(2)?,
        vendor: row.get(3)?,
        model: row.get(4)?,
        serial: row.get(5)?,
        enabled: row.get(6)?,
        current_tape: current_tape
            .map(|u| u.parse())
            .transpose()
            .map_err(|e: uuid::Error| crate::util::sql_parse_err("current_tape", e))?,
        status: drive_status_from_str(&status).map_err(|e| crate::util::sql_parse_err("status", e))?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registers_and_updates_drive_status() {
        let store = CatalogStore::open_in_memory().unwrap();
        let id = store.register_drive("/dev/nst0", "LTO-8 Slot 1").unwrap();
        let drive = store.get_drive(id).unwrap().unwrap();
        assert_eq!(drive.status, DriveOperationalStatus::Offline);

        let tape_uuid = Uuid::new_v4();
        store.set_drive_status(id, DriveOperationalStatus::Busy, Some(tape_uuid)).unwrap();
        let drive = store.get_drive(id).unwrap().unwrap();
        assert_eq!(drive.status, DriveOperationalStatus::Busy);
        assert_eq!(drive.current_tape, Some(tape_uuid));
    }
}
