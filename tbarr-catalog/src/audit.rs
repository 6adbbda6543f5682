use anyhow::Result;
use rusqlite::params;
use serde_json::Value;

use tbarr_types::{AuditLog, Timestamp};

use crate::store::CatalogStore;

const AUDIT_COLUMNS: &str = "SELECT id, actor, action, resource_kind, resource_id, details, timestamp FROM audit_log";

impl CatalogStore {
    /// Appends one immutable record (§3 AuditLog). There is no update or
    /// delete method -- the audit trail is append-only by construction,
    /// not by convention.
    pub fn append_audit_log(
        &self,
        actor: &str,
        action: &str,
        resource_kind: &str,
        resource_id: &str,
        details: &Value,
        timestamp: Timestamp,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO audit_log (actor, action, resource_kind, resource_id, details, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![actor, action, resource_kind, resource_id, details.to_string(), timestamp],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_audit_log_for_resource(&self, resource_kind: &str, resource_id: &str) -> Result<Vec<AuditLog>> {
        let mut stmt = self.conn.prepare(&format!(
            "{AUDIT_COLUMNS} WHERE resource_kind = ?1 AND resource_id = ?2 ORDER BY timestamp"
        ))?;
        let rows = stmt.query_map(params![resource_kind, resource_id], row_to_audit_log)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_recent_audit_log(&self, limit: u32) -> Result<Vec<AuditLog>> {
        let mut stmt = self.conn.prepare(&format!("{AUDIT_COLUMNS} ORDER BY timestamp DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit], row_to_audit_log)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn row_to_audit_log(row: &rusqlite::Row) -> rusqlite::Result<AuditLog> {
    let details: String = row.get(5)?;
    Ok(AuditLog {
        id: row.get(0)?,
        actor: row.get(1)?,
        action: row.get(2)?,
        resource_kind: row.get(3)?,
        resource_id: row.get(4)?,
        details: serde_json::from_str(&details).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
        })?,
        timestamp: row.get(6)?,
    })
}
