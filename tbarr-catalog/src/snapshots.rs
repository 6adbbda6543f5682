//! Per-source snapshot manifests (§3 Snapshot): replaced atomically after
//! each successful backup set, keyed by the job that owns the source.

use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use tbarr_types::{SnapshotManifest, Timestamp};

use crate::store::CatalogStore;
use crate::util::sql_parse_err;

impl CatalogStore {
    pub fn get_snapshot(&self, job_id: i64) -> Result<Option<SnapshotManifest>> {
        let json: Option<String> = self
            .conn
            .query_row("SELECT manifest_json FROM snapshots WHERE job_id = ?1", params![job_id], |row| row.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(|e| sql_parse_err("manifest_json", e).into()))
            .transpose()
    }

    /// Atomically replaces the snapshot for `job_id` (§4.5 step 6). Called
    /// once a backup set completes, whether or not it emitted any files.
    pub fn replace_snapshot(&self, job_id: i64, manifest: &SnapshotManifest, updated_at: Timestamp) -> Result<()> {
        let json = serde_json::to_string(manifest)?;
        self.conn.execute(
            "INSERT INTO snapshots (job_id, manifest_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(job_id) DO UPDATE SET manifest_json = excluded.manifest_json, updated_at = excluded.updated_at",
            params![job_id, json, updated_at],
        )?;
        Ok(())
    }
}
