use anyhow::Result;
use rusqlite::{params, OptionalExtension};

use tbarr_types::{JobExecution, JobExecutionStatus, ResumeState, Timestamp};

use crate::enums::{job_execution_status_from_str, job_execution_status_to_str};
use crate::store::CatalogStore;
use crate::util::sql_parse_err;

const EXECUTION_COLUMNS: &str = "SELECT id, job_id, backup_set_id, status, start_time, end_time,
    files_processed, bytes_processed, error_message, can_resume, resume_state_json FROM job_executions";

impl CatalogStore {
    pub fn begin_execution(&self, job_id: i64, start_time: Timestamp) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO job_executions (job_id, status, start_time) VALUES (?1, 'running', ?2)",
            params![job_id, start_time],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_execution(&self, id: i64) -> Result<Option<JobExecution>> {
        self.conn
            .query_row(&format!("{EXECUTION_COLUMNS} WHERE id = ?1"), params![id], row_to_execution)
            .optional()
            .map_err(Into::into)
    }

    pub fn list_executions_for_job(&self, job_id: i64) -> Result<Vec<JobExecution>> {
        let mut stmt = self
            .conn
            .prepare(&format!("{EXECUTION_COLUMNS} WHERE job_id = ?1 ORDER BY start_time DESC"))?;
        let rows = stmt.query_map(params![job_id], row_to_execution)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Updates live progress counters, called periodically while a
    /// backup or restore pipeline runs (§4.5, §4.6).
    pub fn record_execution_progress(&self, id: i64, files_processed: u64, bytes_processed: u64) -> Result<()> {
        self.conn.execute(
            "UPDATE job_executions SET files_processed = ?1, bytes_processed = ?2 WHERE id = ?3",
            params![files_processed as i64, bytes_processed as i64, id],
        )?;
        Ok(())
    }

    pub fn link_execution_to_set(&self, id: i64, backup_set_id: i64) -> Result<()> {
        self.conn.execute("UPDATE job_executions SET backup_set_id = ?1 WHERE id = ?2", params![backup_set_id, id])?;
        Ok(())
    }

    /// Persists an opaque resume cursor (§4.5 crash recovery). A pipeline
    /// that cannot express a consistent cursor at the point of failure
    /// passes `None`, which clears `can_resume`.
    pub fn save_resume_state(&self, id: i64, resume_state: Option<&ResumeState>) -> Result<()> {
        let json = resume_state.map(serde_json::to_string).transpose()?;
        self.conn.execute(
            "UPDATE job_executions SET can_resume = ?1, resume_state_json = ?2 WHERE id = ?3",
            params![resume_state.is_some(), json, id],
        )?;
        Ok(())
    }

    pub fn finish_execution(
        &self,
        id: i64,
        status: JobExecutionStatus,
        end_time: Timestamp,
        error_message: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE job_executions SET status = ?1, end_time = ?2, error_message = ?3 WHERE id = ?4",
            params![job_execution_status_to_str(status), end_time, error_message, id],
        )?;
        Ok(())
    }

    /// Startup recovery sweep (§4.7, §8 "crash mid-write"): a `running`
    /// execution with no worker left watching it is either a killed `-9`
    /// or a host crash, never a legitimately live run, since a fresh
    /// process has no workers yet. Marks each one `paused`, `can_resume`
    /// only if it actually has a checkpoint to resume from -- a crash
    /// before the first checkpoint leaves nothing to resume, and
    /// `resumable_execution_for_job` would reject it anyway, but the flag
    /// itself should not claim a resume is possible when it isn't.
    /// Returns the ids that were recovered. Call once before accepting
    /// new executions, alongside `DriveRegistry::clear_all`.
    pub fn recover_interrupted_executions(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = {
            let mut stmt = self.conn.prepare("SELECT id FROM job_executions WHERE status = 'running'")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        self.conn.execute(
            "UPDATE job_executions
             SET status = 'paused',
                 can_resume = CASE WHEN resume_state_json IS NOT NULL THEN 1 ELSE 0 END
             WHERE status = 'running'",
            [],
        )?;
        Ok(ids)
    }

    /// The execution to offer resume from, if its stored cursor is still
    /// a version this binary understands (§9 Open Question: an
    /// incompatible version is treated as `cannot_resume`, not guessed at).
    pub fn resumable_execution_for_job(&self, job_id: i64) -> Result<Option<JobExecution>> {
        let candidate = self
            .conn
            .query_row(
                &format!(
                    "{EXECUTION_COLUMNS} WHERE job_id = ?1 AND can_resume = 1 AND status IN ('failed', 'cancelled', 'paused')
                     ORDER BY start_time DESC LIMIT 1"
                ),
                params![job_id],
                row_to_execution,
            )
            .optional()?;
        Ok(candidate.filter(|e| e.resume_state.as_ref().is_some_and(ResumeState::is_compatible)))
    }
}

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<JobExecution> {
    let status: String = row.get(3)?;
    let resume_json: Option<String> = row.get(10)?;
    Ok(JobExecution {
        id: row.get(0)?,
        job_id: row.get(1)?,
        backup_set_id: row.get(2)?,
        status: job_execution_status_from_str(&status).map_err(|e| sql_parse_err("status", e))?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
        files_processed: row.get::<_, i64>(6)? as u64,
        bytes_processed: row.get::<_, i64>(7)? as u64,
        error_message: row.get(8)?,
        can_resume: row.get(9)?,
        resume_state: resume_json
            .map(|j| serde_json::from_str(&j))
            .transpose()
            .map_err(|e| sql_parse_err("resume_state_json", e))?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn records_progress_and_finishes_an_execution() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let job_id = store
            .create_job(
                "nightly",
                &tbarr_types::BackupSource {
                    path: "/srv".into(),
                    include: vec![],
                    exclude: vec![],
                    source_type: tbarr_types::SourceType::Local,
                },
                pool_id,
                tbarr_types::BackupType::Full,
                None,
                None,
            )
            .unwrap();

        let exec_id = store.begin_execution(job_id, 1000).unwrap();
        store.record_execution_progress(exec_id, 10, 2048).unwrap();
        store.finish_execution(exec_id, JobExecutionStatus::Completed, 1100, None).unwrap();

        let exec = store.get_execution(exec_id).unwrap().unwrap();
        assert_eq!(exec.files_processed, 10);
        assert_eq!(exec.status, JobExecutionStatus::Completed);
    }

    #[test]
    fn resume_state_round_trips_and_gates_on_version() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let job_id = store
            .create_job(
                "nightly",
                &tbarr_types::BackupSource {
                    path: "/srv".into(),
                    include: vec![],
                    exclude: vec![],
                    source_type: tbarr_types::SourceType::Local,
                },
                pool_id,
                tbarr_types::BackupType::Full,
                None,
                None,
            )
            .unwrap();
        let exec_id = store.begin_execution(job_id, 1000).unwrap();

        let resume = ResumeState {
            version: ResumeState::CURRENT_VERSION,
            last_completed_path: "var/log/a.log".into(),
            tape_id: 1,
            file_number: 3,
            block_number: 512,
            codec_state_digest: None,
        };
        store.save_resume_state(exec_id, Some(&resume)).unwrap();
        store.finish_execution(exec_id, JobExecutionStatus::Failed, 1050, Some("tape write error")).unwrap();

        let resumable = store.resumable_execution_for_job(job_id).unwrap().unwrap();
        assert_eq!(resumable.resume_state.unwrap().last_completed_path, "var/log/a.log");

        let mut stale = resume.clone();
        stale.version = 999;
        store.save_resume_state(exec_id, Some(&stale)).unwrap();
        assert!(store.resumable_execution_for_job(job_id).unwrap().is_none());
    }

    #[test]
    fn recovery_sweep_pauses_running_executions_and_gates_can_resume_on_a_checkpoint() {
        let store = CatalogStore::open_in_memory().unwrap();
        let pool_id = store.create_pool("DAILY", None).unwrap();
        let job_id = store
            .create_job(
                "nightly",
                &tbarr_types::BackupSource {
                    path: "/srv".into(),
                    include: vec![],
                    exclude: vec![],
                    source_type: tbarr_types::SourceType::Local,
                },
                pool_id,
                tbarr_types::BackupType::Full,
                None,
                None,
            )
            .unwrap();

        // One execution crashed after a checkpoint, one crashed before
        // its first checkpoint, one already finished cleanly.
        let with_checkpoint = store.begin_execution(job_id, 1000).unwrap();
        store
            .save_resume_state(
                with_checkpoint,
                Some(&ResumeState {
                    version: ResumeState::CURRENT_VERSION,
                    last_completed_path: "a.txt".into(),
                    tape_id: 1,
                    file_number: 2,
                    block_number: 10,
                    codec_state_digest: None,
                }),
            )
            .unwrap();
        let without_checkpoint = store.begin_execution(job_id, 1000).unwrap();
        let already_done = store.begin_execution(job_id, 1000).unwrap();
        store.finish_execution(already_done, JobExecutionStatus::Completed, 1100, None).unwrap();

        let recovered = store.recover_interrupted_executions().unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.contains(&with_checkpoint));
        assert!(recovered.contains(&without_checkpoint));

        let checkpointed = store.get_execution(with_checkpoint).unwrap().unwrap();
        assert_eq!(checkpointed.status, JobExecutionStatus::Paused);
        assert!(checkpointed.can_resume);

        let bare = store.get_execution(without_checkpoint).unwrap().unwrap();
        assert_eq!(bare.status, JobExecutionStatus::Paused);
        assert!(!bare.can_resume);

        let done = store.get_execution(already_done).unwrap().unwrap();
        assert_eq!(done.status, JobExecutionStatus::Completed);

        // Idempotent: nothing left running to sweep a second time.
        assert!(store.recover_interrupted_executions().unwrap().is_empty());

        let resumable = store.resumable_execution_for_job(job_id).unwrap().unwrap();
        assert_eq!(resumable.id, with_checkpoint);
    }
}
