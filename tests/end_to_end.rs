//! End-to-end scenarios that exercise the catalog, Backup/Restore
//! Pipelines, and Job Orchestrator together against a `VirtualTapeDevice`
//! and an in-memory catalog, rather than each module in isolation.
//!
//! Multi-tape spanning is deliberately not exercised here: `OperatorPrompt`
//! gives the pipeline no access to `&mut DriveSlot` to perform a virtual
//! media swap, so a spanning backup/restore can't be driven end to end
//! with the current collaborator shapes. That mechanism is covered by the
//! `TapeBlockWriter`/`TapeBlockReader` unit tests in `src/tape/block_io.rs`
//! instead.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::tempdir;
use uuid::Uuid;

use tapebackarr::collaborators::{AuditSink, ChannelOperatorPrompt, Clock, LoggingNotificationSink, TestClock};
use tapebackarr::scheduler::{ExecutionResult, JobOrchestrator};
use tapebackarr::tape::{DriveRegistry, DriveSlot};
use tapebackarr::{plan_restore, run_backup, run_restore, BackupPipeline, RestorePipeline};

use tbarr_catalog::{CatalogStore, NewTape};
use tbarr_tape::VirtualTapeDevice;
use tbarr_types::{BackupSetStatus, BackupSource, BackupType, CompressionType, JobExecutionStatus, SourceType};

struct NullAudit;
impl AuditSink for NullAudit {
    fn append(&self, _actor: &str, _action: &str, _kind: &str, _id: &str, _details: serde_json::Value) -> anyhow::Result<()> {
        Ok(())
    }
}

fn local_source(path: &std::path::Path) -> BackupSource {
    BackupSource { path: path.to_string_lossy().to_string(), include: vec![], exclude: vec![], source_type: SourceType::Local }
}

#[test]
fn path_pattern_filtering_restores_only_matching_files() {
    let source_dir = tempdir().unwrap();
    fs::write(source_dir.path().join("keep.txt"), b"keep me").unwrap();
    fs::create_dir(source_dir.path().join("logs")).unwrap();
    fs::write(source_dir.path().join("logs/app.log"), b"drop me").unwrap();
    let dest_dir = tempdir().unwrap();

    let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
    let job_id = {
        let guard = store.lock().unwrap();
        let pool_id = guard.create_pool("DAILY", None).unwrap();
        guard
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 50 * 1024 * 1024,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();
        guard
            .create_job("nightly", &local_source(source_dir.path()), pool_id, BackupType::Full, None, None)
            .unwrap()
    };
    let job = store.lock().unwrap().get_job(job_id).unwrap().unwrap();
    let execution_id = store.lock().unwrap().begin_execution(job_id, 1000).unwrap();

    let (prompt, _tx) = ChannelOperatorPrompt::new();
    let backup_pipeline = BackupPipeline {
        store: store.clone(),
        clock: Arc::new(TestClock::new(1000)),
        audit: Arc::new(NullAudit),
        operator: Arc::new(prompt),
        operator_change_timeout: Duration::from_secs(1),
        checkpoint_interval_seconds: 3600,
    };
    let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(50 * 1024 * 1024)));
    let cancel = AtomicBool::new(false);
    let outcome =
        run_backup(&backup_pipeline, &job, execution_id, 1, &mut slot, CompressionType::None, None, &cancel).unwrap();
    assert_eq!(outcome.files_written, 2);

    let plan = { plan_restore(&store.lock().unwrap(), outcome.backup_set_id, &["keep.txt".to_string()]).unwrap() };
    assert_eq!(plan.matched_entries.len(), 1);
    assert_eq!(plan.matched_entries[0].path, "keep.txt");

    let (restore_prompt, _tx2) = ChannelOperatorPrompt::new();
    let restore_pipeline = RestorePipeline {
        store: store.clone(),
        operator: Arc::new(restore_prompt),
        operator_change_timeout: Duration::from_secs(1),
    };
    let restore_outcome = run_restore(
        &restore_pipeline,
        1,
        &mut slot,
        &plan,
        dest_dir.path(),
        CompressionType::None,
        None,
        true,
        false,
    )
    .unwrap();

    assert_eq!(restore_outcome.files_restored, 1);
    assert!(dest_dir.path().join("keep.txt").exists());
    assert!(!dest_dir.path().join("logs/app.log").exists());
}

#[test]
fn restoring_with_the_wrong_tape_loaded_fails_safely() {
    let source_dir = tempdir().unwrap();
    fs::write(source_dir.path().join("a.txt"), b"hello").unwrap();
    let dest_dir = tempdir().unwrap();

    let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
    let job_id = {
        let guard = store.lock().unwrap();
        let pool_id = guard.create_pool("DAILY", None).unwrap();
        guard
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 50 * 1024 * 1024,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();
        guard
            .create_job("nightly", &local_source(source_dir.path()), pool_id, BackupType::Full, None, None)
            .unwrap()
    };
    let job = store.lock().unwrap().get_job(job_id).unwrap().unwrap();
    let execution_id = store.lock().unwrap().begin_execution(job_id, 1000).unwrap();

    let (prompt, _tx) = ChannelOperatorPrompt::new();
    let backup_pipeline = BackupPipeline {
        store: store.clone(),
        clock: Arc::new(TestClock::new(1000)),
        audit: Arc::new(NullAudit),
        operator: Arc::new(prompt),
        operator_change_timeout: Duration::from_secs(1),
        checkpoint_interval_seconds: 3600,
    };
    let mut backup_slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(50 * 1024 * 1024)));
    let cancel = AtomicBool::new(false);
    let outcome =
        run_backup(&backup_pipeline, &job, execution_id, 1, &mut backup_slot, CompressionType::None, None, &cancel)
            .unwrap();

    let plan = { plan_restore(&store.lock().unwrap(), outcome.backup_set_id, &[]).unwrap() };

    // A second, unrelated tape sits in the drive instead of the one the
    // plan expects: the operator is given a chance to swap it in, but
    // since this test never sends on the channel the confirmation never
    // arrives and the restore must fail rather than guess.
    let mut wrong_slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(1024 * 1024)));
    let (restore_prompt, _tx2) = ChannelOperatorPrompt::new();
    let restore_pipeline = RestorePipeline {
        store: store.clone(),
        operator: Arc::new(restore_prompt),
        operator_change_timeout: Duration::from_millis(20),
    };

    let err = run_restore(
        &restore_pipeline,
        1,
        &mut wrong_slot,
        &plan,
        dest_dir.path(),
        CompressionType::None,
        None,
        true,
        false,
    )
    .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<tbarr_types::TapeBackArrError>(),
        Some(tbarr_types::TapeBackArrError::OperationTimeout)
    ));
    assert!(!dest_dir.path().join("a.txt").exists());
}

#[test]
fn orchestrator_drives_a_full_tick_to_finish_cycle() {
    let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
    let clock = Arc::new(TestClock::new(1_700_000_000));
    let drives = DriveRegistry::new();
    let orchestrator = JobOrchestrator::new(
        store.clone(),
        clock.clone(),
        drives,
        Arc::new(NullAudit),
        Arc::new(LoggingNotificationSink),
    );

    let source_dir = tempdir().unwrap();
    fs::write(source_dir.path().join("a.txt"), b"hello").unwrap();

    let job_id = {
        let guard = store.lock().unwrap();
        let pool_id = guard.create_pool("DAILY", None).unwrap();
        guard
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 50 * 1024 * 1024,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();
        guard
            .create_job(
                "nightly",
                &local_source(source_dir.path()),
                pool_id,
                BackupType::Full,
                Some("* * * * * *"),
                None,
            )
            .unwrap()
    };

    let fired = orchestrator.tick().unwrap();
    assert_eq!(fired, vec![job_id]);

    let started = orchestrator.begin_next(1).unwrap().unwrap();
    assert_eq!(started.job.id, job_id);
    {
        let execution = store.lock().unwrap().get_execution(started.execution_id).unwrap().unwrap();
        assert_eq!(execution.status, JobExecutionStatus::Running);
    }

    let (prompt, _tx) = ChannelOperatorPrompt::new();
    let backup_pipeline = BackupPipeline {
        store: store.clone(),
        clock: clock.clone(),
        audit: Arc::new(NullAudit),
        operator: Arc::new(prompt),
        operator_change_timeout: Duration::from_secs(1),
        checkpoint_interval_seconds: 3600,
    };
    let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(50 * 1024 * 1024)));
    let outcome = run_backup(
        &backup_pipeline,
        &started.job,
        started.execution_id,
        1,
        &mut slot,
        CompressionType::None,
        None,
        &started.cancel,
    )
    .unwrap();
    assert_eq!(outcome.files_written, 1);
    assert!(!started.cancel.load(Ordering::SeqCst));

    orchestrator.finish(started.execution_id, ExecutionResult::Completed).unwrap();
    drop(started.reservation);

    let execution = store.lock().unwrap().get_execution(started.execution_id).unwrap().unwrap();
    assert_eq!(execution.status, JobExecutionStatus::Completed);
    assert!(orchestrator.begin_next(1).unwrap().is_none());
}

/// A `Clock` that flips a shared cancel flag once its `now()` has been
/// called `trigger_at` times, letting a test stop `run_backup` after a
/// specific file without touching production code.
struct CancelAfterCalls {
    base: i64,
    calls: AtomicU32,
    trigger_at: u32,
    cancel: Arc<AtomicBool>,
}

impl Clock for CancelAfterCalls {
    fn now(&self) -> i64 {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n >= self.trigger_at {
            self.cancel.store(true, Ordering::SeqCst);
        }
        self.base
    }
}

#[test]
fn crash_mid_write_is_recovered_and_a_real_resume_picks_up_where_it_stopped() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("a.txt"), b"first file contents").unwrap();
    fs::write(dir.path().join("b.txt"), b"second file contents").unwrap();
    fs::write(dir.path().join("c.txt"), b"third file contents").unwrap();

    let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
    let job_id = {
        let guard = store.lock().unwrap();
        let pool_id = guard.create_pool("DAILY", None).unwrap();
        guard
            .create_tape(&NewTape {
                uuid: Uuid::new_v4(),
                barcode: None,
                label: "DAILY-001".into(),
                pool_id,
                capacity_bytes: 50 * 1024 * 1024,
                encryption_key_fingerprint: None,
                compression_type: CompressionType::None,
                lto_generation: None,
            })
            .unwrap();
        guard
            .create_job("nightly", &local_source(dir.path()), pool_id, BackupType::Full, None, None)
            .unwrap()
    };
    let job = store.lock().unwrap().get_job(job_id).unwrap().unwrap();

    // A real drive reservation is taken out, exactly as `begin_next` would
    // do, and then leaked: the process that held it dies before releasing
    // it, same as `std::mem::forget` simulated before this rewrite.
    let drives = DriveRegistry::new();
    let execution_id = store.lock().unwrap().begin_execution(job_id, 1000).unwrap();
    let stale_reservation = drives.reserve(1, execution_id, 1000).unwrap();
    std::mem::forget(stale_reservation);

    let cancel = Arc::new(AtomicBool::new(false));
    let clock = Arc::new(CancelAfterCalls { base: 1000, calls: AtomicU32::new(0), trigger_at: 2, cancel: cancel.clone() });
    let (prompt, _tx) = ChannelOperatorPrompt::new();
    let pipeline = BackupPipeline {
        store: store.clone(),
        clock,
        audit: Arc::new(NullAudit),
        operator: Arc::new(prompt),
        operator_change_timeout: Duration::from_secs(1),
        checkpoint_interval_seconds: 0,
    };

    let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(50 * 1024 * 1024)));
    let outcome = run_backup(&pipeline, &job, execution_id, 1, &mut slot, CompressionType::None, None, &cancel).unwrap();
    assert_eq!(outcome.files_written, 1);
    assert!(outcome.cancelled);

    // The worker died without ever reporting back to the orchestrator: the
    // execution is still `running` in the catalog, exactly like a crash.
    let execution = store.lock().unwrap().get_execution(execution_id).unwrap().unwrap();
    assert_eq!(execution.status, JobExecutionStatus::Running);
    let backup_set_id = execution.backup_set_id.unwrap();

    let orchestrator = JobOrchestrator::new(
        store.clone(),
        Arc::new(TestClock::new(2000)),
        drives,
        Arc::new(NullAudit),
        Arc::new(LoggingNotificationSink),
    );
    let recovered = orchestrator.recover().unwrap();
    assert_eq!(recovered, vec![execution_id]);
    assert!(!orchestrator.drives.is_reserved(1));

    let execution = store.lock().unwrap().get_execution(execution_id).unwrap().unwrap();
    assert_eq!(execution.status, JobExecutionStatus::Paused);
    assert!(execution.can_resume);

    let resumable = orchestrator.resume(job_id).unwrap().unwrap();
    assert_eq!(resumable.id, execution_id);
    let restarted = orchestrator.begin_next(1).unwrap().unwrap();
    assert_eq!(restarted.execution_id, execution_id);
    let execution = store.lock().unwrap().get_execution(execution_id).unwrap().unwrap();
    assert_eq!(execution.status, JobExecutionStatus::Running);

    // The operator never ejected the tape, so the same drive slot picks the
    // backup back up and this leg runs to completion.
    let resume_cancel = AtomicBool::new(false);
    let (resume_prompt, _tx2) = ChannelOperatorPrompt::new();
    let resume_pipeline = BackupPipeline {
        store: store.clone(),
        clock: Arc::new(TestClock::new(3000)),
        audit: Arc::new(NullAudit),
        operator: Arc::new(resume_prompt),
        operator_change_timeout: Duration::from_secs(1),
        checkpoint_interval_seconds: 3600,
    };
    let outcome2 =
        run_backup(&resume_pipeline, &restarted.job, execution_id, 1, &mut slot, CompressionType::None, None, &resume_cancel)
            .unwrap();
    assert!(!outcome2.cancelled);
    assert_eq!(outcome2.backup_set_id, backup_set_id);
    assert_eq!(outcome2.files_written, 2);

    let guard = store.lock().unwrap();
    let mut paths: Vec<_> = guard.list_entries_for_set(backup_set_id).unwrap().into_iter().map(|e| e.path).collect();
    paths.sort();
    assert_eq!(paths, vec!["a.txt".to_string(), "b.txt".to_string(), "c.txt".to_string()]);

    let segments = guard.list_segments_for_set(backup_set_id).unwrap();
    assert_eq!(segments.len(), 2);
    assert!(segments.iter().all(|s| s.end_file_number.is_some()));
    assert!(segments[1].start_file_number > segments[0].end_file_number.unwrap());

    let set = guard.get_backup_set(backup_set_id).unwrap().unwrap();
    assert_eq!(set.status, BackupSetStatus::Completed);
    assert_eq!(set.file_count, 3);
}
