//! Backup Pipeline (§4.5): positions the drive, scans and diffs the
//! source, and streams the result onto tape through the codec layer,
//! spanning onto a successor tape when the current one fills.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use openssl::sha::Sha256;
use serde_json::json;

use tbarr_catalog::CatalogStore;
use tbarr_codec::{ArchiveWriter, EncryptionSpec};
use tbarr_tape::toc::{TocBackupSetEntry, TocFileEntry};
use tbarr_tape::{TapeLabel, Toc};
use tbarr_types::{
    BackupJob, BackupSetStatus, BackupType, CompressionType, ResumeState, SnapshotManifest, Tape, TapeBackArrError,
    TapeStatus, Timestamp,
};

use crate::collaborators::{AuditSink, Clock, OperatorPrompt};
use crate::scan::{build_snapshot, diff_against_snapshot, scan_source};
use crate::tape::{DriveSlot, MediaPool, TapeBlockWriter};

/// Collaborators a backup run needs, bundled so call sites don't thread
/// five `Arc`s through every function (§6).
pub struct BackupPipeline {
    pub store: Arc<Mutex<CatalogStore>>,
    pub clock: Arc<dyn Clock>,
    pub audit: Arc<dyn AuditSink>,
    pub operator: Arc<dyn OperatorPrompt>,
    pub operator_change_timeout: Duration,
    pub checkpoint_interval_seconds: i64,
}

pub struct BackupOutcome {
    pub backup_set_id: i64,
    pub files_written: u64,
    pub bytes_written: u64,
    pub cancelled: bool,
}

/// The tape, segment, sequence number and TOC currently being written to,
/// shared between the write loop and the spanning callback so both see
/// the successor tape once one gets swapped in mid-stream.
struct SpanState {
    tape: Tape,
    segment_id: i64,
    sequence_number: u32,
    toc: Toc,
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finish())
}

/// The next file number to start writing at for this tape: one past the
/// highest file number any segment has reached, or `1` (file #0 is
/// always the label) if the tape has never been written to. Considers
/// every segment, not just closed ones -- a segment a crashed run left
/// open still occupies the file numbers up to its `start_file_number`,
/// and treating it as absent would let a resumed run overwrite it.
/// Derived from the catalog rather than the on-tape TOC, since `Toc`
/// tracks file contents per set but not per-tape file-number boundaries
/// (§4.1, §4.5).
fn next_file_number_for_tape(store: &CatalogStore, tape_id: i64) -> Result<u64> {
    let segments = store.list_segments_for_tape(tape_id)?;
    Ok(segments
        .iter()
        .map(|s| s.end_file_number.unwrap_or(s.start_file_number))
        .max()
        .map(|n| n + 1)
        .unwrap_or(1))
}

/// Confirms the tape physically loaded in `slot` is the one the catalog
/// expects, prompting the operator for a swap if it's wrong or absent
/// for too long (§4.5 step 1, §5).
fn ensure_tape_loaded(
    pipeline: &BackupPipeline,
    slot: &mut DriveSlot,
    drive_id: i64,
    tape: &Tape,
) -> Result<()> {
    let found = slot.device_mut().read_label(false)?;
    match &found {
        Some(label) if label.uuid == tape.uuid => Ok(()),
        _ if tape.status == TapeStatus::Blank => {
            // a blank tape has no label yet; any blank media the drive
            // is holding is acceptable, the pipeline labels it shortly.
            if found.is_some() {
                anyhow::bail!("drive holds a labeled tape but {} expects a blank one", tape.label);
            }
            Ok(())
        }
        _ => {
            pipeline
                .operator
                .request_media_change(drive_id, &tape.label, pipeline.operator_change_timeout)
                .map_err(|e| anyhow!(e))?;
            let relabel = slot.device_mut().read_label(true)?;
            match relabel {
                Some(l) if l.uuid == tape.uuid => Ok(()),
                other => Err(anyhow!(TapeBackArrError::WrongTape {
                    expected: tape.uuid,
                    found: other.map(|l| l.uuid),
                })),
            }
        }
    }
}

/// Tape, set, segment and TOC a write loop is about to stream onto --
/// either a brand-new set (`begin_fresh_set`) or an existing one being
/// continued after a crash (`resume_interrupted_set`).
struct OpenSet {
    set_id: i64,
    start_file_number: u64,
    tape: Tape,
    segment_id: i64,
    sequence_number: u32,
    toc: Toc,
}

/// Allocates a writable tape, labels it if blank, and opens a fresh
/// `backup_set` and its first segment (§4.5 step 1-3).
fn begin_fresh_set(
    pipeline: &BackupPipeline,
    job: &BackupJob,
    execution_id: i64,
    drive_id: i64,
    slot: &mut DriveSlot,
    compression: CompressionType,
    encryption: Option<&EncryptionSpec>,
    now: Timestamp,
) -> Result<OpenSet> {
    let mut tape = {
        let store = pipeline.store.lock().unwrap();
        MediaPool::new(&store, job.pool_id).alloc_writable_tape(now)?
    };

    ensure_tape_loaded(pipeline, slot, drive_id, &tape)?;

    let mut start_file_number = {
        let store = pipeline.store.lock().unwrap();
        next_file_number_for_tape(&store, tape.id)?
    };

    let toc = if start_file_number > 1 {
        slot.device_mut().read_toc().unwrap_or_else(|_| Toc::new(tape.uuid))
    } else {
        Toc::new(tape.uuid)
    };

    if tape.status == TapeStatus::Blank {
        let label = TapeLabel {
            label_text: tape.label.clone(),
            uuid: tape.uuid,
            pool: job.pool_id.to_string(),
            ctime: now,
            encryption_key_fingerprint: encryption.map(|e| e.fingerprint.clone()),
            compression_type: Some(compression),
        };
        slot.device_mut().write_label(&label)?;
        start_file_number = 1;
        let store = pipeline.store.lock().unwrap();
        store.transition_tape_status(tape.id, TapeStatus::Active, false)?;
        tape.status = TapeStatus::Active;
    }
    slot.device_mut().seek_to_file(start_file_number)?;

    let set_id = {
        let store = pipeline.store.lock().unwrap();
        let id = store.begin_backup_set(job.id, tape.id, job.backup_type, now, start_file_number, None, compression)?;
        store.set_backup_set_status(id, BackupSetStatus::Running, None)?;
        store.link_execution_to_set(execution_id, id)?;
        id
    };

    let sequence_number = 1u32;
    let segment_id = {
        let store = pipeline.store.lock().unwrap();
        store.add_tape_segment(set_id, tape.id, sequence_number, start_file_number)?
    };

    Ok(OpenSet { set_id, start_file_number, tape, segment_id, sequence_number, toc })
}

/// Continues a `backup_set` an earlier execution left without reaching
/// `finish_backup_set` (§4.5, §8 scenario 6): a cooperative pause/cancel
/// closes its last segment cleanly, a crash does not. Either way a
/// successor segment is opened in the same set, the same way the
/// Spanning Coordinator opens a new segment at a tape-full boundary --
/// a still-open segment is additionally closed first, where the device
/// now sits, since its tail past the last checkpointed file is not a
/// trustworthy stream continuation.
fn resume_interrupted_set(
    pipeline: &BackupPipeline,
    drive_id: i64,
    slot: &mut DriveSlot,
    set_id: i64,
    resume_state: &ResumeState,
) -> Result<OpenSet> {
    let tape = {
        let store = pipeline.store.lock().unwrap();
        store.get_tape(resume_state.tape_id)?.ok_or_else(|| {
            anyhow!(TapeBackArrError::InternalError(format!("resume tape {} not found", resume_state.tape_id)))
        })?
    };

    ensure_tape_loaded(pipeline, slot, drive_id, &tape)?;

    let last_segment = {
        let store = pipeline.store.lock().unwrap();
        store
            .list_segments_for_set(set_id)?
            .into_iter()
            .max_by_key(|s| s.sequence_number)
            .ok_or_else(|| anyhow!(TapeBackArrError::InternalError(format!("backup set {set_id} has no segments to resume"))))?
    };

    if last_segment.end_file_number.is_none() {
        let status = slot.device_mut().status()?;
        let store = pipeline.store.lock().unwrap();
        store.close_tape_segment(last_segment.id, status.file_number)?;
    }
    {
        let store = pipeline.store.lock().unwrap();
        store.set_backup_set_status(set_id, BackupSetStatus::Running, None)?;
    }

    let start_file_number = {
        let store = pipeline.store.lock().unwrap();
        next_file_number_for_tape(&store, tape.id)?
    };
    slot.device_mut().seek_to_file(start_file_number)?;
    let toc = slot.device_mut().read_toc().unwrap_or_else(|_| Toc::new(tape.uuid));

    let sequence_number = last_segment.sequence_number + 1;
    let segment_id = {
        let store = pipeline.store.lock().unwrap();
        store.add_tape_segment(set_id, tape.id, sequence_number, start_file_number)?
    };

    Ok(OpenSet { set_id, start_file_number, tape, segment_id, sequence_number, toc })
}

/// Runs one backup set to completion (or to `cancel`, or to a fatal
/// error). `encryption` is `None` for an unencrypted pool. If
/// `execution_id` has a compatible, still-open `ResumeState` on record,
/// continues that set instead of opening a new one and skips files
/// already cataloged up to its checkpoint (§4.5, §8 scenario 6).
pub fn run_backup(
    pipeline: &BackupPipeline,
    job: &BackupJob,
    execution_id: i64,
    drive_id: i64,
    slot: &mut DriveSlot,
    compression: CompressionType,
    encryption: Option<&EncryptionSpec>,
    cancel: &AtomicBool,
) -> Result<BackupOutcome> {
    let now = pipeline.clock.now();

    let execution = {
        let store = pipeline.store.lock().unwrap();
        store.get_execution(execution_id)?
    };
    let resume_cursor: Option<(i64, ResumeState)> = execution
        .and_then(|e| e.backup_set_id.zip(e.resume_state))
        .filter(|(_, rs)| rs.is_compatible());

    let OpenSet { set_id, tape, segment_id, sequence_number, toc, .. } = match &resume_cursor {
        Some((set_id, resume_state)) => resume_interrupted_set(pipeline, drive_id, slot, *set_id, resume_state)?,
        None => begin_fresh_set(pipeline, job, execution_id, drive_id, slot, compression, encryption, now)?,
    };

    let files = scan_source(&job.source)?;
    let prior_snapshot = { pipeline.store.lock().unwrap().get_snapshot(job.id)? };
    let mut to_write: Vec<_> = diff_against_snapshot(&files, job.backup_type, prior_snapshot.as_ref())
        .into_iter()
        .cloned()
        .collect();
    if let Some((_, resume_state)) = &resume_cursor {
        let last_completed = resume_state.last_completed_path.as_str();
        to_write.retain(|f| f.relative_path.as_str() > last_completed);
    }

    let mut checksums: HashMap<String, String> = HashMap::new();
    let mut files_written = 0u64;
    let mut bytes_written = 0u64;
    let mut last_checkpoint = now;
    let mut cancelled = false;

    // Mutable state the spanning callback updates in place when the
    // drive hits end-of-tape mid-stream; `Rc<RefCell<_>>` rather than a
    // plain capture because both the callback and the code after the
    // write loop need to read the latest tape/segment/TOC.
    let span_state = Rc::new(RefCell::new(SpanState { tape: tape.clone(), segment_id, sequence_number, toc }));
    let span_for_cb = span_state.clone();
    let store = pipeline.store.clone();
    let clock = pipeline.clock.clone();
    let operator = pipeline.operator.clone();
    let operator_change_timeout = pipeline.operator_change_timeout;
    let pool_id = job.pool_id;
    let span_drive_id = drive_id;

    let on_media_full = move |slot: &mut DriveSlot| -> Result<(), TapeBackArrError> {
        let finish_at = clock.now();
        let status = slot.device_mut().status()?;
        let mut state = span_for_cb.borrow_mut();
        {
            let guard = store.lock().unwrap();
            guard
                .close_tape_segment(state.segment_id, status.file_number)
                .map_err(|e| TapeBackArrError::InternalError(e.to_string()))?;
        }
        slot.device_mut().write_toc(&state.toc)?;
        slot.device_mut().write_file_mark()?;

        let successor = {
            let guard = store.lock().unwrap();
            MediaPool::new(&guard, pool_id)
                .alloc_writable_tape(finish_at)
                .map_err(|e| TapeBackArrError::InternalError(e.to_string()))?
        };
        operator.request_media_change(span_drive_id, &successor.label, operator_change_timeout)?;

        let label = slot.device_mut().read_label(true)?;
        let start_file_number = if let Some(existing) = label {
            if existing.uuid != successor.uuid {
                return Err(TapeBackArrError::WrongTape { expected: successor.uuid, found: Some(existing.uuid) });
            }
            let guard = store.lock().unwrap();
            guard
                .transition_tape_status(successor.id, TapeStatus::Active, false)
                .map_err(|e| TapeBackArrError::InternalError(e.to_string()))?;
            next_file_number_for_tape(&guard, successor.id).map_err(|e| TapeBackArrError::InternalError(e.to_string()))?
        } else {
            let fresh = TapeLabel::new(&successor.label, successor.uuid, &pool_id.to_string(), finish_at);
            slot.device_mut().write_label(&fresh)?;
            let guard = store.lock().unwrap();
            guard
                .transition_tape_status(successor.id, TapeStatus::Active, false)
                .map_err(|e| TapeBackArrError::InternalError(e.to_string()))?;
            1
        };
        slot.device_mut().seek_to_file(start_file_number)?;
        state.toc = Toc::new(successor.uuid);
        state.sequence_number += 1;
        state.segment_id = {
            let guard = store.lock().unwrap();
            guard
                .add_tape_segment(set_id, successor.id, state.sequence_number, start_file_number)
                .map_err(|e| TapeBackArrError::InternalError(e.to_string()))?
        };
        state.tape = successor;
        Ok(())
    };

    let block_writer = TapeBlockWriter::with_spanning(slot, on_media_full);
    let mut archive = ArchiveWriter::new(block_writer, compression, encryption)?;

    for file in &to_write {
        if cancel.load(Ordering::SeqCst) {
            cancelled = true;
            break;
        }
        let data = fs::read(&file.absolute_path).with_context(|| format!("reading {:?}", file.absolute_path))?;
        let checksum = sha256_hex(&data);
        archive.append_file(&file.relative_path, &data, file.mtime, file.mode)?;

        {
            let store = pipeline.store.lock().unwrap();
            store.add_catalog_entry(set_id, &file.relative_path, file.size, file.mode, file.mtime, &checksum, bytes_written)?;
        }
        checksums.insert(file.relative_path.clone(), checksum);
        files_written += 1;
        bytes_written += data.len() as u64;

        let tick = pipeline.clock.now();
        if tick - last_checkpoint >= pipeline.checkpoint_interval_seconds {
            last_checkpoint = tick;
            let store = pipeline.store.lock().unwrap();
            store.record_execution_progress(execution_id, files_written, bytes_written)?;
            store.save_resume_state(
                execution_id,
                Some(&ResumeState {
                    version: ResumeState::CURRENT_VERSION,
                    last_completed_path: file.relative_path.clone(),
                    tape_id: span_state.borrow().tape.id,
                    file_number: 0,
                    block_number: 0,
                    codec_state_digest: None,
                }),
            )?;
        }
    }

    let (mut block_writer, gcm_tag) = archive.finish()?;
    let encryption_tag = gcm_tag.map(hex::encode);
    block_writer.flush()?;
    let slot = block_writer.into_slot();

    let segment_end = slot.device_mut().status()?.file_number;
    slot.device_mut().write_file_mark()?;

    let mut state = span_state.borrow_mut();
    state.toc.sets.push(TocBackupSetEntry {
        backup_set_uuid: uuid_for_set(set_id),
        job_name: job.name.clone(),
        encrypted: encryption.is_some(),
        compressed: compression != CompressionType::None,
        files: to_write
            .iter()
            .map(|f| TocFileEntry {
                path: f.relative_path.clone(),
                size: f.size,
                mtime: f.mtime,
                checksum: checksums.get(&f.relative_path).cloned().unwrap_or_default(),
            })
            .collect(),
    });
    slot.device_mut().write_toc(&state.toc)?;
    slot.device_mut().write_file_mark()?;

    let final_tape_id = state.tape.id;
    let final_segment_id = state.segment_id;
    drop(state);

    let store = pipeline.store.lock().unwrap();
    store.close_tape_segment(final_segment_id, segment_end)?;
    store.record_tape_write(final_tape_id, bytes_written, now)?;

    if cancelled {
        let reason = TapeBackArrError::CancelRequested;
        store.set_backup_set_status(set_id, BackupSetStatus::Cancelled, Some(pipeline.clock.now()))?;
        pipeline.audit.append(
            "system",
            "backup.cancelled",
            "backup_set",
            &set_id.to_string(),
            json!({ "files_written": files_written, "bytes_written": bytes_written, "reason": reason.kind_name() }),
        )?;
        return Ok(BackupOutcome { backup_set_id: set_id, files_written, bytes_written, cancelled: true });
    }

    // Totals cover the whole set, not just this leg -- a resumed run's
    // `files_written`/`bytes_written` only count files streamed this
    // call, while `catalog_entries` already holds whatever a prior leg
    // cataloged before it stopped. `list_entries_for_set` orders by path,
    // so the checksum is stable regardless of write or resume order.
    let all_entries = store.list_entries_for_set(set_id)?;
    let total_file_count = all_entries.len() as u64;
    let total_bytes = all_entries.iter().map(|e| e.size).sum();
    let overall_checksum =
        sha256_hex(all_entries.iter().fold(String::new(), |mut acc, e| { acc.push_str(&e.checksum); acc }).as_bytes());
    store.finish_backup_set(
        set_id,
        pipeline.clock.now(),
        total_file_count,
        total_bytes,
        segment_end,
        &overall_checksum,
        encryption_tag.as_deref(),
    )?;

    let snapshot: SnapshotManifest = build_snapshot(&files, &checksums, prior_snapshot.as_ref());
    store.replace_snapshot(job.id, &snapshot, pipeline.clock.now())?;

    pipeline.audit.append(
        "system",
        "backup.completed",
        "backup_set",
        &set_id.to_string(),
        json!({ "files_written": files_written, "bytes_written": bytes_written }),
    )?;

    Ok(BackupOutcome { backup_set_id: set_id, files_written, bytes_written, cancelled: false })
}

/// `BackupSet` rows have no UUID column of their own (the id is the
/// catalog's own primary key); the TOC's `backup_set_uuid` field exists
/// for a tape read in isolation from the catalog, so it is derived
/// deterministically from the row id rather than invented at write time.
fn uuid_for_set(set_id: i64) -> uuid::Uuid {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, set_id.to_string().as_bytes())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::sync::atomic::AtomicBool;

    use tbarr_catalog::NewTape;
    use tbarr_tape::VirtualTapeDevice;
    use tbarr_types::{BackupSource, SourceType};
    use tempfile::tempdir;
    use uuid::Uuid;

    use crate::collaborators::{ChannelOperatorPrompt, TestClock};
    use crate::tape::DriveSlot;

    struct NullAudit;
    impl AuditSink for NullAudit {
        fn append(&self, _: &str, _: &str, _: &str, _: &str, _: serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn full_backup_writes_a_completed_set_on_a_single_tape() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        fs::write(dir.path().join("b.txt"), b"second file").unwrap();

        let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
        let (pool_id, job_id) = {
            let store = store.lock().unwrap();
            let pool_id = store.create_pool("DAILY", None).unwrap();
            store
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
            let job_id = store
                .create_job(
                    "nightly",
                    &BackupSource {
                        path: dir.path().to_string_lossy().to_string(),
                        include: vec![],
                        exclude: vec![],
                        source_type: SourceType::Local,
                    },
                    pool_id,
                    BackupType::Full,
                    None,
                    None,
                )
                .unwrap();
            (pool_id, job_id)
        };
        let job = { store.lock().unwrap().get_job(job_id).unwrap().unwrap() };
        let _ = pool_id;

        let execution_id = { store.lock().unwrap().begin_execution(job_id, 1000).unwrap() };

        let (prompt, _tx) = ChannelOperatorPrompt::new();
        let pipeline = BackupPipeline {
            store: store.clone(),
            clock: Arc::new(TestClock::new(1000)),
            audit: Arc::new(NullAudit),
            operator: Arc::new(prompt),
            operator_change_timeout: Duration::from_secs(1),
            checkpoint_interval_seconds: 3600,
        };

        let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(50 * 1024 * 1024)));
        let cancel = AtomicBool::new(false);
        let outcome = run_backup(&pipeline, &job, execution_id, 1, &mut slot, CompressionType::None, None, &cancel).unwrap();

        assert_eq!(outcome.files_written, 2);
        assert!(!outcome.cancelled);

        let store = store.lock().unwrap();
        let set = store.get_backup_set(outcome.backup_set_id).unwrap().unwrap();
        assert_eq!(set.status, BackupSetStatus::Completed);
        assert_eq!(set.file_count, 2);
        assert!(store.get_snapshot(job_id).unwrap().is_some());
    }

    #[test]
    fn incremental_with_no_changes_completes_with_zero_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();

        let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
        let (pool_id, job_id) = {
            let store = store.lock().unwrap();
            let pool_id = store.create_pool("DAILY", None).unwrap();
            store
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
            let job_id = store
                .create_job(
                    "nightly",
                    &BackupSource {
                        path: dir.path().to_string_lossy().to_string(),
                        include: vec![],
                        exclude: vec![],
                        source_type: SourceType::Local,
                    },
                    pool_id,
                    BackupType::Incremental,
                    None,
                    None,
                )
                .unwrap();
            (pool_id, job_id)
        };
        let _ = pool_id;
        let job = { store.lock().unwrap().get_job(job_id).unwrap().unwrap() };

        let (prompt, _tx) = ChannelOperatorPrompt::new();
        let pipeline = BackupPipeline {
            store: store.clone(),
            clock: Arc::new(TestClock::new(1000)),
            audit: Arc::new(NullAudit),
            operator: Arc::new(prompt),
            operator_change_timeout: Duration::from_secs(1),
            checkpoint_interval_seconds: 3600,
        };

        let mut slot = DriveSlot::new(Box::new(VirtualTapeDevice::new(50 * 1024 * 1024)));
        let cancel = AtomicBool::new(false);
        let exec1 = { store.lock().unwrap().begin_execution(job_id, 1000).unwrap() };
        run_backup(&pipeline, &job, exec1, 1, &mut slot, CompressionType::None, None, &cancel).unwrap();

        let exec2 = { store.lock().unwrap().begin_execution(job_id, 2000).unwrap() };
        let outcome = run_backup(&pipeline, &job, exec2, 1, &mut slot, CompressionType::None, None, &cancel).unwrap();
        assert_eq!(outcome.files_written, 0);
    }
}
