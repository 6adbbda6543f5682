//! Restore Pipeline (§4.6): plans which tapes carry a backup set's data
//! in what order, then extracts matching files through the codec layer,
//! spanning transparently across the same tape boundaries the Backup
//! Pipeline wrote.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use openssl::sha::Sha256;

use tbarr_catalog::CatalogStore;
use tbarr_codec::{ArchiveReader, EncryptionSpec};
use tbarr_types::{CatalogEntry, CompressionType, TapeBackArrError, TapeSegment};

use crate::collaborators::OperatorPrompt;
use crate::tape::{DriveSlot, TapeBlockReader};

pub struct RestorePipeline {
    pub store: Arc<Mutex<CatalogStore>>,
    pub operator: Arc<dyn OperatorPrompt>,
    pub operator_change_timeout: Duration,
}

/// One tape to load, in the order the Backup Pipeline wrote its segments.
#[derive(Debug, Clone)]
pub struct PlannedTape {
    pub tape_id: i64,
    pub sequence_number: u32,
    pub start_file_number: u64,
}

/// Resolved plan for restoring one backup set (§4.6 step 1). The archive
/// is a single continuous stream across every planned tape, so the plan
/// does not attempt to say which tape holds which byte range of which
/// file -- it only orders the tapes and lists which catalog entries the
/// execute step should keep (skipping the rest of the stream as it
/// passes).
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub backup_set_id: i64,
    pub tapes: Vec<PlannedTape>,
    pub matched_entries: Vec<CatalogEntry>,
    pub total_bytes: u64,
}

pub struct RestoreOutcome {
    pub files_restored: u64,
    pub bytes_restored: u64,
    pub checksum_mismatches: Vec<String>,
}

/// Resolves a requested set of paths (wildcards accepted) against one
/// backup set's catalog entries, then orders the set's tapes by the
/// sequence the Backup Pipeline wrote them in (§4.6 step 1).
pub fn plan_restore(store: &CatalogStore, backup_set_id: i64, path_patterns: &[String]) -> Result<RestorePlan> {
    let all_entries = store.list_entries_for_set(backup_set_id)?;
    let matched_entries: Vec<CatalogEntry> = if path_patterns.is_empty() {
        all_entries
    } else {
        all_entries
            .into_iter()
            .filter(|e| path_patterns.iter().any(|p| tbarr_types::glob::glob_match(p, &e.path)))
            .collect()
    };

    let mut segments = store.list_segments_for_set(backup_set_id)?;
    segments.sort_by_key(|s| s.sequence_number);
    let tapes = segments
        .iter()
        .map(|s: &TapeSegment| PlannedTape {
            tape_id: s.tape_id,
            sequence_number: s.sequence_number,
            start_file_number: s.start_file_number,
        })
        .collect();

    let total_bytes = matched_entries.iter().map(|e| e.size).sum();
    Ok(RestorePlan { backup_set_id, tapes, matched_entries, total_bytes })
}

/// Confirms the tape physically loaded in `slot` is the one the plan
/// expects; a mismatch pauses the restore with `WrongTape` rather than
/// guessing (§4.6 failure semantics, §5).
fn ensure_expected_tape_loaded(
    pipeline: &RestorePipeline,
    slot: &mut DriveSlot,
    drive_id: i64,
    expected_uuid: uuid::Uuid,
    expected_label: &str,
) -> Result<()> {
    let found = slot.device_mut().read_label(false)?;
    if found.as_ref().map(|l| l.uuid) == Some(expected_uuid) {
        return Ok(());
    }
    pipeline
        .operator
        .request_media_change(drive_id, expected_label, pipeline.operator_change_timeout)
        .map_err(|e| anyhow!(e))?;
    let relabel = slot.device_mut().read_label(true)?;
    match relabel {
        Some(l) if l.uuid == expected_uuid => Ok(()),
        other => Err(anyhow!(TapeBackArrError::WrongTape { expected: expected_uuid, found: other.map(|l| l.uuid) })),
    }
}

/// Executes a resolved plan (§4.6 steps 2-4): loads each tape in order,
/// positions to its segment, and streams the set's archive through the
/// codec layer, writing matched entries to `destination` and optionally
/// re-checking their SHA-256 against the catalog value.
pub fn run_restore(
    pipeline: &RestorePipeline,
    drive_id: i64,
    slot: &mut DriveSlot,
    plan: &RestorePlan,
    destination: &Path,
    compression: CompressionType,
    encryption: Option<(&EncryptionSpec, [u8; 16])>,
    verify: bool,
    strict: bool,
) -> Result<RestoreOutcome> {
    let Some(first) = plan.tapes.first() else {
        return Ok(RestoreOutcome { files_restored: 0, bytes_restored: 0, checksum_mismatches: Vec::new() });
    };

    let tape_for = |store: &CatalogStore, tape_id: i64| -> Result<(uuid::Uuid, String)> {
        let tape = store.get_tape(tape_id)?.ok_or_else(|| anyhow!("no such tape {tape_id}"))?;
        Ok((tape.uuid, tape.label))
    };

    {
        let store = pipeline.store.lock().unwrap();
        let (uuid, label) = tape_for(&store, first.tape_id)?;
        drop(store);
        ensure_expected_tape_loaded(pipeline, slot, drive_id, uuid, &label)?;
    }
    slot.device_mut().seek_to_file(first.start_file_number)?;

    // Tapes after the first, consumed in order as the reader hits file
    // marks mid-stream. `remaining` lives behind a `Mutex` rather than a
    // plain capture because the spanning callback below needs `FnMut`
    // while the rest of this function only ever calls it, never reads it
    // directly.
    let remaining = Mutex::new(plan.tapes[1..].to_vec());
    let store = pipeline.store.clone();
    let operator = pipeline.operator.clone();
    let operator_change_timeout = pipeline.operator_change_timeout;

    let on_file_mark = move |slot: &mut DriveSlot| -> Result<bool, TapeBackArrError> {
        let next = {
            let mut queue = remaining.lock().unwrap();
            if queue.is_empty() {
                return Ok(false);
            }
            queue.remove(0)
        };
        let (uuid, label) = {
            let guard = store.lock().unwrap();
            let tape = guard
                .get_tape(next.tape_id)
                .map_err(|e| TapeBackArrError::InternalError(e.to_string()))?
                .ok_or_else(|| TapeBackArrError::InternalError(format!("no such tape {}", next.tape_id)))?;
            (tape.uuid, tape.label)
        };
        let found = slot.device_mut().read_label(false)?;
        if found.as_ref().map(|l| l.uuid) != Some(uuid) {
            operator.request_media_change(drive_id, &label, operator_change_timeout)?;
            let relabel = slot.device_mut().read_label(true)?;
            if relabel.map(|l| l.uuid) != Some(uuid) {
                return Err(TapeBackArrError::TapeRequired { uuid, label });
            }
        }
        slot.device_mut().seek_to_file(next.start_file_number)?;
        Ok(true)
    };

    let block_reader = TapeBlockReader::with_spanning(slot, on_file_mark);
    let mut archive = ArchiveReader::new(block_reader, compression, encryption)?;

    let wanted: std::collections::HashMap<&str, &CatalogEntry> =
        plan.matched_entries.iter().map(|e| (e.path.as_str(), e)).collect();

    let mut files_restored = 0u64;
    let mut bytes_restored = 0u64;
    let mut checksum_mismatches = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path_in_archive = entry.path()?.to_string_lossy().into_owned();
        let Some(catalog_entry) = wanted.get(path_in_archive.as_str()) else {
            continue;
        };

        let mut contents = Vec::with_capacity(catalog_entry.size as usize);
        entry.read_to_end(&mut contents)?;

        if verify {
            let actual = sha256_hex(&contents);
            if actual != catalog_entry.checksum {
                let message = format!("{path_in_archive}: expected {}, got {actual}", catalog_entry.checksum);
                if strict {
                    return Err(anyhow!(TapeBackArrError::IntegrityError {
                        path: path_in_archive,
                        expected: catalog_entry.checksum.clone(),
                        actual,
                    }));
                }
                checksum_mismatches.push(message);
            }
        }

        let dest_path = destination.join(&path_in_archive);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
        }
        fs::write(&dest_path, &contents).with_context(|| format!("writing {dest_path:?}"))?;

        files_restored += 1;
        bytes_restored += contents.len() as u64;
    }

    Ok(RestoreOutcome { files_restored, bytes_restored, checksum_mismatches })
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finish())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use tbarr_catalog::NewTape;
    use tbarr_tape::VirtualTapeDevice;
    use tbarr_types::{BackupSource, BackupType, CompressionType, SourceType};
    use tempfile::tempdir;
    use uuid::Uuid;

    use crate::backup::{run_backup, BackupPipeline};
    use crate::collaborators::{AuditSink, ChannelOperatorPrompt, TestClock};
    use std::sync::atomic::AtomicBool;

    struct NullAudit;
    impl AuditSink for NullAudit {
        fn append(&self, _: &str, _: &str, _: &str, _: &str, _: serde_json::Value) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn restores_every_file_from_a_single_tape_backup() {
        let source_dir = tempdir().unwrap();
        fs::write(source_dir.path().join("a.txt"), b"hello world").unwrap();
        fs::write(source_dir.path().join("b.txt"), b"second file").unwrap();
        let dest_dir = tempdir().unwrap();

        let store = Arc::new(Mutex::new(CatalogStore::open_in_memory().unwrap()));
        let (job_id, backup_set_id) = {
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
            let job_id = guard
                .create_job(
                    "nightly",
                    &BackupSource {
                        path: source_dir.path().to_string_lossy().to_string(),
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
            (job_id, 0)
        };
        let _ = backup_set_id;
        let job = { store.lock().unwrap().get_job(job_id).unwrap().unwrap() };
        let execution_id = { store.lock().unwrap().begin_execution(job_id, 1000).unwrap() };

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

        let (restore_prompt, _tx2) = ChannelOperatorPrompt::new();
        let restore_pipeline = RestorePipeline {
            store: store.clone(),
            operator: Arc::new(restore_prompt),
            operator_change_timeout: Duration::from_secs(1),
        };
        let plan = { plan_restore(&store.lock().unwrap(), outcome.backup_set_id, &[]).unwrap() };
        assert_eq!(plan.matched_entries.len(), 2);

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

        assert_eq!(restore_outcome.files_restored, 2);
        assert!(restore_outcome.checksum_mismatches.is_empty());
        assert_eq!(fs::read(dest_dir.path().join("a.txt")).unwrap(), b"hello world");
        assert_eq!(fs::read(dest_dir.path().join("b.txt")).unwrap(), b"second file");
    }
}
