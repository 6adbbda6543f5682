//! Entities of §3: attributes, relationships, and the enums their status
//! fields range over. These are plain data -- persistence lives in
//! `tbarr-catalog`, on-tape wire structs live in `tbarr-tape`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Fingerprint, Timestamp};

/// A policy group for tapes (§3 Pool).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pool {
    pub id: i64,
    pub name: String,
    pub retention_days: Option<u32>,
}

/// Lifecycle status of a `Tape`, enforced by the state machine in §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapeStatus {
    Blank,
    Active,
    Full,
    Expired,
    Retired,
    Exported,
}

impl TapeStatus {
    /// Whether `self -> next` is a transition the orchestrator's state
    /// machine (§4.7) allows. `manual` is true for operator-initiated
    /// transitions (which permit the `retired` override and arbitrary
    /// `exported` reimport).
    pub fn can_transition(self, next: TapeStatus, manual: bool) -> bool {
        use TapeStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            // erasing back to `blank` must go through a dedicated,
            // explicitly audited operation -- never this state machine.
            (_, Blank) => false,
            (Blank, Active) => true,
            (Active, Full) => true,
            (Active, Expired) => true,
            (Full, Expired) => true,
            (Expired, Retired) => true,
            (Active, Exported) | (Full, Exported) => true,
            (Exported, Active) | (Exported, Full) => true,
            (Retired, _) => manual,
            _ => manual,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionType {
    None,
    Gzip,
    Zstd,
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CompressionType::None => "none",
            CompressionType::Gzip => "gzip",
            CompressionType::Zstd => "zstd",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CompressionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" | "" => Ok(CompressionType::None),
            "gzip" => Ok(CompressionType::Gzip),
            "zstd" => Ok(CompressionType::Zstd),
            other => anyhow::bail!("unknown compression type '{}'", other),
        }
    }
}

/// Physical cartridge (§3 Tape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tape {
    pub id: i64,
    pub uuid: Uuid,
    pub barcode: Option<String>,
    pub label: String,
    pub pool_id: i64,
    pub status: TapeStatus,
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub write_count: u32,
    pub last_written_at: Option<Timestamp>,
    pub offsite_location: Option<String>,
    pub encryption_key_fingerprint: Option<Fingerprint>,
    pub compression_type: CompressionType,
    pub lto_generation: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveOperationalStatus {
    Ready,
    Busy,
    Offline,
    Error,
}

/// Configured tape device path (§3 Drive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub id: i64,
    pub device_path: String,
    pub display_name: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
    pub enabled: bool,
    pub current_tape: Option<Uuid>,
    pub status: DriveOperationalStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Local,
    Smb,
    Nfs,
}

/// A path plus glob filters and a source type tag (§3 BackupSource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSource {
    pub path: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub source_type: SourceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

/// Job definition pairing a source with a target pool (§3 BackupJob).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: i64,
    pub name: String,
    pub source: BackupSource,
    pub pool_id: i64,
    pub backup_type: BackupType,
    /// 6-field cron expression (seconds minute hour day month dow), or
    /// `None` for manual-only jobs.
    pub schedule: Option<String>,
    pub retention_days: Option<u32>,
    pub enabled: bool,
    pub last_run: Option<Timestamp>,
    pub next_run: Option<Timestamp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupSetStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One execution of a job's data write (§3 BackupSet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSet {
    pub id: i64,
    pub job_id: i64,
    pub primary_tape_id: i64,
    pub backup_type: BackupType,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub status: BackupSetStatus,
    pub file_count: u64,
    pub total_bytes: u64,
    pub start_file_number: u64,
    pub end_file_number: Option<u64>,
    pub parent_set_id: Option<i64>,
    pub checksum: Option<String>,
    pub encryption_key_id: Option<i64>,
    /// Hex-encoded AES-GCM tag for the set's single continuous cipher
    /// stream, `None` for an unencrypted set (§4.2).
    pub encryption_tag: Option<String>,
    pub compression_type: CompressionType,
}

/// Maps a backup set to a (tape, sequence_number, file range) tuple for
/// spanning (§3 TapeSegment). `sequence_number`s for a set form a
/// contiguous range starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TapeSegment {
    pub id: i64,
    pub backup_set_id: i64,
    pub tape_id: i64,
    pub sequence_number: u32,
    pub start_file_number: u64,
    pub end_file_number: Option<u64>,
}

/// One file captured in a backup set (§3 CatalogEntry). Uniqueness:
/// `(backup_set_id, path)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub id: i64,
    pub backup_set_id: i64,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub mtime: Timestamp,
    pub checksum: String,
    pub block_offset: u64,
}

/// One file's metadata as captured in a `Snapshot` manifest (§3 Snapshot).
/// Checksum is not used for incremental change detection (§4.4) but is
/// still carried so a snapshot can answer "what did we last see" without
/// re-reading the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFileMeta {
    pub size: u64,
    pub mtime: Timestamp,
    pub checksum: Option<String>,
}

/// A compressed manifest of `path -> metadata` for a source, used to
/// compute the next incremental diff (§3 Snapshot, §4.4).
pub type SnapshotManifest = std::collections::BTreeMap<String, SnapshotFileMeta>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Paused,
}

/// Opaque, versioned resume cursor owned by a `JobExecution` (§3, §4.5,
/// §9). Only the pipeline that wrote it interprets the body; an
/// unrecognized `version` yields `cannot_resume` rather than guessing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u32,
    pub last_completed_path: String,
    pub tape_id: i64,
    pub file_number: u64,
    pub block_number: u64,
    /// Opaque codec-state digest (e.g. encryption nonce), carried but not
    /// interpreted outside the codec layer.
    pub codec_state_digest: Option<String>,
}

impl ResumeState {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn is_compatible(&self) -> bool {
        self.version == Self::CURRENT_VERSION
    }
}

/// An in-flight or terminated execution record (§3 JobExecution).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: i64,
    pub job_id: i64,
    pub backup_set_id: Option<i64>,
    pub status: JobExecutionStatus,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
    pub files_processed: u64,
    pub bytes_processed: u64,
    pub error_message: Option<String>,
    pub can_resume: bool,
    pub resume_state: Option<ResumeState>,
}

/// Immutable append-only audit record (§3 AuditLog).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLog {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub resource_kind: String,
    pub resource_id: String,
    pub details: serde_json::Value,
    pub timestamp: Timestamp,
}

/// Drive status snapshot returned by the Tape Device Controller (§4.1).
/// This is the only authoritative position information -- the controller
/// never keeps hidden position state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DriveStatus {
    pub online: bool,
    pub ready: bool,
    pub write_protected: bool,
    pub beginning_of_tape: bool,
    pub end_of_tape: bool,
    pub end_of_file: bool,
    pub file_number: u64,
    pub block_number: u64,
    pub density_code: u8,
    pub block_size: u32,
}
