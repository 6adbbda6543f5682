//! The closed error-kind set of §7. Lower layers (`tbarr-tape`,
//! `tbarr-codec`, raw I/O) raise `anyhow::Error`; pipeline boundaries
//! convert those into one of these variants before they reach the Job
//! Orchestrator, which is the only thing that needs to distinguish them.

use uuid::Uuid;

/// A distinguishable error kind a caller can branch on. Never constructed
/// from a raw platform error directly -- pipeline stages are responsible
/// for classifying the failure they observed.
#[derive(thiserror::Error, Debug)]
pub enum TapeBackArrError {
    /// A tape operation exceeded the 30s watchdog (§4.1).
    #[error("operation timed out")]
    OperationTimeout,

    /// The tape loaded in the drive does not match the expected media.
    #[error("wrong tape loaded (expected {expected}, found {found:?})")]
    WrongTape {
        expected: Uuid,
        found: Option<Uuid>,
    },

    /// Write reached end-of-tape; never surfaced past the Spanning
    /// Coordinator, which consumes it to trigger spanning.
    #[error("media full at file {file_number}, block {block_number}")]
    MediaFull {
        file_number: u64,
        block_number: u64,
    },

    /// The tape is write-protected.
    #[error("tape is write-protected")]
    WriteProtected,

    /// A drive that should hold a tape is empty.
    #[error("no tape loaded in drive")]
    NoTapeLoaded,

    /// A drive is already reserved by another execution.
    #[error("drive is busy")]
    DriveBusy,

    /// Checksum mismatch while verifying a restored file.
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    IntegrityError {
        path: String,
        expected: String,
        actual: String,
    },

    /// A foreign-key or unique-constraint violation in the catalog store.
    #[error("catalog conflict: {0}")]
    CatalogConflict(String),

    /// Operator requested cancellation.
    #[error("cancel requested")]
    CancelRequested,

    /// A required tape is not available in any drive; restore pauses.
    #[error("tape {uuid} ({label}) is required but not loaded in any drive")]
    TapeRequired { uuid: Uuid, label: String },

    /// Invariant violated -- a programmer error, not a runtime condition.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl TapeBackArrError {
    /// Stable machine-readable name, used for `JobExecution.error_message`
    /// prefixes and audit log details so downstream tooling can match on
    /// kind without parsing the display string.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::OperationTimeout => "OperationTimeout",
            Self::WrongTape { .. } => "WrongTape",
            Self::MediaFull { .. } => "MediaFull",
            Self::WriteProtected => "WriteProtected",
            Self::NoTapeLoaded => "NoTapeLoaded",
            Self::DriveBusy => "DriveBusy",
            Self::IntegrityError { .. } => "IntegrityError",
            Self::CatalogConflict(_) => "CatalogConflict",
            Self::CancelRequested => "CancelRequested",
            Self::TapeRequired { .. } => "TapeRequired",
            Self::InternalError(_) => "InternalError",
        }
    }
}
