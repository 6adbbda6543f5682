//! External collaborator contracts (§6): the seams the core never
//! implements beyond a reference/no-op version. Production deployments
//! supply their own `AuditSink`, `NotificationSink`, `DriveEnumerator`,
//! and `OperatorPrompt`; `Clock` is the one seam every pipeline and the
//! scheduler also use for their own timestamps, mirroring how the teacher
//! injects `proxmox_time::epoch_i64()` everywhere instead of calling
//! `SystemTime::now()` directly.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use tbarr_types::TapeBackArrError;

/// Injectable wall-clock source (§6).
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the epoch")
            .as_secs() as i64
    }
}

/// Settable clock for deterministic scheduler and pipeline tests.
#[derive(Debug)]
pub struct TestClock(AtomicI64);

impl TestClock {
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.0.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Synchronous, must-not-fail-silently audit sink (§6). Every pipeline
/// stage that changes durable state appends one record here in addition
/// to whatever it writes to the catalog's own `audit_log` table.
pub trait AuditSink: Send + Sync {
    fn append(&self, actor: &str, action: &str, resource_kind: &str, resource_id: &str, details: Value) -> anyhow::Result<()>;
}

/// Audit sink that writes straight into the catalog's own append-only
/// table, used when no separate external audit system is configured.
pub struct CatalogAuditSink {
    store: std::sync::Arc<Mutex<tbarr_catalog::CatalogStore>>,
    clock: std::sync::Arc<dyn Clock>,
}

impl CatalogAuditSink {
    pub fn new(store: std::sync::Arc<Mutex<tbarr_catalog::CatalogStore>>, clock: std::sync::Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

impl AuditSink for CatalogAuditSink {
    fn append(&self, actor: &str, action: &str, resource_kind: &str, resource_id: &str, details: Value) -> anyhow::Result<()> {
        let store = self.store.lock().unwrap();
        store.append_audit_log(actor, action, resource_kind, resource_id, &details, self.clock.now())?;
        Ok(())
    }
}

/// Best-effort, asynchronous notification sink (§6). Errors are logged,
/// never propagated -- a failed notification must not fail a backup.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, event_kind: &str, payload: Value);
}

#[derive(Debug, Default)]
pub struct LoggingNotificationSink;

impl NotificationSink for LoggingNotificationSink {
    fn notify(&self, event_kind: &str, payload: Value) {
        log::info!("notification [{event_kind}]: {payload}");
    }
}

/// One physical drive as reported by the platform shim (§6).
#[derive(Debug, Clone)]
pub struct DriveInquiry {
    pub device_path: String,
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

/// Platform shim returning the tape devices visible to this host.
pub trait DriveEnumerator: Send + Sync {
    fn enumerate(&self) -> anyhow::Result<Vec<DriveInquiry>>;
}

/// Fixed inventory, used by tests and single-drive deployments that
/// don't need to probe `/dev` or a changer.
pub struct StaticDriveEnumerator(pub Vec<DriveInquiry>);

impl DriveEnumerator for StaticDriveEnumerator {
    fn enumerate(&self) -> anyhow::Result<Vec<DriveInquiry>> {
        Ok(self.0.clone())
    }
}

/// Blocks the calling worker thread until the operator confirms the
/// requested tape is loaded, or the configured timeout elapses (§4.5, §5).
pub trait OperatorPrompt: Send + Sync {
    fn request_media_change(&self, drive_id: i64, expected_label: &str, timeout: std::time::Duration) -> Result<(), TapeBackArrError>;
}

/// Channel-backed reference implementation: a test drives the prompt by
/// sending on the paired `Sender` once it has "loaded" the successor
/// tape into the virtual device under test.
pub struct ChannelOperatorPrompt {
    receiver: Mutex<Receiver<()>>,
}

impl ChannelOperatorPrompt {
    pub fn new() -> (Self, Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { receiver: Mutex::new(rx) }, tx)
    }
}

impl OperatorPrompt for ChannelOperatorPrompt {
    fn request_media_change(&self, _drive_id: i64, _expected_label: &str, timeout: std::time::Duration) -> Result<(), TapeBackArrError> {
        self.receiver
            .lock()
            .unwrap()
            .recv_timeout(timeout)
            .map_err(|_| TapeBackArrError::OperationTimeout)
    }
}
