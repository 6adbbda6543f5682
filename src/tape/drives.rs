//! Drive Registry (§5): exclusive reservation of a physical drive for the
//! duration of one execution. Reservations are released on `Drop`, so a
//! panicking worker cannot leak a held drive; a startup recovery sweep
//! additionally clears reservations left behind by a process that died
//! without unwinding (a killed `-9`, a host crash).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tbarr_tape::TapeDevice;
use tbarr_types::TapeBackArrError;

/// The tape device currently sitting in a physical (or virtual) drive
/// slot. Holding the device behind one indirection lets the Spanning
/// Coordinator swap in a successor tape mid-stream (§4.5 step 5) while
/// every `TapeBlockWriter`/`TapeBlockReader` built against this slot
/// keeps writing to whatever device is loaded *now*, with no need to
/// restart the codec chain riding on top of it.
pub struct DriveSlot {
    device: Box<dyn TapeDevice>,
}

impl DriveSlot {
    pub fn new(device: Box<dyn TapeDevice>) -> Self {
        Self { device }
    }

    pub fn device_mut(&mut self) -> &mut dyn TapeDevice {
        &mut *self.device
    }

    /// Replaces the loaded device (an operator physically swapping
    /// media, or a test harness simulating one) and returns the one that
    /// was there before.
    pub fn swap(&mut self, device: Box<dyn TapeDevice>) -> Box<dyn TapeDevice> {
        std::mem::replace(&mut self.device, device)
    }
}

struct Reservation {
    execution_id: i64,
    acquired_at: i64,
}

/// Tracks which drive each active execution holds. This is in-process
/// state (§5 "There is no shared mutable state outside the catalog store
/// and the drive registry") -- it does not itself persist to the
/// catalog; the catalog's `drives.status` column is updated alongside it
/// so an external viewer sees the same picture.
pub struct DriveRegistry {
    inner: Mutex<HashMap<i64, Reservation>>,
}

impl DriveRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(HashMap::new()) })
    }

    /// Reserves `drive_id` for `execution_id`, or `DriveBusy` if another
    /// execution already holds it. Dropping the returned guard releases
    /// the reservation.
    pub fn reserve(self: &Arc<Self>, drive_id: i64, execution_id: i64, now: i64) -> Result<DriveReservation, TapeBackArrError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.contains_key(&drive_id) {
            return Err(TapeBackArrError::DriveBusy);
        }
        inner.insert(drive_id, Reservation { execution_id, acquired_at: now });
        Ok(DriveReservation { registry: self.clone(), drive_id })
    }

    /// True if some execution currently holds `drive_id`.
    pub fn is_reserved(&self, drive_id: i64) -> bool {
        self.inner.lock().unwrap().contains_key(&drive_id)
    }

    /// Startup recovery sweep (§5): releases every reservation, since a
    /// fresh process has no worker threads yet to legitimately hold one.
    /// Call once before accepting new executions.
    pub fn clear_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.len();
        inner.clear();
        if count > 0 {
            log::warn!("drive registry: cleared {count} stale reservation(s) at startup");
        }
    }
}

/// RAII guard for a reserved drive. Holding one is the precondition for
/// issuing any `TapeDevice` operation on that drive (§5).
pub struct DriveReservation {
    registry: Arc<DriveRegistry>,
    drive_id: i64,
}

impl DriveReservation {
    pub fn drive_id(&self) -> i64 {
        self.drive_id
    }
}

impl Drop for DriveReservation {
    fn drop(&mut self) {
        self.registry.inner.lock().unwrap().remove(&self.drive_id);
    }
}
