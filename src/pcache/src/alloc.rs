//! Line allocation: two-phase claim-then-publish.
//!
//! Phase one races a `test_and_set`-style claim of `ALLOCATED` across the
//! set's ways; phase two resets metadata and publishes `USABLE` with release
//! ordering. Anything observing `USABLE=0` treats the line as not present,
//! so a half-initialised line is never visible.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::trace;

use crate::bits::{LineFlags, SetFlags};
use crate::line::LineId;
use crate::set::SetStat;
use crate::{EvictionPolicy, PcacheError, PcacheInner};

/// Claim/evict rounds before allocation gives up.
const ALLOC_RETRIES: usize = 32;

impl PcacheInner {
    /// Claim phase: first free way wins. A way still draining a write-back
    /// is not free.
    pub(crate) fn try_claim_way(&self, set: usize) -> Option<LineId> {
        for way in 0..self.cfg.ways {
            let id = self.line_id(set, way);
            if self.line(id).bits.try_transition(
                LineFlags::ALLOCATED | LineFlags::WRITEBACK,
                LineFlags::ALLOCATED,
            ) {
                return Some(id);
            }
        }
        None
    }

    /// Publish phase: reset metadata, then flip `USABLE` with release so any
    /// reader seeing the bit observes the reset state.
    pub(crate) fn publish_usable(&self, id: LineId) {
        let line = self.line(id);
        debug_assert_eq!(line.mapcount.load(Ordering::Relaxed), 0);
        line.mapcount.store(0, Ordering::Relaxed);
        line.refcount.store(1, Ordering::Relaxed);
        line.bits.set(LineFlags::USABLE, Ordering::Release);
    }

    /// Allocate a line in `set`, evicting when full. Blocks briefly while a
    /// concurrent evictor owns the set.
    pub(crate) fn alloc_line(&self, set: usize) -> Result<LineId, PcacheError> {
        let pset = &self.sets[set];
        pset.stats.inc(SetStat::Alloc);

        for _ in 0..ALLOC_RETRIES {
            if let Some(id) = self.try_claim_way(set) {
                self.publish_usable(id);
                if self.cfg.policy == EvictionPolicy::Lru {
                    pset.lru_insert_mru(self.way_of(id));
                }
                return Ok(id);
            }

            match self.evict_one(set) {
                Ok(()) => continue,
                Err(PcacheError::SetBusy(_)) => {
                    trace!(set, "set under eviction, parking allocator");
                    let mut g = pset.wait_lock.lock();
                    if pset.flags.test(SetFlags::EVICTING, Ordering::Acquire) {
                        let _ = pset
                            .wait_cv
                            .wait_for(&mut g, Duration::from_millis(1));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(PcacheError::NoLine(set))
    }

    /// Drop a claim that never became valid (fetch failure, or a spare
    /// allocation lost to a concurrent fault).
    pub(crate) fn release_claim(&self, id: LineId) {
        if self.cfg.policy == EvictionPolicy::Lru {
            self.sets[self.set_of(id)].lru_remove(self.way_of(id));
        }
        self.finish_free(id);
    }

    /// Final transition to free: `USABLE` then `ALLOCATED`, with the
    /// check-at-free assertion in between observations.
    pub(crate) fn finish_free(&self, id: LineId) {
        let line = self.line(id);
        debug_assert!(
            !line.bits.test(LineFlags::CHECK_AT_FREE, Ordering::Acquire),
            "freeing line {id} with live state bits: {:?}",
            line.bits.load(Ordering::Relaxed)
        );
        line.bits.clear(LineFlags::USABLE, Ordering::Release);
        line.bits.clear(LineFlags::ALLOCATED, Ordering::Release);
        self.sets[self.set_of(id)].wait_cv.notify_all();
    }
}
