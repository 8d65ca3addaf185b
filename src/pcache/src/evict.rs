//! Victim selection and line teardown.
//!
//! `RECLAIM` is the single ownership bit for tearing a particular line down;
//! `EVICTING` on the set serialises whole-set eviction attempts. Selection
//! differs per policy, teardown is common: unmap every rmap entry, write
//! back dirty contents, then walk the bits back to free in order
//! (`VALID`, `USABLE`, `ALLOCATED`) and wake allocator waiters.

use std::sync::atomic::Ordering;

use tracing::trace;

use crate::bits::{LineFlags, SetFlags};
use crate::line::LineId;
use crate::rmap::RmapEntry;
use crate::set::{PendingEviction, SetStat, VictimSlot};
use crate::{EvictionPolicy, PcacheError, PcacheInner, WbJob};

const EVICTABLE: LineFlags = LineFlags::ALLOCATED
    .union(LineFlags::USABLE)
    .union(LineFlags::VALID);

const UNEVICTABLE: LineFlags = LineFlags::LOCKED
    .union(LineFlags::RECLAIM)
    .union(LineFlags::WRITEBACK);

impl PcacheInner {
    /// Evict one line from `set`. `SetBusy` means either another evictor
    /// owns the set or no line is reclaim-ready; both are retryable.
    pub(crate) fn evict_one(&self, set: usize) -> Result<(), PcacheError> {
        let pset = &self.sets[set];
        if pset.flags.test_and_set(SetFlags::EVICTING, Ordering::Acquire) {
            return Err(PcacheError::SetBusy(set));
        }

        let res = match self.cfg.policy {
            EvictionPolicy::Lru => self.evict_lru(set),
            EvictionPolicy::Victim { .. } => self.evict_scan(set),
            EvictionPolicy::PerSetList => self.evict_perset(set),
        };

        pset.flags.clear(SetFlags::EVICTING, Ordering::Release);
        pset.wait_cv.notify_all();
        res
    }

    /// LRU policy: first reclaimable line from the tail. Tail order is
    /// total, so ties cannot arise within one scan.
    fn evict_lru(&self, set: usize) -> Result<(), PcacheError> {
        let pset = &self.sets[set];
        let victim = {
            let mut lru = pset.lru.lock();
            let mut found = None;
            for pos in (0..lru.len()).rev() {
                let way = lru[pos];
                if self.try_claim_reclaim(self.line_id(set, way)) {
                    found = Some((pos, way));
                    break;
                }
            }
            if let Some((pos, _)) = found {
                lru.remove(pos);
                pset.nr_lru.fetch_sub(1, Ordering::Relaxed);
            }
            found.map(|(_, way)| way)
        };

        match victim {
            Some(way) => {
                self.teardown(self.line_id(set, way));
                Ok(())
            }
            None => Err(PcacheError::SetBusy(set)),
        }
    }

    /// Victim policy selection: lowest reclaimable way index wins.
    fn evict_scan(&self, set: usize) -> Result<(), PcacheError> {
        for way in 0..self.cfg.ways {
            let id = self.line_id(set, way);
            if self.try_claim_reclaim(id) {
                self.teardown(id);
                return Ok(());
            }
        }
        Err(PcacheError::SetBusy(set))
    }

    /// Per-set-list policy: drain staged candidates, sweeping once if the
    /// list has run dry.
    fn evict_perset(&self, set: usize) -> Result<(), PcacheError> {
        let pset = &self.sets[set];
        let mut swept = false;
        loop {
            let staged = {
                let mut pending = pset.pending.lock();
                let e = pending.pop();
                if e.is_some() {
                    pset.nr_pending.fetch_sub(1, Ordering::Relaxed);
                }
                e
            };

            match staged {
                Some(pe) => {
                    let id = self.line_id(set, pe.way);
                    // The entry is a hint; the line may have been recycled
                    // since the sweep. Any claimable valid line is fine.
                    if self.try_claim_reclaim(id) {
                        self.teardown(id);
                        return Ok(());
                    }
                }
                None if !swept => {
                    self.sweep_set(set);
                    swept = true;
                }
                None => return Err(PcacheError::SetBusy(set)),
            }
        }
    }

    /// Stage reclaim candidates for [`EvictionPolicy::PerSetList`]. The
    /// `SWEEPING` flag guarantees a single concurrent scanner per set.
    pub(crate) fn sweep_set(&self, set: usize) {
        let pset = &self.sets[set];
        if pset.flags.test_and_set(SetFlags::SWEEPING, Ordering::Acquire) {
            return;
        }

        for way in 0..self.cfg.ways {
            let id = self.line_id(set, way);
            let line = self.line(id);
            let bits = line.bits.load(Ordering::Acquire);
            if !bits.contains(EVICTABLE) || bits.intersects(UNEVICTABLE) {
                continue;
            }
            if pset.pending.lock().iter().any(|pe| pe.way == way) {
                continue;
            }
            let Some(guard) = line.try_lock() else {
                continue;
            };
            if let Some(e) = guard.rmap().first() {
                let entry = PendingEviction {
                    way,
                    mm: e.mm,
                    vaddr: e.vaddr,
                };
                drop(guard);
                pset.pending.lock().push(entry);
                pset.nr_pending.fetch_add(1, Ordering::Relaxed);
            }
        }

        pset.flags.clear(SetFlags::SWEEPING, Ordering::Release);
    }

    /// Claim teardown ownership of `id` iff it is an eviction candidate.
    fn try_claim_reclaim(&self, id: LineId) -> bool {
        let line = self.line(id);
        let bits = line.bits.load(Ordering::Acquire);
        if !bits.contains(EVICTABLE) || bits.intersects(UNEVICTABLE) {
            return false;
        }
        !line.bits.test_and_set(LineFlags::RECLAIM, Ordering::Acquire)
    }

    /// Common teardown for a `RECLAIM`-owned line.
    pub(crate) fn teardown(&self, id: LineId) {
        let line = self.line(id);
        let set = self.set_of(id);
        let pset = &self.sets[set];

        // Unmap under the line lock so rmap walkers never race the zap and
        // the mapcount law holds at every unlocked point.
        let ident = {
            let mut guard = line.lock();
            let entries: Vec<RmapEntry> = std::mem::take(guard.rmap_mut());
            for e in &entries {
                e.pte.zap(id);
                self.tlb.flush(e.mm, e.vaddr);
                line.mapcount.fetch_sub(1, Ordering::Relaxed);
            }
            entries.first().map(|e| (e.mm, e.vaddr))
        };

        if self.cfg.policy == EvictionPolicy::Lru {
            pset.lru_remove(self.way_of(id));
        }

        let dirty = line.bits.test_and_clear(LineFlags::DIRTY, Ordering::AcqRel);
        pset.stats.inc(SetStat::Eviction);
        trace!(line = id, set, dirty, "evicting line");

        match self.cfg.policy {
            EvictionPolicy::Victim { slots_per_set } => {
                if let Some((mm, vaddr)) = ident {
                    // Reclaim ownership with an empty rmap makes us the sole
                    // accessor of the payload.
                    let data = Box::new(unsafe { self.data(id).read() });
                    // Push dirty contents home before parking so a racing
                    // fault that misses the victim slot cannot read stale
                    // remote data.
                    if dirty {
                        if let Err(e) = self.remote.writeback_page(mm, vaddr, &data) {
                            tracing::warn!(mm, vaddr = format_args!("{vaddr:#x}"), %e, "victim writeback failed");
                        }
                    }
                    self.park_victim(
                        set,
                        slots_per_set,
                        VictimSlot {
                            mm,
                            vaddr,
                            dirty: false,
                            data,
                        },
                    );
                }
                self.finish_line_free(id);
            }
            EvictionPolicy::Lru | EvictionPolicy::PerSetList => {
                if dirty {
                    if let Some((mm, vaddr)) = ident {
                        line.bits.set(LineFlags::WRITEBACK, Ordering::Release);
                        let data = Box::new(unsafe { self.data(id).read() });
                        self.enqueue_wb(WbJob::Line {
                            id,
                            mm,
                            vaddr,
                            data,
                        });
                        // Worker clears WRITEBACK and finishes the free.
                        return;
                    }
                }
                self.finish_line_free(id);
            }
        }
    }

    /// Clear `VALID` and `RECLAIM`, then hand off to the common free path.
    pub(crate) fn finish_line_free(&self, id: LineId) {
        let line = self.line(id);
        line.bits.clear(LineFlags::VALID, Ordering::AcqRel);
        line.bits.clear(LineFlags::RECLAIM, Ordering::AcqRel);
        self.finish_free(id);
    }

    fn park_victim(&self, set: usize, bound: usize, slot: VictimSlot) {
        let pset = &self.sets[set];
        let mut victims = pset.victims.lock();
        victims.push_back(slot);
        pset.nr_victims.fetch_add(1, Ordering::Relaxed);
        // FIFO overflow; parked pages are already coherent with remote.
        while victims.len() > bound.max(1) {
            victims.pop_front();
            pset.nr_victims.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Consume a parked page matching `(mm, vaddr)`, if present.
    pub(crate) fn take_victim(&self, set: usize, mm: crate::MmId, vaddr: u64) -> Option<VictimSlot> {
        let pset = &self.sets[set];
        let mut victims = pset.victims.lock();
        let pos = victims
            .iter()
            .position(|s| s.mm == mm && s.vaddr == vaddr)?;
        pset.nr_victims.fetch_sub(1, Ordering::Relaxed);
        victims.remove(pos)
    }

    /// Strip every rmap entry belonging to `mm`; reclaim lines left with no
    /// mappings. Dirty pages die with the address space.
    pub(crate) fn zap_address_space(&self, mm: &crate::AddressSpace) {
        for id in 0..self.lines.len() {
            let line = self.line(id);
            if !line.bits.test(LineFlags::VALID, Ordering::Acquire) {
                continue;
            }

            // Reclaim ownership must be taken under the lock: once we let
            // go, the line could be freed and recycled by someone else.
            let reclaim_owned = {
                let mut guard = line.lock();
                let before = guard.rmap().len();
                if before == 0 {
                    continue;
                }
                guard.rmap_mut().retain(|e| {
                    if e.mm == mm.id() {
                        e.pte.zap(id);
                        self.tlb.flush(e.mm, e.vaddr);
                        false
                    } else {
                        true
                    }
                });
                let removed = before - guard.rmap().len();
                if removed > 0 {
                    line.mapcount.fetch_sub(removed as u32, Ordering::Relaxed);
                }
                removed > 0
                    && guard.rmap().is_empty()
                    && !line.bits.test_and_set(LineFlags::RECLAIM, Ordering::Acquire)
            };

            if reclaim_owned {
                line.bits.clear(LineFlags::DIRTY, Ordering::AcqRel);
                self.teardown(id);
            }
        }
    }
}
