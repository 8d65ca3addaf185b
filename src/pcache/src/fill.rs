//! The page-fault fill path: allocate-or-hit, fetch, install, publish.
//!
//! Ordering that faults can observe: the rmap entry is installed before the
//! PTE, and `VALID` is set (release) before the PTE is published, so no
//! reader ever follows a PTE into uninitialised bytes. Concurrent faults on
//! one address collapse at the PTE compare-exchange: the loser unwinds its
//! spare allocation and adopts the winner's line.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::bits::LineFlags;
use crate::line::{LineId, PAGE_SIZE};
use crate::mm::AddressSpace;
use crate::rmap::{RmapCaller, RmapEntry};
use crate::set::SetStat;
use crate::{EvictionPolicy, MmId, PcacheError, PcacheInner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillCause {
    /// Plain miss; content comes from remote memory (or a victim slot).
    Miss,
    /// Write fault on a shared mapping; content copied, then remapped.
    Cow,
    /// Fresh anonymous page.
    Zero,
}

/// How a fill was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillKind {
    Hit,
    FromMemory,
    FromVictim,
    Zeroed,
    Copied,
    /// Lost the install race to a concurrent fault; adopted its line.
    Collapsed,
}

#[derive(Debug, Clone, Copy)]
pub struct FillOutcome {
    pub line: LineId,
    pub kind: FillKind,
}

impl PcacheInner {
    pub(crate) fn fill(
        &self,
        mm: &AddressSpace,
        vaddr: u64,
        cause: FillCause,
    ) -> Result<FillOutcome, PcacheError> {
        let vaddr = vaddr & !(PAGE_SIZE as u64 - 1);
        let set = self.set_index(vaddr);

        // Optimistic hit checks. COW must replace the mapping, so a present
        // PTE is not a hit for it.
        if cause != FillCause::Cow {
            if let Some(id) = mm.resolve(vaddr) {
                self.touch(set, id);
                return Ok(FillOutcome {
                    line: id,
                    kind: FillKind::Hit,
                });
            }
            if let Some(id) = self.lookup_set(set, mm.id(), vaddr) {
                self.touch(set, id);
                return Ok(FillOutcome {
                    line: id,
                    kind: FillKind::Hit,
                });
            }
        }

        let old = (cause == FillCause::Cow).then(|| mm.resolve(vaddr)).flatten();

        let id = self.alloc_line(set)?;

        // Collapse check after acquisition: a racing fault may have
        // installed while we were allocating.
        if cause != FillCause::Cow {
            if let Some(winner) = mm.resolve(vaddr) {
                self.release_claim(id);
                return Ok(FillOutcome {
                    line: winner,
                    kind: FillKind::Collapsed,
                });
            }
        }

        // We are the sole owner of the claimed, not-yet-valid line; payload
        // writes need no lock.
        let (kind, caller) = match cause {
            FillCause::Zero => {
                unsafe { self.data(id).zero() };
                (FillKind::Zeroed, RmapCaller::ZeroFill)
            }
            FillCause::Cow => {
                match old {
                    Some(oid) => {
                        let src = {
                            let _g = self.line(oid).lock();
                            unsafe { self.data(oid).read() }
                        };
                        unsafe { self.data(id).write(&src) };
                    }
                    None => {
                        if let Err(e) = self.fetch_remote(mm.id(), vaddr, id) {
                            self.release_claim(id);
                            return Err(e);
                        }
                    }
                }
                (FillKind::Copied, RmapCaller::Cow)
            }
            FillCause::Miss => {
                if let Some(slot) = self.victim_lookup(set, mm.id(), vaddr) {
                    unsafe { self.data(id).write(&slot.data) };
                    self.sets[set].stats.inc(SetStat::FillVictim);
                    (FillKind::FromVictim, RmapCaller::VictimFill)
                } else {
                    if let Err(e) = self.fetch_remote(mm.id(), vaddr, id) {
                        self.release_claim(id);
                        return Err(e);
                    }
                    (FillKind::FromMemory, RmapCaller::FillRemote)
                }
            }
        };

        // COW retires the old binding before the new one goes live.
        if let Some(oid) = old {
            let pte = mm.pte(vaddr);
            let mut guard = self.line(oid).lock();
            if guard.rmap_remove(&pte, mm.id(), vaddr).is_some() {
                pte.zap(oid);
                self.tlb.flush(mm.id(), vaddr);
            }
        }

        // Install: rmap entry first, then VALID (release), then the PTE.
        let pte = mm.pte(vaddr);
        let line = self.line(id);
        let mut guard = line.lock();
        guard.rmap_add(RmapEntry::new(Arc::clone(&pte), mm.id(), vaddr, caller));
        line.bits.set(LineFlags::VALID, Ordering::Release);

        match pte.publish(id) {
            Ok(()) => {
                drop(guard);
                trace!(line = id, set, vaddr = format_args!("{vaddr:#x}"), ?kind, "fill complete");
                Ok(FillOutcome { line: id, kind })
            }
            Err(winner) => {
                // A racing fault published first: drop the spare allocation.
                // RECLAIM is claimed while the lock is still held, so the
                // line cannot be freed and recycled under us. Losing the
                // claim means an evictor owns the teardown; it will drain
                // our entry once we release the lock, and its PTE zap
                // cannot touch the winner's mapping (wrong line id).
                if !line.bits.test_and_set(LineFlags::RECLAIM, Ordering::Acquire) {
                    guard.rmap_remove(&pte, mm.id(), vaddr);
                    drop(guard);
                    if self.cfg.policy == EvictionPolicy::Lru {
                        self.sets[set].lru_remove(self.way_of(id));
                    }
                    self.finish_line_free(id);
                } else {
                    drop(guard);
                }
                Ok(FillOutcome {
                    line: winner,
                    kind: FillKind::Collapsed,
                })
            }
        }
    }

    fn fetch_remote(&self, mm: MmId, vaddr: u64, id: LineId) -> Result<(), PcacheError> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        self.remote.fetch_page(mm, vaddr, &mut buf)?;
        unsafe { self.data(id).write(&buf) };
        self.sets[self.set_of(id)].stats.inc(SetStat::FillMemory);
        Ok(())
    }

    fn victim_lookup(
        &self,
        set: usize,
        mm: MmId,
        vaddr: u64,
    ) -> Option<crate::set::VictimSlot> {
        match self.cfg.policy {
            EvictionPolicy::Victim { .. } => self.take_victim(set, mm, vaddr),
            _ => None,
        }
    }

    /// Tag-match `(mm, vaddr)` against every resident line of the set via
    /// rmap traversal; the cache stores no tag field.
    pub(crate) fn lookup_set(&self, set: usize, mm: MmId, vaddr: u64) -> Option<LineId> {
        for way in 0..self.cfg.ways {
            let id = self.line_id(set, way);
            let line = self.line(id);
            let bits = line.bits.load(Ordering::Acquire);
            if !bits.contains(LineFlags::USABLE | LineFlags::VALID) {
                continue;
            }
            let guard = line.lock();
            if line.bits.test(LineFlags::VALID, Ordering::Relaxed) && guard.rmap_find(mm, vaddr) {
                return Some(id);
            }
        }
        None
    }

    /// Hit bookkeeping: LRU promotion when that policy is installed.
    fn touch(&self, set: usize, id: LineId) {
        if self.cfg.policy == EvictionPolicy::Lru {
            self.sets[set].lru_insert_mru(self.way_of(id));
        }
    }

    /// Share every resident page of `parent` into `child`'s page table; the
    /// fork path. Lines stay shared until a write fault copies them.
    pub(crate) fn fork_address_space(&self, parent: &AddressSpace, child: &AddressSpace) {
        for id in 0..self.lines.len() {
            let line = self.line(id);
            let bits = line.bits.load(Ordering::Acquire);
            if !bits.contains(LineFlags::VALID) || bits.intersects(LineFlags::RECLAIM) {
                continue;
            }
            let mut guard = line.lock();
            if !line.bits.test(LineFlags::VALID, Ordering::Relaxed) {
                continue;
            }
            let shared: Vec<u64> = guard
                .rmap()
                .iter()
                .filter(|e| e.mm == parent.id())
                .map(|e| e.vaddr)
                .collect();
            for vaddr in shared {
                let pte = child.pte(vaddr);
                // Entry first, PTE second, same as any installer.
                guard.rmap_add(RmapEntry::new(
                    Arc::clone(&pte),
                    child.id(),
                    vaddr,
                    RmapCaller::Fork,
                ));
                if pte.publish(id).is_err() {
                    guard.rmap_remove(&pte, child.id(), vaddr);
                }
            }
        }
    }

    /// Rebind the cached page at `old_vaddr` to `new_vaddr`; the compute
    /// side of an mremap that kept the page resident. The cache is
    /// virtually indexed, so the rebind only sticks when both addresses
    /// hash to the same set; otherwise the old binding is dropped and the
    /// next access refaults at the new address.
    pub(crate) fn move_mapping(&self, mm: &AddressSpace, old_vaddr: u64, new_vaddr: u64) -> bool {
        let old_vaddr = old_vaddr & !(PAGE_SIZE as u64 - 1);
        let new_vaddr = new_vaddr & !(PAGE_SIZE as u64 - 1);
        let Some(id) = mm.resolve(old_vaddr) else {
            return false;
        };
        let line = self.line(id);
        let mut guard = line.lock();

        let old_pte = mm.pte(old_vaddr);
        if guard.rmap_remove(&old_pte, mm.id(), old_vaddr).is_none() {
            return false;
        }
        old_pte.zap(id);
        self.tlb.flush(mm.id(), old_vaddr);

        if self.set_index(new_vaddr) != self.set_of(id) {
            return false;
        }
        let new_pte = mm.pte(new_vaddr);
        guard.rmap_add(RmapEntry::new(
            Arc::clone(&new_pte),
            mm.id(),
            new_vaddr,
            RmapCaller::MremapSlowpath,
        ));
        if new_pte.publish(id).is_err() {
            guard.rmap_remove(&new_pte, mm.id(), new_vaddr);
            return false;
        }
        true
    }

    pub(crate) fn read_page(&self, mm: &AddressSpace, vaddr: u64) -> Option<[u8; PAGE_SIZE]> {
        let vaddr = vaddr & !(PAGE_SIZE as u64 - 1);
        let id = mm.resolve(vaddr)?;
        let line = self.line(id);
        let guard = line.lock();
        if !guard.rmap_find(mm.id(), vaddr) {
            return None;
        }
        Some(unsafe { self.data(id).read() })
    }

    pub(crate) fn write_page(
        &self,
        mm: &AddressSpace,
        vaddr: u64,
        offset: usize,
        bytes: &[u8],
    ) -> bool {
        let page = vaddr & !(PAGE_SIZE as u64 - 1);
        if offset.checked_add(bytes.len()).map_or(true, |end| end > PAGE_SIZE) {
            return false;
        }
        let Some(id) = mm.resolve(page) else {
            return false;
        };
        let line = self.line(id);
        let guard = line.lock();
        if !guard.rmap_find(mm.id(), page) {
            return false;
        }
        unsafe { self.data(id).write_at(offset, bytes) };
        line.bits.set(LineFlags::DIRTY, Ordering::Release);
        true
    }
}
