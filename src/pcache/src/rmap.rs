//! Reverse mapping from cache lines back to the page-table slots that
//! reference them.
//!
//! An entry lives exactly as long as the PTE-to-line binding: the installer
//! adds it before publishing the PTE, unmap and eviction remove it. All list
//! mutation and iteration happens under the line lock, and `mapcount`
//! mirrors the list length at every unlocked point.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::bits::{AtomicBits, RmapFlags};
use crate::line::LineGuard;
use crate::mm::{MmId, PteSlot};

/// Why an rmap entry was installed. Kept on the entry for debugging and
/// stats; the teardown path does not branch on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmapCaller {
    FillRemote,
    ZeroFill,
    VictimFill,
    Cow,
    Fork,
    MremapSlowpath,
}

/// One (page table slot, address space, user address) back-pointer.
pub struct RmapEntry {
    pub pte: Arc<PteSlot>,
    pub mm: MmId,
    /// Page aligned.
    pub vaddr: u64,
    pub caller: RmapCaller,
    pub flags: AtomicBits<RmapFlags>,
}

impl RmapEntry {
    pub fn new(pte: Arc<PteSlot>, mm: MmId, vaddr: u64, caller: RmapCaller) -> RmapEntry {
        RmapEntry {
            pte,
            mm,
            vaddr,
            caller,
            flags: AtomicBits::new(),
        }
    }
}

impl LineGuard<'_> {
    /// Append a back-pointer. Caller must publish the PTE only after this
    /// returns, so a concurrent rmap walk never misses a mapped PTE.
    pub fn rmap_add(&mut self, entry: RmapEntry) {
        debug_assert_eq!(entry.vaddr & (crate::line::PAGE_SIZE as u64 - 1), 0);
        self.rmap_mut().push(entry);
        self.line().mapcount.fetch_add(1, Ordering::Relaxed);
    }

    /// Remove the back-pointer for `(mm, vaddr)` installed through `pte`.
    pub fn rmap_remove(&mut self, pte: &Arc<PteSlot>, mm: MmId, vaddr: u64) -> Option<RmapEntry> {
        let pos = self
            .rmap()
            .iter()
            .position(|e| e.mm == mm && e.vaddr == vaddr && Arc::ptr_eq(&e.pte, pte))?;
        let entry = self.rmap_mut().remove(pos);
        self.line().mapcount.fetch_sub(1, Ordering::Relaxed);
        Some(entry)
    }

    /// Find the line owner for `(mm, vaddr)`; the pcache hit test.
    pub fn rmap_find(&self, mm: MmId, vaddr: u64) -> bool {
        self.rmap().iter().any(|e| e.mm == mm && e.vaddr == vaddr)
    }
}
