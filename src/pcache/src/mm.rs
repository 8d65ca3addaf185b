//! Compute-side task address spaces and the external contracts the cache
//! fill/evict paths program against: the page-table slot, the TLB shootdown
//! hook, and the remote-memory RPC.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::line::{LineId, PAGE_SIZE};
use crate::PcacheError;

/// Address-space identity. The cache never dereferences an mm; it only keys
/// rmap entries by id, so a dying address space can sweep its rmaps without
/// a reference cycle.
pub type MmId = u64;

const PTE_PRESENT: u64 = 1 << 63;

/// One page-table slot. The stored value is `PTE_PRESENT | line_id` or zero.
///
/// Publication is a CAS from the empty state, which is also what collapses
/// concurrent faults on the same address: exactly one installer wins.
pub struct PteSlot {
    val: AtomicU64,
}

impl PteSlot {
    pub fn new() -> Self {
        PteSlot {
            val: AtomicU64::new(0),
        }
    }

    /// Publish a mapping to `line`. Fails with the current line id if
    /// another installer won.
    pub fn publish(&self, line: LineId) -> Result<(), LineId> {
        match self.val.compare_exchange(
            0,
            PTE_PRESENT | line as u64,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(cur) => Err((cur & !PTE_PRESENT) as LineId),
        }
    }

    /// Clear the slot iff it still points at `line`. Eviction must not wipe
    /// a slot that has since been re-published by somebody else.
    pub fn zap(&self, line: LineId) -> bool {
        self.val
            .compare_exchange(
                PTE_PRESENT | line as u64,
                0,
                Ordering::Release,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    pub fn line(&self) -> Option<LineId> {
        let v = self.val.load(Ordering::Acquire);
        (v & PTE_PRESENT != 0).then_some((v & !PTE_PRESENT) as LineId)
    }
}

/// Per-task address space as the cache sees it: an id plus the page-table
/// slots the cache installs into.
pub struct AddressSpace {
    id: MmId,
    ptes: Mutex<FxHashMap<u64, Arc<PteSlot>>>,
}

impl AddressSpace {
    pub fn new(id: MmId) -> Self {
        AddressSpace {
            id,
            ptes: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn id(&self) -> MmId {
        self.id
    }

    /// Get-or-create the slot covering `vaddr`'s page.
    pub fn pte(&self, vaddr: u64) -> Arc<PteSlot> {
        let page = vaddr & !(PAGE_SIZE as u64 - 1);
        Arc::clone(
            self.ptes
                .lock()
                .entry(page)
                .or_insert_with(|| Arc::new(PteSlot::new())),
        )
    }

    /// Resolve `vaddr` to its mapped line, if any.
    pub fn resolve(&self, vaddr: u64) -> Option<LineId> {
        let page = vaddr & !(PAGE_SIZE as u64 - 1);
        self.ptes.lock().get(&page).and_then(|slot| slot.line())
    }
}

/// The timed RPC to the memory tier. The production implementation rides
/// the RDMA transport; tests use [`MapRemote`].
pub trait RemoteMemory: Send + Sync + 'static {
    fn fetch_page(
        &self,
        mm: MmId,
        vaddr: u64,
        dst: &mut [u8; PAGE_SIZE],
    ) -> Result<(), PcacheError>;

    fn writeback_page(
        &self,
        mm: MmId,
        vaddr: u64,
        src: &[u8; PAGE_SIZE],
    ) -> Result<(), PcacheError>;
}

/// TLB shootdown contract: synchronous per-PTE flush, acked by return.
pub trait TlbFlush: Send + Sync + 'static {
    fn flush(&self, mm: MmId, vaddr: u64);
}

/// No-op shootdown for single-node runs and tests.
pub struct NullTlbFlush;

impl TlbFlush for NullTlbFlush {
    fn flush(&self, mm: MmId, vaddr: u64) {
        trace!(mm, vaddr = format_args!("{vaddr:#x}"), "tlb flush");
    }
}

/// Hash-map backed remote memory. Pages absent from the map read as zeroes,
/// which matches a fresh anonymous region on the memory node.
#[derive(Default)]
pub struct MapRemote {
    pages: Mutex<FxHashMap<(MmId, u64), Box<[u8; PAGE_SIZE]>>>,
}

impl MapRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, mm: MmId, vaddr: u64, data: [u8; PAGE_SIZE]) {
        self.pages.lock().insert((mm, vaddr), Box::new(data));
    }

    pub fn page(&self, mm: MmId, vaddr: u64) -> Option<[u8; PAGE_SIZE]> {
        self.pages.lock().get(&(mm, vaddr)).map(|p| **p)
    }
}

impl RemoteMemory for MapRemote {
    fn fetch_page(
        &self,
        mm: MmId,
        vaddr: u64,
        dst: &mut [u8; PAGE_SIZE],
    ) -> Result<(), PcacheError> {
        match self.pages.lock().get(&(mm, vaddr)) {
            Some(page) => dst.copy_from_slice(&page[..]),
            None => dst.fill(0),
        }
        Ok(())
    }

    fn writeback_page(
        &self,
        mm: MmId,
        vaddr: u64,
        src: &[u8; PAGE_SIZE],
    ) -> Result<(), PcacheError> {
        self.pages.lock().insert((mm, vaddr), Box::new(*src));
        Ok(())
    }
}
