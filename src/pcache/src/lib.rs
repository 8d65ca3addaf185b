//! Software-managed processor-side page cache for a compute node with no
//! local DRAM for user data.
//!
//! The cache is set-associative over a fixed arena of 4 KiB lines. A line's
//! lifecycle is driven by an atomic bit-word (`free -> allocated ->
//! allocated+usable -> +valid -> ... -> free`); reverse-map entries tie
//! lines to the page-table slots referencing them; eviction is pluggable
//! (LRU, victim cache, or per-set pending list) and chosen at construction.
//! Remote memory and TLB shootdown are external contracts expressed as
//! traits.

mod alloc;
mod bits;
#[cfg(test)]
mod tests;
mod evict;
mod fill;
mod line;
mod mm;
mod rmap;
mod set;

pub use bits::{AtomicBits, LineFlags, RmapFlags, SetFlags};
pub use fill::{FillCause, FillKind, FillOutcome};
pub use line::{CacheLine, LineId, PageBuf, PAGE_SHIFT, PAGE_SIZE};
pub use mm::{AddressSpace, MapRemote, MmId, NullTlbFlush, PteSlot, RemoteMemory, TlbFlush};
pub use rmap::{RmapCaller, RmapEntry};
pub use set::{CacheSet, PendingEviction, SetStat, SetStats, VictimSlot, NR_SET_STATS};

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Which eviction strategy a cache instance runs. Picked once at
/// construction; the per-set layout carries the union of fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    Lru,
    Victim { slots_per_set: usize },
    PerSetList,
}

#[derive(Debug, Clone)]
pub struct PcacheConfig {
    /// Number of sets; must be a power of two.
    pub sets: usize,
    /// Ways per set.
    pub ways: usize,
    pub policy: EvictionPolicy,
}

impl Default for PcacheConfig {
    fn default() -> Self {
        PcacheConfig {
            sets: 64,
            ways: 8,
            policy: EvictionPolicy::Lru,
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum PcacheError {
    /// Set is under eviction or has no reclaimable line right now; the
    /// caller may back off and retry.
    #[error("set {0} busy, retry allocation")]
    SetBusy(usize),
    /// Allocation still failed after eviction attempts.
    #[error("no line available in set {0}")]
    NoLine(usize),
    #[error("remote memory: {0}")]
    Remote(String),
}

pub(crate) enum WbJob {
    /// Write back a torn-down line's last contents, then finish freeing it.
    Line {
        id: LineId,
        mm: MmId,
        vaddr: u64,
        data: Box<[u8; PAGE_SIZE]>,
    },
}

pub(crate) struct PcacheInner {
    pub(crate) cfg: PcacheConfig,
    pub(crate) sets: Box<[CacheSet]>,
    pub(crate) lines: Box<[CacheLine]>,
    pub(crate) data: Box<[PageBuf]>,
    pub(crate) remote: Arc<dyn RemoteMemory>,
    pub(crate) tlb: Arc<dyn TlbFlush>,
    // None once shutdown started; teardown then writes back inline.
    pub(crate) wb_tx: Mutex<Option<Sender<WbJob>>>,
}

impl PcacheInner {
    pub(crate) fn set_index(&self, vaddr: u64) -> usize {
        ((vaddr >> PAGE_SHIFT) as usize) & (self.cfg.sets - 1)
    }

    pub(crate) fn line_id(&self, set: usize, way: usize) -> LineId {
        set * self.cfg.ways + way
    }

    pub(crate) fn set_of(&self, id: LineId) -> usize {
        id / self.cfg.ways
    }

    pub(crate) fn way_of(&self, id: LineId) -> usize {
        id % self.cfg.ways
    }

    pub(crate) fn line(&self, id: LineId) -> &CacheLine {
        &self.lines[id]
    }

    pub(crate) fn data(&self, id: LineId) -> &PageBuf {
        &self.data[id]
    }

    pub(crate) fn enqueue_wb(&self, job: WbJob) {
        let tx = self.wb_tx.lock().clone();
        match tx {
            Some(tx) => {
                if let Err(err) = tx.send(job) {
                    self.run_wb_job(err.0);
                }
            }
            None => self.run_wb_job(job),
        }
    }
}

/// The cache instance. Owns the line arena and the write-back worker.
pub struct Pcache {
    pub(crate) inner: Arc<PcacheInner>,
    wb_thread: Option<thread::JoinHandle<()>>,
}

impl Pcache {
    pub fn new(
        cfg: PcacheConfig,
        remote: Arc<dyn RemoteMemory>,
        tlb: Arc<dyn TlbFlush>,
    ) -> Pcache {
        assert!(cfg.sets.is_power_of_two(), "set count must be a power of two");
        assert!(cfg.ways > 0);

        let nr_lines = cfg.sets * cfg.ways;
        let sets = (0..cfg.sets).map(|_| CacheSet::new()).collect();
        let lines = (0..nr_lines).map(|_| CacheLine::new()).collect();
        let data = (0..nr_lines).map(|_| PageBuf::new()).collect();

        let (tx, rx) = unbounded();
        let inner = Arc::new(PcacheInner {
            cfg,
            sets,
            lines,
            data,
            remote,
            tlb,
            wb_tx: Mutex::new(Some(tx)),
        });

        let wb_thread = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("pcache-writeback".into())
                .spawn(move || writeback_loop(inner, rx))
                .expect("failed to spawn writeback thread")
        };

        Pcache {
            inner,
            wb_thread: Some(wb_thread),
        }
    }

    pub fn config(&self) -> &PcacheConfig {
        &self.inner.cfg
    }

    /// Set index a user address hashes to.
    pub fn set_index(&self, vaddr: u64) -> usize {
        self.inner.set_index(vaddr)
    }

    pub fn set_stats(&self, set: usize) -> [u64; NR_SET_STATS] {
        self.inner.sets[set].stats.snapshot()
    }

    /// Line metadata, for inspection and invariant checks.
    pub fn line(&self, id: LineId) -> &CacheLine {
        self.inner.line(id)
    }

    pub fn nr_lines(&self) -> usize {
        self.inner.lines.len()
    }

    /// Number of pages currently parked in a set's victim slots.
    pub fn nr_victims(&self, set: usize) -> u32 {
        self.inner.sets[set].nr_victims.load(Ordering::Relaxed)
    }

    /// Run one sweep over `set`, staging reclaim candidates for the
    /// per-set-list policy. Harmless under other policies.
    pub fn sweep(&self, set: usize) {
        self.inner.sweep_set(set);
    }

    /// Handle a page fault on `(mm, vaddr)`.
    pub fn fill(
        &self,
        mm: &AddressSpace,
        vaddr: u64,
        cause: FillCause,
    ) -> Result<FillOutcome, PcacheError> {
        self.inner.fill(mm, vaddr, cause)
    }

    /// Resolve a mapped address without faulting.
    pub fn resolve(&self, mm: &AddressSpace, vaddr: u64) -> Option<LineId> {
        mm.resolve(vaddr)
    }

    /// Share every resident page of `parent` into `child`; writes diverge
    /// later through copy-on-write fills.
    pub fn fork_address_space(&self, parent: &AddressSpace, child: &AddressSpace) {
        self.inner.fork_address_space(parent, child);
    }

    /// Rebind a resident page to a new virtual address after an mremap.
    /// `false` means the binding was dropped instead (cross-set target or
    /// nothing resident); the next access refaults.
    pub fn move_mapping(&self, mm: &AddressSpace, old_vaddr: u64, new_vaddr: u64) -> bool {
        self.inner.move_mapping(mm, old_vaddr, new_vaddr)
    }

    /// Copy out a mapped page. `None` when nothing is mapped.
    pub fn read_page(&self, mm: &AddressSpace, vaddr: u64) -> Option<[u8; PAGE_SIZE]> {
        self.inner.read_page(mm, vaddr)
    }

    /// Store into a mapped page and mark the line dirty. The model's stand-in
    /// for a user store hitting the cached page.
    pub fn write_page(&self, mm: &AddressSpace, vaddr: u64, offset: usize, bytes: &[u8]) -> bool {
        self.inner.write_page(mm, vaddr, offset, bytes)
    }

    /// Remove every mapping belonging to `mm` and reclaim wholly-owned
    /// lines. Called when an address space dies; dirty data is discarded
    /// with it.
    pub fn zap_address_space(&self, mm: &AddressSpace) {
        self.inner.zap_address_space(mm);
    }
}

impl Drop for Pcache {
    fn drop(&mut self) {
        // Stop accepting async write-backs, drain, then join.
        self.inner.wb_tx.lock().take();
        if let Some(t) = self.wb_thread.take() {
            let _ = t.join();
        }
        debug!("pcache torn down");
    }
}

fn writeback_loop(inner: Arc<PcacheInner>, rx: Receiver<WbJob>) {
    while let Ok(job) = rx.recv() {
        inner.run_wb_job(job);
    }
}

impl PcacheInner {
    pub(crate) fn run_wb_job(&self, job: WbJob) {
        match job {
            WbJob::Line { id, mm, vaddr, data } => {
                if let Err(e) = self.remote.writeback_page(mm, vaddr, &data) {
                    warn!(mm, vaddr = format_args!("{vaddr:#x}"), %e, "writeback failed, dropping page");
                }
                self.line(id)
                    .bits
                    .clear(LineFlags::WRITEBACK, Ordering::Release);
                self.finish_line_free(id);
            }
        }
    }
}
