//! Per-set state: statistics, the eviction flag word, and the union of
//! per-policy fields (LRU list, victim slots, pending-eviction list).
//!
//! The set carries whichever fields the installed policy needs; unused ones
//! stay empty. Each set is cache-line aligned so the hot counters of
//! neighbouring sets do not false-share.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::bits::{AtomicBits, SetFlags};
use crate::line::PAGE_SIZE;
use crate::mm::MmId;

/// Per-set statistic slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SetStat {
    Alloc = 0,
    FillMemory = 1,
    FillVictim = 2,
    Eviction = 3,
}

pub const NR_SET_STATS: usize = 4;

#[derive(Default)]
pub struct SetStats {
    counters: [AtomicU64; NR_SET_STATS],
}

impl SetStats {
    pub fn inc(&self, stat: SetStat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: SetStat) -> u64 {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> [u64; NR_SET_STATS] {
        [
            self.get(SetStat::Alloc),
            self.get(SetStat::FillMemory),
            self.get(SetStat::FillVictim),
            self.get(SetStat::Eviction),
        ]
    }
}

/// A page parked in the set's victim cache after eviction. Re-faults in the
/// set hit here before going to remote memory.
pub struct VictimSlot {
    pub mm: MmId,
    pub vaddr: u64,
    pub dirty: bool,
    pub data: Box<[u8; PAGE_SIZE]>,
}

/// A reclaim candidate staged by the sweeper for the per-set-list policy.
pub struct PendingEviction {
    pub way: usize,
    pub mm: MmId,
    pub vaddr: u64,
}

#[repr(align(64))]
pub struct CacheSet {
    pub flags: AtomicBits<SetFlags>,
    pub stats: SetStats,

    // Lru policy: way indices, MRU at the front.
    pub lru: Mutex<VecDeque<usize>>,
    pub nr_lru: AtomicU32,

    // Victim policy: FIFO of parked pages, bounded by config.
    pub victims: Mutex<VecDeque<VictimSlot>>,
    pub nr_victims: AtomicU32,

    // Per-set-list policy: staged candidates, drained by the allocator.
    pub pending: Mutex<Vec<PendingEviction>>,
    pub nr_pending: AtomicU32,

    // Allocator back-off: waiters parked while the set is under eviction.
    pub wait_lock: Mutex<()>,
    pub wait_cv: Condvar,
}

impl CacheSet {
    pub fn new() -> Self {
        CacheSet {
            flags: AtomicBits::new(),
            stats: SetStats::default(),
            lru: Mutex::new(VecDeque::new()),
            nr_lru: AtomicU32::new(0),
            victims: Mutex::new(VecDeque::new()),
            nr_victims: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
            nr_pending: AtomicU32::new(0),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    /// Put `way` at the MRU end, moving it if already listed.
    pub fn lru_insert_mru(&self, way: usize) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|&w| w == way) {
            lru.remove(pos);
        } else {
            self.nr_lru.fetch_add(1, Ordering::Relaxed);
        }
        lru.push_front(way);
    }

    pub fn lru_remove(&self, way: usize) {
        let mut lru = self.lru.lock();
        if let Some(pos) = lru.iter().position(|&w| w == way) {
            lru.remove(pos);
            self.nr_lru.fetch_sub(1, Ordering::Relaxed);
        }
    }
}
