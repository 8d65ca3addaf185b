//! Atomic bit-word substrate for cache metadata.
//!
//! Every flag family is a `bitflags` type over `u64`, stored in an
//! [`AtomicBits`] word. The atomic variants take an explicit ordering; the
//! `*_unlocked` variants are plain read-modify-write and are only sound
//! while the caller holds the lock that excludes concurrent writers; each
//! call site is expected to state which lock that is.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::{bitflags, Flags};

bitflags! {
    /// State bits of one cache line.
    ///
    /// Lifecycle: `free -> ALLOCATED -> ALLOCATED|USABLE ->
    /// ALLOCATED|USABLE|VALID -> ... -> free`. `LOCKED` doubles as the
    /// line's spin lock. Only `ALLOCATED|USABLE|VALID` lines are eviction
    /// candidates.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LineFlags: u64 {
        const LOCKED    = 1 << 0;
        const ALLOCATED = 1 << 1;
        const USABLE    = 1 << 2;
        const VALID     = 1 << 3;
        const DIRTY     = 1 << 4;
        const RECLAIM   = 1 << 5;
        const WRITEBACK = 1 << 6;
    }
}

impl LineFlags {
    /// Bits that must all be clear at the instant `ALLOCATED` drops 1 -> 0.
    pub const CHECK_AT_FREE: LineFlags = LineFlags::LOCKED
        .union(LineFlags::VALID)
        .union(LineFlags::DIRTY)
        .union(LineFlags::RECLAIM)
        .union(LineFlags::WRITEBACK);
}

bitflags! {
    /// State bits of one cache set.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SetFlags: u64 {
        /// Set is under eviction; serialises concurrent evictors and tells
        /// blocked allocators what they are waiting for.
        const EVICTING = 1 << 0;
        /// A sweeper is scanning this set; at most one at a time.
        const SWEEPING = 1 << 1;
    }
}

bitflags! {
    /// Per-rmap-entry flag word. Currently reserved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RmapFlags: u64 {
        const RESERVED = 1 << 0;
    }
}

/// A `u64` flag word with typed accessors.
pub struct AtomicBits<F> {
    raw: AtomicU64,
    _ty: PhantomData<fn(F) -> F>,
}

impl<F: Flags<Bits = u64> + Copy> AtomicBits<F> {
    pub const fn new() -> Self {
        Self {
            raw: AtomicU64::new(0),
            _ty: PhantomData,
        }
    }

    pub fn load(&self, order: Ordering) -> F {
        F::from_bits_retain(self.raw.load(order))
    }

    pub fn test(&self, flags: F, order: Ordering) -> bool {
        self.raw.load(order) & flags.bits() != 0
    }

    pub fn set(&self, flags: F, order: Ordering) {
        self.raw.fetch_or(flags.bits(), order);
    }

    pub fn clear(&self, flags: F, order: Ordering) {
        self.raw.fetch_and(!flags.bits(), order);
    }

    /// Returns whether any of `flags` was already set.
    pub fn test_and_set(&self, flags: F, order: Ordering) -> bool {
        self.raw.fetch_or(flags.bits(), order) & flags.bits() != 0
    }

    /// Returns whether any of `flags` was set before clearing.
    pub fn test_and_clear(&self, flags: F, order: Ordering) -> bool {
        self.raw.fetch_and(!flags.bits(), order) & flags.bits() != 0
    }

    /// Atomically set `set` iff none of `forbid` is currently set.
    pub fn try_transition(&self, forbid: F, set: F) -> bool {
        let mut cur = self.raw.load(Ordering::Relaxed);
        loop {
            if cur & forbid.bits() != 0 {
                return false;
            }
            match self.raw.compare_exchange_weak(
                cur,
                cur | set.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Non-atomic set. Sound only while the caller's lock excludes every
    /// other writer of this word.
    pub fn set_unlocked(&self, flags: F) {
        let cur = self.raw.load(Ordering::Relaxed);
        self.raw.store(cur | flags.bits(), Ordering::Relaxed);
    }

    /// Non-atomic clear; same proof obligation as [`Self::set_unlocked`].
    pub fn clear_unlocked(&self, flags: F) {
        let cur = self.raw.load(Ordering::Relaxed);
        self.raw.store(cur & !flags.bits(), Ordering::Relaxed);
    }
}

impl<F: Flags<Bits = u64> + Copy + std::fmt::Debug> std::fmt::Debug for AtomicBits<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}
