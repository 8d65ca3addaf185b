//! Cache-line metadata and payload storage.
//!
//! Metadata (`CacheLine`) and payload (`PageBuf`) live in two parallel
//! arenas indexed by the same line id, so meta -> data and data -> meta are
//! both a single index computation.

use std::cell::UnsafeCell;
use std::hint;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::bits::{AtomicBits, LineFlags};
use crate::rmap::RmapEntry;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Global line index: `set * ways + way`.
pub type LineId = usize;

/// One page of cached data.
///
/// Writers must either be the line's sole logical owner (claimed but not yet
/// published, or reclaim-owned with an empty rmap) or hold the line lock;
/// readers must hold the line lock. The bit protocol on the owning
/// [`CacheLine`] is what makes those claims checkable.
pub struct PageBuf(UnsafeCell<[u8; PAGE_SIZE]>);

// Access is serialised through the owning line's bit protocol; see above.
unsafe impl Sync for PageBuf {}

impl PageBuf {
    pub fn new() -> Self {
        PageBuf(UnsafeCell::new([0u8; PAGE_SIZE]))
    }

    /// # Safety
    /// Caller is the sole writer per the rules in the type docs.
    pub unsafe fn write(&self, src: &[u8; PAGE_SIZE]) {
        (*self.0.get()).copy_from_slice(src);
    }

    /// # Safety
    /// Caller is the sole writer per the rules in the type docs.
    pub unsafe fn write_at(&self, offset: usize, src: &[u8]) {
        (&mut *self.0.get())[offset..offset + src.len()].copy_from_slice(src);
    }

    /// # Safety
    /// Caller is the sole writer per the rules in the type docs.
    pub unsafe fn zero(&self) {
        (*self.0.get()).fill(0);
    }

    /// # Safety
    /// Caller excludes concurrent writers per the rules in the type docs.
    pub unsafe fn read(&self) -> [u8; PAGE_SIZE] {
        *self.0.get()
    }
}

/// Metadata record for one cache line.
///
/// Cache-line aligned so neighbouring lines do not false-share. The rmap
/// list is owned by the metadata record and guarded by the `LOCKED` bit;
/// access goes through [`LineGuard`].
#[repr(align(64))]
pub struct CacheLine {
    pub bits: AtomicBits<LineFlags>,
    pub mapcount: AtomicU32,
    pub refcount: AtomicU32,
    rmap: UnsafeCell<Vec<RmapEntry>>,
}

// The rmap vec is only touched through `LineGuard`, whose uniqueness is
// enforced by the `LOCKED` bit.
unsafe impl Sync for CacheLine {}

impl CacheLine {
    pub fn new() -> Self {
        CacheLine {
            bits: AtomicBits::new(),
            mapcount: AtomicU32::new(0),
            refcount: AtomicU32::new(0),
            rmap: UnsafeCell::new(Vec::new()),
        }
    }

    /// Spin until the `LOCKED` bit is ours.
    pub fn lock(&self) -> LineGuard<'_> {
        let mut spins = 0u32;
        while self.bits.test_and_set(LineFlags::LOCKED, Ordering::Acquire) {
            spins += 1;
            if spins % 64 == 0 {
                std::thread::yield_now();
            } else {
                hint::spin_loop();
            }
        }
        LineGuard { line: self }
    }

    pub fn try_lock(&self) -> Option<LineGuard<'_>> {
        if self.bits.test_and_set(LineFlags::LOCKED, Ordering::Acquire) {
            None
        } else {
            Some(LineGuard { line: self })
        }
    }
}

/// Holder of a line's `LOCKED` bit. Grants rmap access; releases on drop.
pub struct LineGuard<'a> {
    line: &'a CacheLine,
}

impl<'a> LineGuard<'a> {
    pub fn line(&self) -> &'a CacheLine {
        self.line
    }

    pub fn rmap(&self) -> &Vec<RmapEntry> {
        // LOCKED is held, so no concurrent mutation.
        unsafe { &*self.line.rmap.get() }
    }

    pub fn rmap_mut(&mut self) -> &mut Vec<RmapEntry> {
        unsafe { &mut *self.line.rmap.get() }
    }
}

impl Drop for LineGuard<'_> {
    fn drop(&mut self) {
        self.line.bits.clear(LineFlags::LOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_excludes() {
        let line = CacheLine::new();
        let g = line.lock();
        assert!(line.try_lock().is_none());
        drop(g);
        assert!(line.try_lock().is_some());
    }

    #[test]
    fn page_buf_round_trip() {
        let buf = PageBuf::new();
        let mut page = [0u8; PAGE_SIZE];
        page[0] = 0xaa;
        page[PAGE_SIZE - 1] = 0x55;
        // Single-threaded: trivially the sole writer.
        unsafe {
            buf.write(&page);
            assert_eq!(buf.read(), page);
            buf.zero();
            assert_eq!(buf.read()[0], 0);
        }
    }
}
