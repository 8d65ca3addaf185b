//! Sorted VMA map with an exact largest-free-gap summary.
//!
//! VMAs are owned by a `BTreeMap` keyed on `vm_start`; intervals are
//! half-open, page aligned, and pairwise disjoint. `max_gap` is refreshed on
//! every structural edit and lets `get_unmapped_area` reject unsatisfiable
//! requests before walking, and lets the distributed router summarise a
//! whole range in one number.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use fabric::PAGE_SIZE;

use crate::error::{VmError, VmResult};
use crate::file::VmFile;
use crate::flags::{ProtFlags, VmFlags};

#[derive(Clone)]
pub struct Vma {
    /// Page aligned, half-open `[start, end)`.
    pub start: u64,
    pub end: u64,
    pub prot: ProtFlags,
    pub flags: VmFlags,
    pub file: Option<Arc<VmFile>>,
    /// File offset of `start`, in pages.
    pub pgoff: u64,
}

impl Vma {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_anonymous(&self) -> bool {
        self.file.is_none()
    }

    /// Page offset the file sees at `addr` inside this VMA.
    pub fn pgoff_at(&self, addr: u64) -> u64 {
        self.pgoff + ((addr - self.start) >> PAGE_SIZE.trailing_zeros())
    }
}

impl std::fmt::Debug for Vma {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Vma({:#x}..{:#x} {:?} {})",
            self.start,
            self.end,
            self.flags,
            self.file.as_ref().map_or("anon", |fl| fl.name()),
        )
    }
}

pub fn page_aligned(v: u64) -> bool {
    v & (PAGE_SIZE - 1) == 0
}

pub fn page_align_up(v: u64) -> u64 {
    (v + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

pub fn page_align_down(v: u64) -> u64 {
    v & !(PAGE_SIZE - 1)
}

#[derive(Debug)]
pub struct VmaTree {
    map: BTreeMap<u64, Vma>,
    floor: u64,
    ceiling: u64,
    max_gap: u64,
}

impl VmaTree {
    pub fn new(floor: u64, ceiling: u64) -> VmaTree {
        debug_assert!(page_aligned(floor) && page_aligned(ceiling) && floor < ceiling);
        VmaTree {
            map: BTreeMap::new(),
            floor,
            ceiling,
            max_gap: ceiling - floor,
        }
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Largest free gap inside the bounds. Exact after every edit.
    pub fn max_gap(&self) -> u64 {
        self.max_gap
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.map.values()
    }

    /// Smallest VMA with `vm_end > addr`.
    pub fn find_vma(&self, addr: u64) -> Option<&Vma> {
        if let Some((_, v)) = self.map.range(..=addr).next_back() {
            if v.end > addr {
                return Some(v);
            }
        }
        self.map
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()
            .map(|(_, v)| v)
    }

    /// Any VMA overlapping `[a, b)`.
    pub fn find_intersection(&self, a: u64, b: u64) -> Option<&Vma> {
        let v = self.find_vma(a)?;
        (v.start < b).then_some(v)
    }

    pub fn insert(&mut self, vma: Vma) -> VmResult<()> {
        if !page_aligned(vma.start) || !page_aligned(vma.end) || vma.start >= vma.end {
            return Err(VmError::Invalid);
        }
        if vma.start < self.floor || vma.end > self.ceiling {
            return Err(VmError::NoMemory);
        }
        if self.find_intersection(vma.start, vma.end).is_some() {
            return Err(VmError::Invalid);
        }
        self.map.insert(vma.start, vma);
        self.recompute_gap();
        Ok(())
    }

    pub fn remove(&mut self, start: u64) -> Option<Vma> {
        let v = self.map.remove(&start);
        if v.is_some() {
            self.recompute_gap();
        }
        v
    }

    /// Structural edit of the VMA starting at `start`: new bounds and file
    /// offset, neighbours untouched.
    pub fn adjust(
        &mut self,
        start: u64,
        new_start: u64,
        new_end: u64,
        new_pgoff: u64,
    ) -> VmResult<()> {
        let mut vma = self.map.remove(&start).ok_or(VmError::Invalid)?;
        let outcome = (|| {
            if !page_aligned(new_start) || !page_aligned(new_end) || new_start >= new_end {
                return Err(VmError::Invalid);
            }
            if new_start < self.floor || new_end > self.ceiling {
                return Err(VmError::NoMemory);
            }
            if self.find_intersection(new_start, new_end).is_some() {
                return Err(VmError::Invalid);
            }
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                vma.start = new_start;
                vma.end = new_end;
                vma.pgoff = new_pgoff;
                self.map.insert(new_start, vma);
                self.recompute_gap();
                Ok(())
            }
            Err(e) => {
                // Put the original back; adjust either applies or is a no-op.
                self.map.insert(vma.start, vma);
                Err(e)
            }
        }
    }

    /// Unmap `[a, b)`: VMAs straddling either endpoint are split, the middle
    /// pieces are removed and returned (the mover reuses them).
    pub fn unmap(&mut self, a: u64, b: u64) -> VmResult<Vec<Vma>> {
        if !page_aligned(a) || !page_aligned(b) || a >= b {
            return Err(VmError::Invalid);
        }

        let touched: Vec<u64> = self
            .map
            .range(..b)
            .filter(|(_, v)| v.end > a)
            .map(|(&s, _)| s)
            .collect();

        let mut removed = Vec::new();
        for start in touched {
            let vma = self.map.remove(&start).expect("key just listed");
            let cut_lo = vma.start.max(a);
            let cut_hi = vma.end.min(b);

            if vma.start < cut_lo {
                let mut left = vma.clone();
                left.end = cut_lo;
                self.map.insert(left.start, left);
            }
            if vma.end > cut_hi {
                let mut right = vma.clone();
                right.pgoff = vma.pgoff_at(cut_hi);
                right.start = cut_hi;
                self.map.insert(right.start, right);
            }

            let mut middle = vma.clone();
            middle.pgoff = vma.pgoff_at(cut_lo);
            middle.start = cut_lo;
            middle.end = cut_hi;
            removed.push(middle);
        }

        if !removed.is_empty() {
            self.recompute_gap();
        }
        Ok(removed)
    }

    /// Pick a free `[addr, addr + len)`.
    ///
    /// `fixed` trusts the hint (the caller clears whatever is there); a
    /// plain hint is honoured when free; otherwise the walk is top-down by
    /// default, bottom-up when `topdown` is false. `max_gap` rejects
    /// unsatisfiable lengths without walking.
    pub fn get_unmapped_area(
        &self,
        hint: u64,
        len: u64,
        fixed: bool,
        topdown: bool,
    ) -> VmResult<u64> {
        if len == 0 || !page_aligned(len) {
            return Err(VmError::Invalid);
        }
        if fixed {
            if !page_aligned(hint) {
                return Err(VmError::Invalid);
            }
            if hint < self.floor || hint.checked_add(len).is_none() || hint + len > self.ceiling {
                return Err(VmError::NoMemory);
            }
            return Ok(hint);
        }
        if len > self.max_gap {
            return Err(VmError::NoMemory);
        }
        if hint != 0 && page_aligned(hint) && hint >= self.floor {
            if let Some(hint_end) = hint.checked_add(len) {
                if hint_end <= self.ceiling && self.find_intersection(hint, hint_end).is_none() {
                    return Ok(hint);
                }
            }
        }

        let mut best = None;
        self.for_each_gap(|lo, hi| {
            if hi - lo >= len {
                if topdown {
                    best = Some(hi - len); // keep going; later gaps sit higher
                } else if best.is_none() {
                    best = Some(lo);
                }
            }
        });
        best.ok_or(VmError::NoMemory)
    }

    fn for_each_gap(&self, mut f: impl FnMut(u64, u64)) {
        let mut prev = self.floor;
        for v in self.map.values() {
            if v.start > prev {
                f(prev, v.start);
            }
            prev = v.end;
        }
        if self.ceiling > prev {
            f(prev, self.ceiling);
        }
    }

    fn recompute_gap(&mut self) {
        let mut max = 0;
        self.for_each_gap(|lo, hi| max = max.max(hi - lo));
        self.max_gap = max;
    }

    /// Structural invariants, asserted by tests after mutation storms.
    #[cfg(test)]
    pub fn assert_invariants(&self) {
        let mut prev_end = self.floor;
        for (&key, v) in &self.map {
            assert_eq!(key, v.start);
            assert!(page_aligned(v.start) && page_aligned(v.end));
            assert!(v.start < v.end, "{v:?}");
            assert!(v.start >= prev_end, "overlap before {v:?}");
            assert!(v.end <= self.ceiling);
            prev_end = v.end;
        }
        let mut truth = 0;
        self.for_each_gap(|lo, hi| truth = truth.max(hi - lo));
        assert_eq!(self.max_gap, truth, "stale max_gap");
    }
}
