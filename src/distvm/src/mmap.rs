//! Single-tree mmap-family operations. Both the local router and the
//! per-range trees of the distributed router run on these.

use std::sync::Arc;

use fabric::PAGE_SHIFT;
use scopeguard::{guard, ScopeGuard};
use tracing::trace;

use crate::error::{MremapSite, VmError, VmResult};
use crate::file::VmFile;
use crate::flags::{MapFlags, MremapFlags, MsFlags, ProtFlags, VmFlags};
use crate::task::PageStore;
use crate::vma::{page_align_up, page_aligned, Vma, VmaTree};

/// Map `[addr, addr + len)`; address choice honours the hint and
/// `MAP_FIXED`. Fixed placement silently replaces whatever was there.
#[allow(clippy::too_many_arguments)]
pub(crate) fn do_mmap(
    tree: &mut VmaTree,
    pages: &mut PageStore,
    file: Option<Arc<VmFile>>,
    hint: u64,
    len: u64,
    prot: ProtFlags,
    map: MapFlags,
    vm_flags: VmFlags,
    pgoff: u64,
) -> VmResult<u64> {
    if len == 0 {
        return Err(VmError::Invalid);
    }
    let len = page_align_up(len);
    let fixed = map.contains(MapFlags::FIXED);

    let addr = tree.get_unmapped_area(hint, len, fixed, true)?;
    if fixed {
        tree.unmap(addr, addr + len)?;
        pages.drop_range(addr, addr + len);
    }

    tree.insert(Vma {
        start: addr,
        end: addr + len,
        prot,
        flags: vm_flags,
        file,
        pgoff,
    })?;

    if map.contains(MapFlags::POPULATE) {
        pages.populate(addr, len);
    }
    trace!(addr = format_args!("{addr:#x}"), len, "mapped");
    Ok(addr)
}

pub(crate) fn do_munmap(
    tree: &mut VmaTree,
    pages: &mut PageStore,
    start: u64,
    len: u64,
) -> VmResult<()> {
    if !page_aligned(start) || len == 0 {
        return Err(VmError::Invalid);
    }
    let end = start
        .checked_add(page_align_up(len))
        .ok_or(VmError::Invalid)?;
    tree.unmap(start, end)?;
    pages.drop_range(start, end);
    Ok(())
}

/// Extend the heap with an anonymous RW mapping, coalescing with an
/// abutting anonymous predecessor of the same shape.
pub(crate) fn do_brk(tree: &mut VmaTree, addr: u64, len: u64) -> VmResult<()> {
    let end = addr.checked_add(len).ok_or(VmError::Invalid)?;
    let prot = ProtFlags::READ | ProtFlags::WRITE;
    let flags = VmFlags::READ | VmFlags::WRITE;

    if addr > tree.floor() {
        if let Some(prev) = tree.find_vma(addr - 1) {
            if prev.end == addr && prev.is_anonymous() && prev.flags == flags {
                let (start, pgoff) = (prev.start, prev.pgoff);
                return tree.adjust(start, start, end, pgoff);
            }
        }
    }

    tree.insert(Vma {
        start: addr,
        end,
        prot,
        flags,
        file: None,
        pgoff: 0,
    })
}

/// The single VMA that must back `[old_addr, old_addr + old_len)` for a
/// resize to be legal.
pub(crate) fn vma_to_resize(tree: &VmaTree, old_addr: u64, old_len: u64) -> VmResult<Vma> {
    let vma = tree.find_vma(old_addr).ok_or(VmError::NoMemory)?;
    if vma.start > old_addr {
        return Err(VmError::NoMemory);
    }
    if old_len > vma.end - old_addr {
        // Resizing across VMAs is not a thing.
        return Err(VmError::NoMemory);
    }
    Ok(vma.clone())
}

/// Relocate `[old_addr, old_addr + old_len)` to `[new_addr, new_addr +
/// new_len)`, carrying backing frames along. Restores the original mapping
/// if the destination insert fails.
pub(crate) fn move_vma(
    tree: &mut VmaTree,
    pages: &mut PageStore,
    old_addr: u64,
    old_len: u64,
    new_len: u64,
    new_addr: u64,
) -> VmResult<u64> {
    let removed = tree.unmap(old_addr, old_addr + old_len)?;
    let Some(first) = removed.first() else {
        return Err(VmError::NoMemory);
    };

    let new_vma = Vma {
        start: new_addr,
        end: new_addr + new_len,
        prot: first.prot,
        flags: first.flags,
        file: first.file.clone(),
        pgoff: first.pgoff,
    };

    // Until the destination insert lands, any exit re-inserts the removed
    // pieces; mremap never leaves a hole on failure.
    let mut undo = guard((tree, removed), |(tree, pieces)| {
        for piece in pieces {
            let _ = tree.insert(piece);
        }
    });
    let (tree, _) = &mut *undo;
    tree.insert(new_vma)?;
    let _ = ScopeGuard::into_inner(undo);

    pages.move_range(old_addr, old_addr + old_len, new_addr);
    Ok(new_addr)
}

type MremapResult = Result<u64, (VmError, MremapSite)>;

/// The four mremap shapes: shrink, in-place grow, fixed-destination move,
/// may-move grow. Failure reporting carries the stable site tag that rides
/// the wire reply.
pub(crate) fn do_mremap(
    tree: &mut VmaTree,
    pages: &mut PageStore,
    old_addr: u64,
    old_len: u64,
    new_len: u64,
    flags: MremapFlags,
    new_addr: u64,
) -> MremapResult {
    if !page_aligned(old_addr) {
        return Err((VmError::Invalid, MremapSite::BadAddress));
    }
    let old_len = page_align_up(old_len);
    let new_len = page_align_up(new_len);
    if old_len == 0 || new_len == 0 {
        return Err((VmError::Invalid, MremapSite::BadAddress));
    }
    if flags.contains(MremapFlags::FIXED) && !flags.contains(MremapFlags::MAYMOVE) {
        return Err((VmError::Invalid, MremapSite::BadFlags));
    }
    match old_addr.checked_add(old_len) {
        Some(end) if end <= tree.ceiling() => {}
        _ => return Err((VmError::Invalid, MremapSite::BadAddress)),
    }

    if flags.contains(MremapFlags::FIXED) {
        return mremap_to(tree, pages, old_addr, old_len, new_len, new_addr);
    }

    // A shrinking remap just unmaps the tail.
    if old_len >= new_len {
        if old_len != new_len {
            do_munmap(tree, pages, old_addr + new_len, old_len - new_len)
                .map_err(|e| (e, MremapSite::ShrinkUnmap))?;
        }
        return Ok(old_addr);
    }

    let vma = vma_to_resize(tree, old_addr, old_len).map_err(|e| (e, MremapSite::Resize))?;

    // Mapping runs exactly to the end of the VMA: try expanding in place.
    if old_len == vma.end - old_addr {
        if let Some(end) = old_addr.checked_add(new_len) {
            if expandable(tree, &vma, end) {
                tree.adjust(vma.start, vma.start, end, vma.pgoff)
                    .map_err(|e| (e, MremapSite::ExpandFailed))?;
                return Ok(old_addr);
            }
        }
    }

    if !flags.contains(MremapFlags::MAYMOVE) {
        return Err((VmError::Invalid, MremapSite::BadFlags));
    }

    let dest = tree
        .get_unmapped_area(0, new_len, false, true)
        .map_err(|e| (e, MremapSite::UnmappedArea))?;
    move_vma(tree, pages, old_addr, old_len, new_len, dest)
        .map_err(|e| (e, MremapSite::MoveFailed))
}

fn expandable(tree: &VmaTree, vma: &Vma, new_end: u64) -> bool {
    if new_end > tree.ceiling() {
        return false;
    }
    match tree.find_vma(vma.end) {
        Some(next) => next.start >= new_end,
        None => true,
    }
}

fn mremap_to(
    tree: &mut VmaTree,
    pages: &mut PageStore,
    old_addr: u64,
    mut old_len: u64,
    new_len: u64,
    new_addr: u64,
) -> MremapResult {
    if !page_aligned(new_addr) {
        return Err((VmError::Invalid, MremapSite::BadAddress));
    }
    let new_end = new_addr
        .checked_add(new_len)
        .ok_or((VmError::Invalid, MremapSite::BadAddress))?;
    if new_end > tree.ceiling() || new_addr < tree.floor() {
        return Err((VmError::Invalid, MremapSite::BadAddress));
    }
    // Source and destination may not overlap.
    if old_addr < new_addr + new_len && new_addr < old_addr + old_len {
        return Err((VmError::Invalid, MremapSite::BadAddress));
    }

    // Clear the destination.
    do_munmap(tree, pages, new_addr, new_len).map_err(|e| (e, MremapSite::DestUnmap))?;

    if old_len >= new_len {
        if old_len != new_len {
            do_munmap(tree, pages, old_addr + new_len, old_len - new_len)
                .map_err(|e| (e, MremapSite::ShrinkUnmap))?;
        }
        old_len = new_len;
    }

    vma_to_resize(tree, old_addr, old_len).map_err(|e| (e, MremapSite::Resize))?;

    let dest = tree
        .get_unmapped_area(new_addr, new_len, true, true)
        .map_err(|_| (VmError::NoMemory, MremapSite::UnmappedArea))?;
    move_vma(tree, pages, old_addr, old_len, new_len, dest)
        .map_err(|_| (VmError::NoMemory, MremapSite::MoveFailed))
}

/// Flush `[start, end)`. Uncovered stretches make the whole call report
/// `ENOMEM`, but every covered shared file mapping is still flushed. The
/// flush happens without dropping `mmap_sem`, so nothing can unmap the VMA
/// under us.
pub(crate) fn do_msync(tree: &VmaTree, start: u64, end: u64, flags: MsFlags) -> VmResult<()> {
    if start >= end {
        return Ok(());
    }
    let mut addr = start;
    let mut unmapped = false;

    loop {
        let Some(vma) = tree.find_vma(addr) else {
            unmapped = true;
            break;
        };
        if addr < vma.start {
            unmapped = true;
            if vma.start >= end {
                break;
            }
            addr = vma.start;
        }

        if flags.contains(MsFlags::SYNC) && vma.flags.contains(VmFlags::SHARED) {
            if let Some(file) = &vma.file {
                let fstart = (addr - vma.start) + (vma.pgoff << PAGE_SHIFT);
                let fend = fstart + (end.min(vma.end) - addr) - 1;
                file.sync_range(fstart, fend)?;
            }
        }

        addr = vma.end;
        if addr >= end {
            break;
        }
    }

    if unmapped {
        Err(VmError::NoMemory)
    } else {
        Ok(())
    }
}
