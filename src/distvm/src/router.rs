//! Distributed VMA routing.
//!
//! The address space is statically partitioned into fixed-width ranges, each
//! tagged with an owning memory node. The home node clips every operation to
//! the ranges it overlaps: local ranges mutate their own tree under
//! `mmap_sem`, remote ranges go through a bounded-timeout M2M RPC whose
//! reply carries the range's new `max_gap` for the local summary cache. The
//! range's owner is the sole serialisation point for structural edits in it.

use std::collections::BTreeMap;

use fabric::{
    decode_value, pack_name, unpack_name, GapMap, M2mFindvma, M2mFindvmaReply, M2mMmap,
    M2mMmapReply, M2mMremapGrow, M2mMremapGrowReply, M2mMremapMove, M2mMremapMoveReply,
    M2mMremapMoveSplit, M2mMremapMoveSplitReply, M2mMsync, M2mMsyncReply, M2mMunmap,
    M2mMunmapReply, NodeId, Opcode, RetCode, PAGE_SIZE, WIRE_NAME_LEN,
};
use rustc_hash::FxHashMap;
use scopeguard::{guard, ScopeGuard};
use smallvec::SmallVec;
use tracing::debug;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{MremapSite, VmError, VmResult};
use crate::flags::{vm_flags_of, MapFlags, MremapFlags, MsFlags, ProtFlags, VmFlags};
use crate::mmap::{self, do_mmap, do_munmap, vma_to_resize};
use crate::task::{MmInner, MmView, Task};
use crate::vma::{page_align_up, page_aligned, Vma, VmaTree};
use crate::MemoryNode;

/// Cluster-wide assignment of VMA ranges to owning nodes. Shared by every
/// node; ownership is static for the life of the cluster.
pub struct Placement {
    width: u64,
    default_owner: NodeId,
    overrides: FxHashMap<u64, NodeId>,
}

impl Placement {
    /// `width` must be a page-aligned power of two (1 GiB in the reference
    /// deployment).
    pub fn new(width: u64, default_owner: NodeId) -> Placement {
        assert!(width.is_power_of_two() && width >= PAGE_SIZE);
        Placement {
            width,
            default_owner,
            overrides: FxHashMap::default(),
        }
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn assign(&mut self, range_start: u64, owner: NodeId) {
        assert_eq!(range_start % self.width, 0);
        self.overrides.insert(range_start, owner);
    }

    pub fn range_start(&self, addr: u64) -> u64 {
        addr & !(self.width - 1)
    }

    pub fn owner_of(&self, addr: u64) -> NodeId {
        self.overrides
            .get(&self.range_start(addr))
            .copied()
            .unwrap_or(self.default_owner)
    }
}

#[derive(Debug)]
pub enum RangeView {
    /// This node owns the range and holds its tree.
    Local(VmaTree),
    /// Owned elsewhere; we only cache the owner's last reported gap.
    Remote { cached_max_gap: u64 },
}

#[derive(Debug)]
pub struct VmRange {
    pub start: u64,
    pub end: u64,
    pub owner: NodeId,
    pub view: RangeView,
}

impl VmRange {
    pub fn max_gap(&self) -> u64 {
        match &self.view {
            RangeView::Local(tree) => tree.max_gap(),
            RangeView::Remote { cached_max_gap } => *cached_max_gap,
        }
    }

    pub fn local_tree(&self) -> Option<&VmaTree> {
        match &self.view {
            RangeView::Local(tree) => Some(tree),
            RangeView::Remote { .. } => None,
        }
    }
}

/// Per-mm table of materialised ranges. Ranges come into existence on first
/// touch; an absent range has no mappings.
#[derive(Debug)]
pub struct RangeMap {
    width: u64,
    floor: u64,
    limit: u64,
    ranges: BTreeMap<u64, VmRange>,
}

impl RangeMap {
    pub fn new(width: u64, floor: u64, limit: u64) -> RangeMap {
        assert!(width.is_power_of_two());
        assert_eq!(limit % width, 0);
        RangeMap {
            width,
            floor,
            limit,
            ranges: BTreeMap::new(),
        }
    }

    pub fn width(&self) -> u64 {
        self.width
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn range_start(&self, addr: u64) -> u64 {
        addr & !(self.width - 1)
    }

    pub fn range(&self, rstart: u64) -> Option<&VmRange> {
        self.ranges.get(&rstart)
    }

    /// Gap estimate without materialising: untouched ranges are fully free.
    pub fn gap_hint(&self, rstart: u64) -> u64 {
        match self.ranges.get(&rstart) {
            Some(r) => r.max_gap(),
            None => {
                let lo = rstart.max(self.floor);
                let hi = (rstart + self.width).min(self.limit);
                hi.saturating_sub(lo)
            }
        }
    }

    pub fn ensure(&mut self, rstart: u64, placement: &Placement, my_nid: NodeId) -> &mut VmRange {
        let floor = self.floor;
        let limit = self.limit;
        let width = self.width;
        self.ranges.entry(rstart).or_insert_with(|| {
            let owner = placement.owner_of(rstart);
            let lo = rstart.max(floor);
            let hi = (rstart + width).min(limit);
            let view = if owner == my_nid {
                RangeView::Local(VmaTree::new(lo, hi))
            } else {
                RangeView::Remote {
                    cached_max_gap: hi - lo,
                }
            };
            debug!(rstart = format_args!("{rstart:#x}"), owner, "range materialised");
            VmRange {
                start: rstart,
                end: rstart + width,
                owner,
                view,
            }
        })
    }

    pub fn update_cached_gap(&mut self, rstart: u64, gap: u64) {
        if let Some(range) = self.ranges.get_mut(&rstart) {
            if let RangeView::Remote { cached_max_gap } = &mut range.view {
                *cached_max_gap = gap;
            }
        }
    }

    /// Split `[start, end)` into per-range slices `(range_start, a, b)`.
    /// Anything past the address-space limit is silently dropped.
    pub fn clip(&self, start: u64, end: u64) -> SmallVec<[(u64, u64, u64); 4]> {
        let mut out = SmallVec::new();
        let end = end.min(self.limit);
        let mut a = start;
        while a < end {
            let rstart = self.range_start(a);
            let b = end.min(rstart + self.width);
            out.push((rstart, a, b));
            a = b;
        }
        out
    }

    /// Temporarily detach two distinct ranges so both trees can be borrowed
    /// mutably. Re-attach with [`Self::put_back`].
    fn take_pair(&mut self, a: u64, b: u64) -> Option<(VmRange, VmRange)> {
        debug_assert_ne!(a, b);
        let ra = self.ranges.remove(&a)?;
        match self.ranges.remove(&b) {
            Some(rb) => Some((ra, rb)),
            None => {
                self.ranges.insert(a, ra);
                None
            }
        }
    }

    fn put_back(&mut self, r: VmRange) {
        self.ranges.insert(r.start, r);
    }
}

fn dist_view(inner: &mut MmInner) -> (&mut RangeMap, &mut crate::task::PageStore) {
    let MmInner { view, pages, .. } = inner;
    match view {
        MmView::Dist(map) => (map, pages),
        MmView::Local(_) => unreachable!("distributed op on a local mm"),
    }
}

struct MoveDescriptor {
    vm_flags: VmFlags,
    prot: ProtFlags,
    pgoff: u64,
    f_name: [u8; WIRE_NAME_LEN],
}

impl MemoryNode {
    fn rpc<T: AsBytes, R: FromBytes>(&self, dst: NodeId, op: Opcode, payload: &T) -> VmResult<R> {
        let bytes = self.fabric.send_reply_timeout(
            self.cfg.nid,
            dst,
            op,
            payload.as_bytes(),
            self.cfg.rpc_timeout,
        )?;
        R::read_from_prefix(&bytes).ok_or_else(|| VmError::Transport("malformed reply".into()))
    }

    // === Home-node side === //

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dist_mmap(
        &self,
        task: &Task,
        inner: &mut MmInner,
        f_name: &str,
        hint: u64,
        len: u64,
        prot: ProtFlags,
        map_flags: MapFlags,
        pgoff: u64,
        gaps: &mut GapMap,
    ) -> VmResult<u64> {
        if len == 0 {
            return Err(VmError::Invalid);
        }
        let len = page_align_up(len);
        let fixed = map_flags.contains(MapFlags::FIXED);
        let (ranges, _) = dist_view(inner);

        if fixed || hint != 0 {
            // Placement is confined to the hinted range.
            let rstart = ranges.range_start(hint);
            let hint_end = hint.checked_add(len).ok_or(VmError::Invalid)?;
            if hint_end > rstart + ranges.width() || rstart >= ranges.limit() {
                return Err(VmError::NoMemory);
            }
            let res =
                self.place_in_range(task, inner, rstart, hint, len, prot, map_flags, pgoff, f_name, gaps);
            if fixed || res.is_ok() {
                return res;
            }
            // Fall through: the hint was advisory and its range is full.
        }

        // Top-down over ranges, pruning on the cached gap summaries.
        let (ranges, _) = dist_view(inner);
        let width = ranges.width();
        let mut rstart = ranges.limit() - width;
        loop {
            if self.inner_gap_hint(inner, rstart) >= len {
                match self.place_in_range(
                    task, inner, rstart, 0, len, prot, map_flags, pgoff, f_name, gaps,
                ) {
                    Ok(addr) => return Ok(addr),
                    Err(VmError::NoMemory) => {}
                    Err(e) => return Err(e),
                }
            }
            if rstart < width {
                return Err(VmError::NoMemory);
            }
            rstart -= width;
        }
    }

    fn inner_gap_hint(&self, inner: &mut MmInner, rstart: u64) -> u64 {
        let (ranges, _) = dist_view(inner);
        ranges.gap_hint(rstart)
    }

    #[allow(clippy::too_many_arguments)]
    fn place_in_range(
        &self,
        task: &Task,
        inner: &mut MmInner,
        rstart: u64,
        hint: u64,
        len: u64,
        prot: ProtFlags,
        map_flags: MapFlags,
        pgoff: u64,
        f_name: &str,
        gaps: &mut GapMap,
    ) -> VmResult<u64> {
        let vm_flags = vm_flags_of(prot, map_flags);
        let file = if map_flags.contains(MapFlags::ANONYMOUS) || f_name.is_empty() {
            None
        } else {
            Some(task.files.open(f_name)?)
        };

        let placement = self.placement();
        let my = self.cfg.nid;
        let MmInner { view, pages, .. } = inner;
        let MmView::Dist(ranges) = view else {
            unreachable!("distributed op on a local mm")
        };
        let range = ranges.ensure(rstart, &placement, my);
        let owner = range.owner;

        if let RangeView::Local(tree) = &mut range.view {
            let addr = do_mmap(tree, pages, file, hint, len, prot, map_flags, vm_flags, pgoff)?;
            gaps.push(rstart, owner, tree.max_gap());
            return Ok(addr);
        }

        let req = M2mMmap {
            pid: task.pid,
            _pad: 0,
            new_range: rstart,
            addr: hint,
            len,
            prot: prot.bits(),
            flags: map_flags.bits(),
            vm_flags: vm_flags.bits(),
            pgoff,
            f_name: pack_name(f_name),
        };
        let reply: M2mMmapReply = self.rpc(owner, Opcode::M2mMmap, &req)?;
        let addr = decode_value(reply.addr)
            .map_err(|ret| VmError::from_ret(ret).unwrap_or(VmError::NoMemory))?;
        ranges.update_cached_gap(rstart, reply.max_gap);
        gaps.push(rstart, owner, reply.max_gap);
        Ok(addr)
    }

    pub(crate) fn dist_munmap(
        &self,
        task: &Task,
        inner: &mut MmInner,
        start: u64,
        len: u64,
        gaps: &mut GapMap,
    ) -> VmResult<()> {
        if !page_aligned(start) || len == 0 {
            return Err(VmError::Invalid);
        }
        let end = start
            .checked_add(page_align_up(len))
            .ok_or(VmError::Invalid)?;

        let (ranges, _) = dist_view(inner);
        let slices = ranges.clip(start, end);
        let mut first_err = None;

        for (rstart, a, b) in slices {
            let MmInner { view, pages, .. } = &mut *inner;
            let MmView::Dist(ranges) = view else {
                unreachable!()
            };
            // Untouched range: nothing mapped there, nothing to do.
            let Some(range) = ranges.ranges.get_mut(&rstart) else {
                continue;
            };
            let owner = range.owner;

            if let RangeView::Local(tree) = &mut range.view {
                if let Err(e) = do_munmap(tree, pages, a, b - a) {
                    first_err.get_or_insert(e);
                }
                gaps.push(rstart, owner, tree.max_gap());
                continue;
            }

            let req = M2mMunmap {
                pid: task.pid,
                _pad: 0,
                begin: a,
                len: b - a,
            };
            match self.rpc::<_, M2mMunmapReply>(owner, Opcode::M2mMunmap, &req) {
                Ok(reply) => {
                    ranges.update_cached_gap(rstart, reply.max_gap);
                    gaps.push(rstart, owner, reply.max_gap);
                    if let Some(e) = RetCode::from_raw(reply.status).and_then(VmError::from_ret) {
                        first_err.get_or_insert(e);
                    }
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Does anything intersect `[a, b)`, across all owning nodes?
    pub(crate) fn dist_find_intersection(
        &self,
        task: &Task,
        inner: &mut MmInner,
        a: u64,
        b: u64,
    ) -> VmResult<bool> {
        let (ranges, _) = dist_view(inner);
        for (rstart, lo, hi) in ranges.clip(a, b) {
            let Some(range) = ranges.ranges.get(&rstart) else {
                continue;
            };
            match &range.view {
                RangeView::Local(tree) => {
                    if tree.find_intersection(lo, hi).is_some() {
                        return Ok(true);
                    }
                }
                RangeView::Remote { .. } => {
                    let req = M2mFindvma {
                        pid: task.pid,
                        _pad: 0,
                        begin: lo,
                        end: hi,
                    };
                    let reply: M2mFindvmaReply =
                        self.rpc(range.owner, Opcode::M2mFindvma, &req)?;
                    if reply.vma_exist != 0 {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// Heap growth: a fixed anonymous mapping at `oldbrk`, placed with the
    /// range's owner.
    pub(crate) fn dist_brk(
        &self,
        task: &Task,
        inner: &mut MmInner,
        oldbrk: u64,
        len: u64,
        gaps: &mut GapMap,
    ) -> VmResult<()> {
        let (ranges, _) = dist_view(inner);
        let rstart = ranges.range_start(oldbrk);
        if oldbrk + len > rstart + ranges.width() {
            return Err(VmError::NoMemory);
        }

        let placement = self.placement();
        let my = self.cfg.nid;
        let MmView::Dist(ranges) = &mut inner.view else {
            unreachable!()
        };
        let range = ranges.ensure(rstart, &placement, my);
        let owner = range.owner;

        if let RangeView::Local(tree) = &mut range.view {
            mmap::do_brk(tree, oldbrk, len)?;
            gaps.push(rstart, owner, tree.max_gap());
            return Ok(());
        }

        let req = M2mMmap {
            pid: task.pid,
            _pad: 0,
            new_range: rstart,
            addr: oldbrk,
            len,
            prot: (ProtFlags::READ | ProtFlags::WRITE).bits(),
            flags: (MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED).bits(),
            vm_flags: (VmFlags::READ | VmFlags::WRITE).bits(),
            pgoff: 0,
            f_name: pack_name(""),
        };
        let reply: M2mMmapReply = self.rpc(owner, Opcode::M2mMmap, &req)?;
        decode_value(reply.addr)
            .map_err(|ret| VmError::from_ret(ret).unwrap_or(VmError::NoMemory))?;
        ranges.update_cached_gap(rstart, reply.max_gap);
        gaps.push(rstart, owner, reply.max_gap);
        Ok(())
    }

    /// Shard the sync by range and union the statuses, the same way the
    /// reply wire slot does.
    pub(crate) fn dist_msync(
        &self,
        task: &Task,
        inner: &MmInner,
        start: u64,
        len: u64,
        flags: MsFlags,
    ) -> u32 {
        let end = start.saturating_add(len);
        let MmView::Dist(ranges) = &inner.view else {
            unreachable!("distributed op on a local mm")
        };
        let slices = ranges.clip(start, end);
        let mut status = RetCode::Okay as u32;

        for (rstart, a, b) in slices {
            let Some(range) = ranges.ranges.get(&rstart) else {
                status |= RetCode::Enomem as u32;
                continue;
            };
            match &range.view {
                RangeView::Local(tree) => {
                    if let Err(e) = mmap::do_msync(tree, a, b, flags) {
                        status |= e.ret() as u32;
                    }
                }
                RangeView::Remote { .. } => {
                    let req = M2mMsync {
                        pid: task.pid,
                        _pad: 0,
                        start: a,
                        len: b - a,
                        flags: flags.bits(),
                    };
                    match self.rpc::<_, M2mMsyncReply>(range.owner, Opcode::M2mMsync, &req) {
                        Ok(reply) => status |= reply.status,
                        Err(e) => status |= e.ret() as u32,
                    }
                }
            }
        }
        status
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dist_mremap(
        &self,
        task: &Task,
        inner: &mut MmInner,
        old_addr: u64,
        old_len: u64,
        new_len: u64,
        flags: MremapFlags,
        new_addr: u64,
        gaps: &mut GapMap,
    ) -> Result<u64, (VmError, MremapSite)> {
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

        let (ranges, _) = dist_view(inner);
        let width = ranges.width();
        let limit = ranges.limit();
        let src_rstart = ranges.range_start(old_addr);
        let old_end = old_addr
            .checked_add(old_len)
            .ok_or((VmError::Invalid, MremapSite::BadAddress))?;
        if old_end > limit {
            return Err((VmError::Invalid, MremapSite::BadAddress));
        }
        // A mapping never spans ranges, so neither may the source span.
        if old_end > src_rstart + width {
            return Err((VmError::Invalid, MremapSite::CrossNode));
        }
        if flags.contains(MremapFlags::FIXED) {
            let new_end = new_addr
                .checked_add(new_len)
                .ok_or((VmError::Invalid, MremapSite::BadAddress))?;
            if new_end > limit {
                return Err((VmError::Invalid, MremapSite::BadAddress));
            }
            // Fixed destination may not overlap the source.
            if old_addr < new_end && new_addr < old_end {
                return Err((VmError::Invalid, MremapSite::BadAddress));
            }
        }

        // Shrink: drop the tail wherever it lives.
        if !flags.contains(MremapFlags::FIXED) && old_len >= new_len {
            if old_len != new_len {
                self.dist_munmap(task, inner, old_addr + new_len, old_len - new_len, gaps)
                    .map_err(|e| (e, MremapSite::ShrinkUnmap))?;
            }
            return Ok(old_addr);
        }

        // Try growing in place within the source range.
        if !flags.contains(MremapFlags::FIXED)
            && old_addr
                .checked_add(new_len)
                .is_some_and(|end| end <= src_rstart + width)
        {
            match self.dist_grow_in_place(task, inner, src_rstart, old_addr, old_len, new_len, gaps)
            {
                Ok(()) => return Ok(old_addr),
                Err((VmError::NoMemory, _)) => {} // fall through to a move
                Err(e) => return Err(e),
            }
        }

        if !flags.contains(MremapFlags::MAYMOVE) {
            return Err((VmError::Invalid, MremapSite::BadFlags));
        }

        // Destination range.
        let (dst_rstart, dst_hint, dst_fixed) = if flags.contains(MremapFlags::FIXED) {
            let (ranges, _) = dist_view(inner);
            let rstart = ranges.range_start(new_addr);
            if new_addr + new_len > rstart + width {
                return Err((VmError::NoMemory, MremapSite::BadAddress));
            }
            (rstart, new_addr, true)
        } else {
            let rstart = self
                .pick_range_topdown(inner, new_len)
                .ok_or((VmError::NoMemory, MremapSite::UnmappedArea))?;
            (rstart, 0, false)
        };

        self.dist_move(
            task, inner, src_rstart, old_addr, old_len, dst_rstart, dst_hint, dst_fixed, new_len,
            gaps,
        )
    }

    fn pick_range_topdown(&self, inner: &mut MmInner, len: u64) -> Option<u64> {
        let (ranges, _) = dist_view(inner);
        let width = ranges.width();
        let mut rstart = ranges.limit() - width;
        loop {
            if ranges.gap_hint(rstart) >= len {
                return Some(rstart);
            }
            if rstart < width {
                return None;
            }
            rstart -= width;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn dist_grow_in_place(
        &self,
        task: &Task,
        inner: &mut MmInner,
        rstart: u64,
        old_addr: u64,
        old_len: u64,
        new_len: u64,
        gaps: &mut GapMap,
    ) -> Result<(), (VmError, MremapSite)> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let MmInner { view, .. } = inner;
        let MmView::Dist(ranges) = view else {
            unreachable!()
        };
        let range = ranges.ensure(rstart, &placement, my);
        let owner = range.owner;

        if let RangeView::Local(tree) = &mut range.view {
            let vma =
                vma_to_resize(tree, old_addr, old_len).map_err(|e| (e, MremapSite::Resize))?;
            if old_len != vma.end - old_addr {
                return Err((VmError::NoMemory, MremapSite::Resize));
            }
            let new_end = old_addr + new_len;
            let room = match tree.find_vma(vma.end) {
                Some(next) => next.start >= new_end,
                None => new_end <= tree.ceiling(),
            };
            if !room {
                return Err((VmError::NoMemory, MremapSite::ExpandFailed));
            }
            tree.adjust(vma.start, vma.start, new_end, vma.pgoff)
                .map_err(|e| (e, MremapSite::ExpandFailed))?;
            gaps.push(rstart, owner, tree.max_gap());
            return Ok(());
        }

        let req = M2mMremapGrow {
            pid: task.pid,
            _pad: 0,
            addr: old_addr,
            old_len,
            new_len,
        };
        let reply: M2mMremapGrowReply = self
            .rpc(owner, Opcode::M2mMremapGrow, &req)
            .map_err(|e| (e, MremapSite::ExpandFailed))?;
        ranges.update_cached_gap(rstart, reply.max_gap);
        gaps.push(rstart, owner, reply.max_gap);
        match RetCode::from_raw(reply.status).and_then(VmError::from_ret) {
            None => Ok(()),
            Some(e) => Err((e, MremapSite::ExpandFailed)),
        }
    }

    /// The cross-range move dance. Depending on where the two ranges live:
    /// both local -> plain tree-to-tree move; same remote owner -> one
    /// `MREMAP_MOVE`; otherwise a `MOVE_SPLIT` at the destination owner
    /// followed by `MUNMAP` at the source owner.
    #[allow(clippy::too_many_arguments)]
    fn dist_move(
        &self,
        task: &Task,
        inner: &mut MmInner,
        src_rstart: u64,
        old_addr: u64,
        old_len: u64,
        dst_rstart: u64,
        dst_hint: u64,
        dst_fixed: bool,
        new_len: u64,
        gaps: &mut GapMap,
    ) -> Result<u64, (VmError, MremapSite)> {
        let placement = self.placement();
        let my = self.cfg.nid;

        let src_owner = placement.owner_of(old_addr);
        let dst_owner = placement.owner_of(dst_rstart.max(dst_hint));

        if src_owner == my && dst_owner == my {
            return self.move_local_local(
                inner, src_rstart, old_addr, old_len, dst_rstart, dst_hint, dst_fixed, new_len,
                gaps,
            );
        }

        if src_owner == dst_owner && src_owner != my && !dst_fixed {
            // One owner holds both ranges; it moves internally.
            let req = M2mMremapMove {
                pid: task.pid,
                _pad: 0,
                old_addr,
                old_len,
                new_len,
                new_range: if dst_fixed { dst_hint } else { dst_rstart },
            };
            let reply: M2mMremapMoveReply = self
                .rpc(src_owner, Opcode::M2mMremapMove, &req)
                .map_err(|e| (e, MremapSite::MoveFailed))?;
            let new_addr = decode_value(reply.new_addr).map_err(|ret| {
                (
                    VmError::from_ret(ret).unwrap_or(VmError::NoMemory),
                    MremapSite::MoveFailed,
                )
            })?;
            let MmView::Dist(ranges) = &mut inner.view else {
                unreachable!()
            };
            ranges.update_cached_gap(src_rstart, reply.old_max_gap);
            ranges.update_cached_gap(dst_rstart, reply.new_max_gap);
            gaps.push(src_rstart, src_owner, reply.old_max_gap);
            gaps.push(dst_rstart, dst_owner, reply.new_max_gap);
            return Ok(new_addr);
        }

        // Owners differ. Get the mapping descriptor from wherever the
        // source lives, rebuild it at the destination, then drop the source.
        let desc = self
            .source_descriptor(task, inner, src_rstart, old_addr, old_len)
            .map_err(|e| (e, MremapSite::Resize))?;

        let new_addr = self
            .place_moved(
                task, inner, dst_rstart, dst_hint, dst_fixed, new_len, &desc, old_addr, old_len,
                gaps,
            )
            .map_err(|e| (e, MremapSite::MoveFailed))?;

        self.remove_source(task, inner, src_rstart, old_addr, old_len, gaps)
            .map_err(|e| (e, MremapSite::CrossNode))?;

        Ok(new_addr)
    }

    #[allow(clippy::too_many_arguments)]
    fn move_local_local(
        &self,
        inner: &mut MmInner,
        src_rstart: u64,
        old_addr: u64,
        old_len: u64,
        dst_rstart: u64,
        dst_hint: u64,
        dst_fixed: bool,
        new_len: u64,
        gaps: &mut GapMap,
    ) -> Result<u64, (VmError, MremapSite)> {
        let my = self.cfg.nid;
        let placement = self.placement();
        let MmInner { view, pages, .. } = inner;
        let MmView::Dist(ranges) = view else {
            unreachable!()
        };
        ranges.ensure(src_rstart, &placement, my);
        ranges.ensure(dst_rstart, &placement, my);

        if src_rstart == dst_rstart {
            let range = ranges.ensure(src_rstart, &placement, my);
            let RangeView::Local(tree) = &mut range.view else {
                return Err((VmError::Invalid, MremapSite::MoveFailed));
            };
            if dst_fixed {
                do_munmap(tree, pages, dst_hint, new_len)
                    .map_err(|e| (e, MremapSite::DestUnmap))?;
            }
            let dest = tree
                .get_unmapped_area(dst_hint, new_len, dst_fixed, true)
                .map_err(|e| (e, MremapSite::UnmappedArea))?;
            let got = mmap::move_vma(tree, pages, old_addr, old_len, new_len, dest)
                .map_err(|e| (e, MremapSite::MoveFailed))?;
            gaps.push(src_rstart, my, tree.max_gap());
            return Ok(got);
        }

        let Some((src, dst)) = ranges.take_pair(src_rstart, dst_rstart) else {
            return Err((VmError::NoMemory, MremapSite::MoveFailed));
        };
        // However the move ends, both ranges go back on the map and the
        // caller's gap summary sees their final state.
        let mut detached = guard((ranges, src, dst, gaps), |(ranges, src, dst, gaps)| {
            gaps.push(src_rstart, my, src.max_gap());
            gaps.push(dst_rstart, my, dst.max_gap());
            ranges.put_back(src);
            ranges.put_back(dst);
        });
        let (_, src, dst, _) = &mut *detached;

        let (RangeView::Local(src_tree), RangeView::Local(dst_tree)) =
            (&mut src.view, &mut dst.view)
        else {
            return Err((VmError::Invalid, MremapSite::MoveFailed));
        };
        if dst_fixed {
            do_munmap(dst_tree, pages, dst_hint, new_len)
                .map_err(|e| (e, MremapSite::DestUnmap))?;
        }
        let dest = dst_tree
            .get_unmapped_area(dst_hint, new_len, dst_fixed, true)
            .map_err(|e| (e, MremapSite::UnmappedArea))?;

        let removed = src_tree
            .unmap(old_addr, old_addr + old_len)
            .map_err(|e| (e, MremapSite::MoveFailed))?;
        let Some(first) = removed.first() else {
            return Err((VmError::NoMemory, MremapSite::Resize));
        };
        let vma = Vma {
            start: dest,
            end: dest + new_len,
            prot: first.prot,
            flags: first.flags,
            file: first.file.clone(),
            pgoff: first.pgoff,
        };

        // Source pieces go back unless the destination insert lands.
        let undo = guard((src_tree, removed), |(src_tree, pieces)| {
            for piece in pieces {
                let _ = src_tree.insert(piece);
            }
        });
        if dst_tree.insert(vma).is_err() {
            return Err((VmError::NoMemory, MremapSite::MoveFailed));
        }
        let _ = ScopeGuard::into_inner(undo);

        pages.move_range(old_addr, old_addr + old_len, dest);
        Ok(dest)
    }

    fn source_descriptor(
        &self,
        task: &Task,
        inner: &mut MmInner,
        src_rstart: u64,
        old_addr: u64,
        old_len: u64,
    ) -> VmResult<MoveDescriptor> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let MmView::Dist(ranges) = &mut inner.view else {
            unreachable!()
        };
        let range = ranges.ensure(src_rstart, &placement, my);

        match &range.view {
            RangeView::Local(tree) => {
                let vma = vma_to_resize(tree, old_addr, old_len)?;
                Ok(MoveDescriptor {
                    vm_flags: vma.flags,
                    prot: vma.prot,
                    pgoff: vma.pgoff_at(old_addr),
                    f_name: pack_name(vma.file.as_ref().map_or("", |f| f.name())),
                })
            }
            RangeView::Remote { .. } => {
                let req = M2mFindvma {
                    pid: task.pid,
                    _pad: 0,
                    begin: old_addr,
                    end: old_addr + old_len,
                };
                let reply: M2mFindvmaReply = self.rpc(range.owner, Opcode::M2mFindvma, &req)?;
                if reply.vma_exist == 0 {
                    return Err(VmError::NoMemory);
                }
                let vm_flags = VmFlags::from_bits_truncate(reply.vm_flags);
                let mut prot = ProtFlags::empty();
                if vm_flags.contains(VmFlags::READ) {
                    prot |= ProtFlags::READ;
                }
                if vm_flags.contains(VmFlags::WRITE) {
                    prot |= ProtFlags::WRITE;
                }
                if vm_flags.contains(VmFlags::EXEC) {
                    prot |= ProtFlags::EXEC;
                }
                Ok(MoveDescriptor {
                    vm_flags,
                    prot,
                    pgoff: reply.pgoff,
                    f_name: reply.f_name,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn place_moved(
        &self,
        task: &Task,
        inner: &mut MmInner,
        dst_rstart: u64,
        dst_hint: u64,
        dst_fixed: bool,
        new_len: u64,
        desc: &MoveDescriptor,
        old_addr: u64,
        old_len: u64,
        gaps: &mut GapMap,
    ) -> VmResult<u64> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let MmInner { view, pages, .. } = inner;
        let MmView::Dist(ranges) = view else {
            unreachable!()
        };
        let range = ranges.ensure(dst_rstart, &placement, my);
        let owner = range.owner;

        if let RangeView::Local(tree) = &mut range.view {
            if dst_fixed {
                do_munmap(tree, pages, dst_hint, new_len)?;
            }
            let dest = tree.get_unmapped_area(dst_hint, new_len, dst_fixed, true)?;
            let name = unpack_name(&desc.f_name);
            let file = if name.is_empty() {
                None
            } else {
                Some(task.files.open(name)?)
            };
            tree.insert(Vma {
                start: dest,
                end: dest + new_len,
                prot: desc.prot,
                flags: desc.vm_flags,
                file,
                pgoff: desc.pgoff,
            })?;
            gaps.push(dst_rstart, owner, tree.max_gap());
            return Ok(dest);
        }

        let req = M2mMremapMoveSplit {
            pid: task.pid,
            _pad: 0,
            new_range: dst_rstart,
            old_addr,
            old_len,
            new_addr: if dst_fixed { dst_hint } else { 0 },
            new_len,
            vm_flags: desc.vm_flags.bits(),
            pgoff: desc.pgoff,
            f_name: desc.f_name,
        };
        let reply: M2mMremapMoveSplitReply = self.rpc(owner, Opcode::M2mMremapMoveSplit, &req)?;
        let addr = decode_value(reply.new_addr)
            .map_err(|ret| VmError::from_ret(ret).unwrap_or(VmError::NoMemory))?;
        ranges.update_cached_gap(dst_rstart, reply.new_max_gap);
        gaps.push(dst_rstart, owner, reply.new_max_gap);
        Ok(addr)
    }

    fn remove_source(
        &self,
        task: &Task,
        inner: &mut MmInner,
        src_rstart: u64,
        old_addr: u64,
        old_len: u64,
        gaps: &mut GapMap,
    ) -> VmResult<()> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let MmInner { view, pages, .. } = inner;
        let MmView::Dist(ranges) = view else {
            unreachable!()
        };
        let range = ranges.ensure(src_rstart, &placement, my);
        let owner = range.owner;

        if let RangeView::Local(tree) = &mut range.view {
            do_munmap(tree, pages, old_addr, old_len)?;
            gaps.push(src_rstart, owner, tree.max_gap());
            return Ok(());
        }

        let req = M2mMunmap {
            pid: task.pid,
            _pad: 0,
            begin: old_addr,
            len: old_len,
        };
        let reply: M2mMunmapReply = self.rpc(owner, Opcode::M2mMunmap, &req)?;
        ranges.update_cached_gap(src_rstart, reply.max_gap);
        gaps.push(src_rstart, owner, reply.max_gap);
        match RetCode::from_raw(reply.status).and_then(VmError::from_ret) {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    // === Owner-node side === //

    /// Map into a range this node owns on behalf of the home node.
    pub(crate) fn owner_mmap(&self, task: &Task, req: &M2mMmap) -> VmResult<(u64, u64)> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let mut inner = task.lock_mm_write()?;
        let MmInner { view, pages, .. } = &mut *inner;
        let MmView::Dist(ranges) = view else {
            return Err(VmError::Invalid);
        };
        let range = ranges.ensure(req.new_range, &placement, my);
        let RangeView::Local(tree) = &mut range.view else {
            return Err(VmError::Invalid);
        };

        let name = unpack_name(&req.f_name);
        let map_flags = MapFlags::from_bits_truncate(req.flags);
        let file = if map_flags.contains(MapFlags::ANONYMOUS) || name.is_empty() {
            None
        } else {
            Some(task.files.open(name)?)
        };
        let prot = ProtFlags::from_bits_truncate(req.prot);
        let vm_flags = VmFlags::from_bits_truncate(req.vm_flags);

        let addr = do_mmap(
            tree, pages, file, req.addr, req.len, prot, map_flags, vm_flags, req.pgoff,
        )?;
        Ok((addr, tree.max_gap()))
    }

    pub(crate) fn owner_munmap(&self, task: &Task, req: &M2mMunmap) -> (RetCode, u64) {
        let placement = self.placement();
        let my = self.cfg.nid;
        let rstart = placement.range_start(req.begin);
        let mut inner = match task.lock_mm_write() {
            Ok(g) => g,
            Err(e) => return (e.ret(), 0),
        };
        let MmInner { view, pages, .. } = &mut *inner;
        let MmView::Dist(ranges) = view else {
            return (RetCode::Einval, 0);
        };
        // Materialise so the reported gap is exact even for a range the
        // home node never mapped into.
        let range = ranges.ensure(rstart, &placement, my);
        let RangeView::Local(tree) = &mut range.view else {
            return (RetCode::Einval, 0);
        };
        match do_munmap(tree, pages, req.begin, req.len) {
            Ok(()) => (RetCode::Okay, tree.max_gap()),
            Err(e) => (e.ret(), tree.max_gap()),
        }
    }

    pub(crate) fn owner_findvma(&self, task: &Task, req: &M2mFindvma) -> M2mFindvmaReply {
        let mut reply = M2mFindvmaReply {
            vma_exist: 0,
            _pad: 0,
            vm_flags: 0,
            pgoff: 0,
            f_name: pack_name(""),
        };
        let rstart = self.placement().range_start(req.begin);
        let Ok(inner) = task.lock_mm_write() else {
            return reply;
        };
        let MmView::Dist(ranges) = &inner.view else {
            return reply;
        };
        let Some(tree) = ranges.range(rstart).and_then(|r| r.local_tree()) else {
            return reply;
        };
        if let Some(vma) = tree.find_intersection(req.begin, req.end) {
            reply.vma_exist = 1;
            reply.vm_flags = vma.flags.bits();
            reply.pgoff = vma.pgoff_at(vma.start.max(req.begin));
            reply.f_name = pack_name(vma.file.as_ref().map_or("", |f| f.name()));
        }
        reply
    }

    pub(crate) fn owner_mremap_grow(&self, task: &Task, req: &M2mMremapGrow) -> (RetCode, u64) {
        let rstart = self.placement().range_start(req.addr);
        let mut inner = match task.lock_mm_write() {
            Ok(g) => g,
            Err(e) => return (e.ret(), 0),
        };
        let MmView::Dist(ranges) = &mut inner.view else {
            return (RetCode::Einval, 0);
        };
        let Some(range) = ranges.ranges.get_mut(&rstart) else {
            return (RetCode::Enomem, 0);
        };
        let RangeView::Local(tree) = &mut range.view else {
            return (RetCode::Einval, 0);
        };

        let vma = match vma_to_resize(tree, req.addr, req.old_len) {
            Ok(v) => v,
            Err(e) => return (e.ret(), tree.max_gap()),
        };
        let Some(new_end) = req.addr.checked_add(req.new_len) else {
            return (RetCode::Einval, tree.max_gap());
        };
        let room = req.old_len == vma.end - req.addr
            && match tree.find_vma(vma.end) {
                Some(next) => next.start >= new_end,
                None => new_end <= tree.ceiling(),
            };
        if !room {
            return (RetCode::Enomem, tree.max_gap());
        }
        match tree.adjust(vma.start, vma.start, new_end, vma.pgoff) {
            Ok(()) => (RetCode::Okay, tree.max_gap()),
            Err(e) => (e.ret(), tree.max_gap()),
        }
    }

    /// Move within this owner: both the old and new ranges are local here.
    pub(crate) fn owner_mremap_move(
        &self,
        task: &Task,
        req: &M2mMremapMove,
    ) -> VmResult<(u64, u64, u64)> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let src_rstart = placement.range_start(req.old_addr);
        let dst_rstart = placement.range_start(req.new_range);

        let mut inner = task.lock_mm_write()?;
        let mut gaps = GapMap::default();
        let got = self.move_local_local(
            &mut inner,
            src_rstart,
            req.old_addr,
            req.old_len,
            dst_rstart,
            0,
            false,
            req.new_len,
            &mut gaps,
        );
        let MmView::Dist(ranges) = &inner.view else {
            unreachable!()
        };
        let old_gap = ranges.range(src_rstart).map_or(0, |r| r.max_gap());
        let new_gap = ranges.range(dst_rstart).map_or(0, |r| r.max_gap());
        match got {
            Ok(addr) => Ok((addr, old_gap, new_gap)),
            Err((e, _)) => Err(e),
        }
    }

    /// Rebuild a moved mapping in a range this node owns; the home node
    /// unmaps the source separately. Backing pages ride the data path, not
    /// this control message.
    pub(crate) fn owner_mremap_move_split(
        &self,
        task: &Task,
        req: &M2mMremapMoveSplit,
    ) -> VmResult<(u64, u64)> {
        let placement = self.placement();
        let my = self.cfg.nid;
        let rstart = req.new_range;

        let mut inner = task.lock_mm_write()?;
        let MmInner { view, pages, .. } = &mut *inner;
        let MmView::Dist(ranges) = view else {
            return Err(VmError::Invalid);
        };
        let range = ranges.ensure(rstart, &placement, my);
        let RangeView::Local(tree) = &mut range.view else {
            return Err(VmError::Invalid);
        };

        let fixed = req.new_addr != 0;
        if fixed {
            do_munmap(tree, pages, req.new_addr, req.new_len)?;
        }
        let dest = tree.get_unmapped_area(req.new_addr, req.new_len, fixed, true)?;

        let vm_flags = VmFlags::from_bits_truncate(req.vm_flags);
        let mut prot = ProtFlags::empty();
        if vm_flags.contains(VmFlags::READ) {
            prot |= ProtFlags::READ;
        }
        if vm_flags.contains(VmFlags::WRITE) {
            prot |= ProtFlags::WRITE;
        }
        if vm_flags.contains(VmFlags::EXEC) {
            prot |= ProtFlags::EXEC;
        }
        let name = unpack_name(&req.f_name);
        let file = if name.is_empty() {
            None
        } else {
            Some(task.files.open(name)?)
        };

        tree.insert(Vma {
            start: dest,
            end: dest + req.new_len,
            prot,
            flags: vm_flags,
            file,
            pgoff: req.pgoff,
        })?;
        Ok((dest, tree.max_gap()))
    }

    pub(crate) fn owner_msync(&self, task: &Task, req: &M2mMsync) -> u32 {
        let Ok(inner) = task.lock_mm_write() else {
            return RetCode::Eintr as u32;
        };
        let MmView::Dist(ranges) = &inner.view else {
            return RetCode::Einval as u32;
        };
        let flags = MsFlags::from_bits_truncate(req.flags);
        let mut status = RetCode::Okay as u32;
        for (rstart, a, b) in ranges.clip(req.start, req.start.saturating_add(req.len)) {
            let Some(tree) = ranges.range(rstart).and_then(|r| r.local_tree()) else {
                continue;
            };
            if let Err(e) = mmap::do_msync(tree, a, b, flags) {
                status |= e.ret() as u32;
            }
        }
        status
    }
}
