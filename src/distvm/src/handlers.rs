//! P2M and M2M request handlers.
//!
//! Every handler follows one shape: decode the payload, look up the task by
//! `(src_nid, pid)` (`ESRCH` if absent), take `mmap_sem` killably (`EINTR`
//! on a fatal signal, nothing mutated), perform the operation, reply through
//! the one-shot descriptor. Replies always fire, including on decode
//! failures.

use fabric::{
    err_value, unpack_name, GapMap, M2mFindvma, M2mFindvmaReply, M2mMmap, M2mMmapReply,
    M2mMremapGrow, M2mMremapGrowReply, M2mMremapMove, M2mMremapMoveReply, M2mMremapMoveSplit,
    M2mMremapMoveSplitReply, M2mMsync, M2mMsyncReply, M2mMunmap, M2mMunmapReply, MessageHandler,
    Opcode, P2mBrk, P2mBrkReply, P2mMmap, P2mMmapReply, P2mMprotect, P2mMprotectReply, P2mMremap,
    P2mMremapReply, P2mMsync, P2mMsyncReply, P2mMunmap, P2mMunmapReply, Request, RetCode,
    PAGE_SIZE,
};
use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeroes};

use crate::error::{MremapSite, VmError};
use crate::flags::{vm_flags_of, MapFlags, MremapFlags, MsFlags, ProtFlags};
use crate::mmap::{do_brk, do_mmap, do_mremap, do_msync, do_munmap};
use crate::task::{MmInner, MmView, Task};
use crate::vma::page_align_up;
use crate::MemoryNode;

impl MessageHandler for MemoryNode {
    fn handle(&self, req: Request) {
        match req.opcode {
            Opcode::P2mBrk => self.handle_p2m_brk(req),
            Opcode::P2mMmap => self.handle_p2m_mmap(req),
            Opcode::P2mMunmap => self.handle_p2m_munmap(req),
            Opcode::P2mMremap => self.handle_p2m_mremap(req),
            Opcode::P2mMsync => self.handle_p2m_msync(req),
            Opcode::P2mMprotect => self.handle_p2m_mprotect(req),
            Opcode::M2mMmap => self.handle_m2m_mmap(req),
            Opcode::M2mMunmap => self.handle_m2m_munmap(req),
            Opcode::M2mFindvma => self.handle_m2m_findvma(req),
            Opcode::M2mMremapGrow => self.handle_m2m_mremap_grow(req),
            Opcode::M2mMremapMove => self.handle_m2m_mremap_move(req),
            Opcode::M2mMremapMoveSplit => self.handle_m2m_mremap_move_split(req),
            Opcode::M2mMsync => self.handle_m2m_msync(req),
        }
    }
}

/// Decode, or fire `$reply` and bail. A silent drop would turn a malformed
/// request into a sender-side timeout.
macro_rules! decode {
    ($req:expr, $payload_ty:ty, $reply:expr) => {
        match <$payload_ty>::read_from_prefix($req.payload.as_slice()) {
            Some(p) => p,
            None => {
                warn!(opcode = ?$req.opcode, "malformed payload");
                $req.reply.reply(&$reply);
                return;
            }
        }
    };
}

impl MemoryNode {
    // === P2M === //

    fn handle_p2m_brk(&self, req: Request) {
        let p = decode!(
            req,
            P2mBrk,
            P2mBrkReply {
                ret_brk: RetCode::Einval as u64,
                ..P2mBrkReply::default()
            }
        );
        debug!(
            src_nid = req.hdr.src_nid,
            pid = p.pid,
            brk = format_args!("{:#x}", p.brk),
            "brk"
        );

        let mut reply = P2mBrkReply::default();
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            reply.ret_brk = RetCode::Esrch as u64;
            req.reply.reply(&reply);
            return;
        };

        match task.lock_mm_write() {
            Ok(mut inner) => {
                self.brk_locked(&task, &mut inner, p.brk, &mut reply.map);
                reply.ret_brk = inner.brk;
            }
            Err(_) => reply.ret_brk = RetCode::Eintr as u64,
        }
        req.reply.reply(&reply);
    }

    /// The brk state machine under `mmap_sem`. On any conflict the brk is
    /// left unchanged; the caller replies with whatever `inner.brk` then is.
    fn brk_locked(&self, task: &Task, inner: &mut MmInner, brk: u64, gaps: &mut GapMap) {
        if brk < inner.start_brk || brk >= inner.layout.task_size {
            return;
        }
        let newbrk = page_align_up(brk);
        let oldbrk = page_align_up(inner.brk);

        // Same page: only the break value moves.
        if newbrk == oldbrk {
            inner.brk = brk;
            return;
        }

        let is_local = matches!(inner.view, MmView::Local(_));

        if brk <= inner.brk {
            let shrunk = if is_local {
                let MmInner { view, pages, .. } = inner;
                let MmView::Local(tree) = view else { unreachable!() };
                do_munmap(tree, pages, newbrk, oldbrk - newbrk).is_ok()
            } else {
                self.dist_munmap(task, inner, newbrk, oldbrk - newbrk, gaps)
                    .is_ok()
            };
            if shrunk {
                inner.brk = brk;
            }
            return;
        }

        let intersects = if is_local {
            let MmView::Local(tree) = &inner.view else { unreachable!() };
            tree.find_intersection(oldbrk, newbrk + PAGE_SIZE).is_some()
        } else {
            self.dist_find_intersection(task, inner, oldbrk, newbrk + PAGE_SIZE)
                .unwrap_or(true)
        };
        if intersects {
            return;
        }

        let grown = if is_local {
            let MmView::Local(tree) = &mut inner.view else { unreachable!() };
            do_brk(tree, oldbrk, newbrk - oldbrk).is_ok()
        } else {
            self.dist_brk(task, inner, oldbrk, newbrk - oldbrk, gaps)
                .is_ok()
        };
        if grown {
            inner.brk = brk;
            // Heap pages are populated eagerly.
            inner.pages.populate(oldbrk, newbrk - oldbrk);
        }
    }

    fn handle_p2m_mmap(&self, req: Request) {
        let p = decode!(
            req,
            P2mMmap,
            P2mMmapReply {
                ret: RetCode::Einval as u32,
                ..P2mMmapReply::default()
            }
        );
        let name = unpack_name(&p.f_name).to_string();
        debug!(
            src_nid = req.hdr.src_nid,
            pid = p.pid,
            addr = format_args!("{:#x}", p.addr),
            len = p.len,
            prot = p.prot,
            flags = p.flags,
            file = %name,
            "mmap"
        );

        let mut reply = P2mMmapReply::default();
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            reply.ret = RetCode::Esrch as u32;
            req.reply.reply(&reply);
            return;
        };

        let prot = ProtFlags::from_bits_truncate(p.prot);
        let mut map_flags = MapFlags::from_bits_truncate(p.flags);
        map_flags.remove(MapFlags::EXECUTABLE | MapFlags::DENYWRITE);

        let outcome = (|| {
            let mut inner = task.lock_mm_write()?;
            if matches!(inner.view, MmView::Local(_)) {
                let file = if map_flags.contains(MapFlags::ANONYMOUS) || name.is_empty() {
                    None
                } else {
                    Some(task.files.open(&name)?)
                };
                let MmInner { view, pages, .. } = &mut *inner;
                let MmView::Local(tree) = view else { unreachable!() };
                do_mmap(
                    tree,
                    pages,
                    file,
                    p.addr,
                    p.len,
                    prot,
                    map_flags,
                    vm_flags_of(prot, map_flags),
                    p.pgoff,
                )
            } else {
                self.dist_mmap(
                    &task,
                    &mut inner,
                    &name,
                    p.addr,
                    p.len,
                    prot,
                    map_flags,
                    p.pgoff,
                    &mut reply.map,
                )
            }
        })();

        match outcome {
            Ok(addr) => {
                reply.ret = RetCode::Okay as u32;
                reply.ret_addr = addr;
            }
            Err(e) => reply.ret = e.ret() as u32,
        }
        req.reply.reply(&reply);
    }

    fn handle_p2m_munmap(&self, req: Request) {
        let p = decode!(
            req,
            P2mMunmap,
            P2mMunmapReply {
                status: RetCode::Einval as u64,
            }
        );
        debug!(
            src_nid = req.hdr.src_nid,
            pid = p.pid,
            addr = format_args!("{:#x}", p.addr),
            len = p.len,
            "munmap"
        );

        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&P2mMunmapReply {
                status: RetCode::Esrch as u64,
            });
            return;
        };

        let mut gaps = GapMap::default();
        let outcome = (|| {
            let mut inner = task.lock_mm_write()?;
            if matches!(inner.view, MmView::Local(_)) {
                let MmInner { view, pages, .. } = &mut *inner;
                let MmView::Local(tree) = view else { unreachable!() };
                do_munmap(tree, pages, p.addr, p.len)
            } else {
                self.dist_munmap(&task, &mut inner, p.addr, p.len, &mut gaps)
            }
        })();

        let status = match outcome {
            Ok(()) => RetCode::Okay as u64,
            Err(e) => e.ret() as u64,
        };
        req.reply.reply(&P2mMunmapReply { status });
    }

    fn handle_p2m_mremap(&self, req: Request) {
        let p = decode!(
            req,
            P2mMremap,
            P2mMremapReply {
                status: RetCode::Einval as u32,
                line: MremapSite::BadAddress as u32,
                ..P2mMremapReply::default()
            }
        );
        debug!(
            src_nid = req.hdr.src_nid,
            pid = p.pid,
            old_addr = format_args!("{:#x}", p.old_addr),
            old_len = p.old_len,
            new_len = p.new_len,
            flags = p.flags,
            new_addr = format_args!("{:#x}", p.new_addr),
            "mremap"
        );

        let mut reply = P2mMremapReply::default();
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            reply.status = RetCode::Esrch as u32;
            reply.line = MremapSite::TaskLookup as u32;
            req.reply.reply(&reply);
            return;
        };

        let flags = MremapFlags::from_bits_truncate(p.flags);
        let outcome = match task.lock_mm_write() {
            Err(_) => Err((VmError::Interrupted, MremapSite::Wait)),
            Ok(mut inner) => {
                if matches!(inner.view, MmView::Local(_)) {
                    let MmInner { view, pages, .. } = &mut *inner;
                    let MmView::Local(tree) = view else { unreachable!() };
                    do_mremap(
                        tree, pages, p.old_addr, p.old_len, p.new_len, flags, p.new_addr,
                    )
                } else {
                    self.dist_mremap(
                        &task,
                        &mut inner,
                        p.old_addr,
                        p.old_len,
                        p.new_len,
                        flags,
                        p.new_addr,
                        &mut reply.map,
                    )
                }
            }
        };

        match outcome {
            Ok(new_addr) => {
                reply.status = RetCode::Okay as u32;
                reply.line = MremapSite::None as u32;
                reply.new_addr = new_addr;
            }
            Err((e, site)) => {
                reply.status = e.ret() as u32;
                reply.line = site as u32;
            }
        }
        req.reply.reply(&reply);
    }

    fn handle_p2m_msync(&self, req: Request) {
        let p = decode!(
            req,
            P2mMsync,
            P2mMsyncReply {
                status: RetCode::Einval as u32,
                _pad: 0,
            }
        );
        debug!(
            src_nid = req.hdr.src_nid,
            pid = p.pid,
            start = format_args!("{:#x}", p.start),
            len = p.len,
            flags = p.flags,
            "msync"
        );

        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&P2mMsyncReply {
                status: RetCode::Esrch as u32,
                _pad: 0,
            });
            return;
        };

        let flags = MsFlags::from_bits_truncate(p.flags);
        let end = p.start.saturating_add(p.len);
        let inner = task.mm.read();
        let status = match &inner.view {
            MmView::Local(tree) => match do_msync(tree, p.start, end, flags) {
                Ok(()) => RetCode::Okay as u32,
                Err(e) => e.ret() as u32,
            },
            MmView::Dist(_) => self.dist_msync(&task, &inner, p.start, p.len, flags),
        };
        drop(inner);
        req.reply.reply(&P2mMsyncReply { status, _pad: 0 });
    }

    /// Reserved in the protocol. The decision here: complain loudly but
    /// still reply, so the processor side never hangs on it.
    fn handle_p2m_mprotect(&self, req: Request) {
        let p = decode!(
            req,
            P2mMprotect,
            P2mMprotectReply {
                status: RetCode::Einval as u32,
                _pad: 0,
            }
        );
        warn!(
            pid = p.pid,
            start = format_args!("{:#x}", p.start),
            "mprotect request on memory node; not supported"
        );
        req.reply.reply(&P2mMprotectReply {
            status: RetCode::Einval as u32,
            _pad: 0,
        });
    }

    // === M2M === //

    fn handle_m2m_mmap(&self, req: Request) {
        let p = decode!(
            req,
            M2mMmap,
            M2mMmapReply {
                addr: err_value(RetCode::Einval),
                max_gap: 0,
            }
        );

        // First contact from this task's home node materialises the task
        // here. Losing the insert race to a sibling request is fine.
        let task = match self.tasks.find(req.hdr.src_nid, p.pid) {
            Some(t) => t,
            None => self.register_task(req.hdr.src_nid, p.pid),
        };

        let reply = match self.owner_mmap(&task, &p) {
            Ok((addr, max_gap)) => M2mMmapReply { addr, max_gap },
            Err(e) => M2mMmapReply {
                addr: err_value(e.ret()),
                max_gap: 0,
            },
        };
        req.reply.reply(&reply);
    }

    fn handle_m2m_munmap(&self, req: Request) {
        let p = decode!(
            req,
            M2mMunmap,
            M2mMunmapReply {
                status: RetCode::Einval as u32,
                _pad: 0,
                max_gap: 0,
            }
        );
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&M2mMunmapReply {
                status: RetCode::Esrch as u32,
                _pad: 0,
                max_gap: 0,
            });
            return;
        };
        let (status, max_gap) = self.owner_munmap(&task, &p);
        req.reply.reply(&M2mMunmapReply {
            status: status as u32,
            _pad: 0,
            max_gap,
        });
    }

    fn handle_m2m_findvma(&self, req: Request) {
        let p = decode!(req, M2mFindvma, M2mFindvmaReply::new_zeroed());
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&M2mFindvmaReply::new_zeroed());
            return;
        };
        req.reply.reply(&self.owner_findvma(&task, &p));
    }

    fn handle_m2m_mremap_grow(&self, req: Request) {
        let p = decode!(
            req,
            M2mMremapGrow,
            M2mMremapGrowReply {
                status: RetCode::Einval as u32,
                _pad: 0,
                max_gap: 0,
            }
        );
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&M2mMremapGrowReply {
                status: RetCode::Esrch as u32,
                _pad: 0,
                max_gap: 0,
            });
            return;
        };
        let (status, max_gap) = self.owner_mremap_grow(&task, &p);
        req.reply.reply(&M2mMremapGrowReply {
            status: status as u32,
            _pad: 0,
            max_gap,
        });
    }

    fn handle_m2m_mremap_move(&self, req: Request) {
        let p = decode!(
            req,
            M2mMremapMove,
            M2mMremapMoveReply {
                new_addr: err_value(RetCode::Einval),
                ..M2mMremapMoveReply::default()
            }
        );
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&M2mMremapMoveReply {
                new_addr: err_value(RetCode::Esrch),
                ..M2mMremapMoveReply::default()
            });
            return;
        };
        let reply = match self.owner_mremap_move(&task, &p) {
            Ok((new_addr, old_max_gap, new_max_gap)) => M2mMremapMoveReply {
                new_addr,
                old_max_gap,
                new_max_gap,
            },
            Err(e) => M2mMremapMoveReply {
                new_addr: err_value(e.ret()),
                ..M2mMremapMoveReply::default()
            },
        };
        req.reply.reply(&reply);
    }

    fn handle_m2m_mremap_move_split(&self, req: Request) {
        let p = decode!(
            req,
            M2mMremapMoveSplit,
            M2mMremapMoveSplitReply {
                new_addr: err_value(RetCode::Einval),
                new_max_gap: 0,
            }
        );
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&M2mMremapMoveSplitReply {
                new_addr: err_value(RetCode::Esrch),
                new_max_gap: 0,
            });
            return;
        };
        let reply = match self.owner_mremap_move_split(&task, &p) {
            Ok((new_addr, new_max_gap)) => M2mMremapMoveSplitReply {
                new_addr,
                new_max_gap,
            },
            Err(e) => M2mMremapMoveSplitReply {
                new_addr: err_value(e.ret()),
                new_max_gap: 0,
            },
        };
        req.reply.reply(&reply);
    }

    fn handle_m2m_msync(&self, req: Request) {
        let p = decode!(
            req,
            M2mMsync,
            M2mMsyncReply {
                status: RetCode::Einval as u32,
                _pad: 0,
            }
        );
        let Some(task) = self.tasks.find(req.hdr.src_nid, p.pid) else {
            req.reply.reply(&M2mMsyncReply {
                status: RetCode::Esrch as u32,
                _pad: 0,
            });
            return;
        };
        let status = self.owner_msync(&task, &p);
        req.reply.reply(&M2mMsyncReply { status, _pad: 0 });
    }
}
