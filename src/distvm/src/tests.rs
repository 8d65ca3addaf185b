//! End-to-end handler scenarios over the in-memory fabric: a processor-side
//! test driver sends P2M requests at real nodes with real polling threads.

use std::sync::Arc;
use std::time::Duration;

use fabric::{
    pack_name, Fabric, NodeId, NodeRunner, Opcode, P2mBrk, P2mBrkReply, P2mMmap, P2mMmapReply,
    P2mMprotect, P2mMprotectReply, P2mMremap, P2mMremapReply, P2mMsync, P2mMsyncReply, P2mMunmap,
    P2mMunmapReply, RetCode, PAGE_SIZE,
};
use zerocopy::{AsBytes, FromBytes};

use crate::{
    MapFlags, MemoryNode, MmView, MremapFlags, MremapSite, MsFlags, NodeConfig, Placement,
    ProtFlags,
};

/// Node id the fake processor sends from; tasks are keyed under it.
const PROC: NodeId = 9;
const PID: u32 = 42;

fn send<T: AsBytes, R: FromBytes>(fabric: &Fabric, dst: NodeId, op: Opcode, payload: &T) -> R {
    let bytes = fabric
        .send_reply_timeout(PROC, dst, op, payload.as_bytes(), Duration::from_secs(5))
        .expect("rpc failed");
    R::read_from_prefix(bytes.as_slice()).expect("malformed reply")
}

fn local_node() -> (Fabric, Arc<MemoryNode>, NodeRunner) {
    let fabric = Fabric::new();
    let (node, runner) = MemoryNode::launch(NodeConfig::local(0), &fabric);
    (fabric, node, runner)
}

fn anon_mmap(fabric: &Fabric, addr: u64, len: u64, extra: MapFlags) -> P2mMmapReply {
    let req = P2mMmap {
        pid: PID,
        _pad: 0,
        addr,
        len,
        prot: (ProtFlags::READ | ProtFlags::WRITE).bits(),
        flags: (MapFlags::PRIVATE | MapFlags::ANONYMOUS | extra).bits(),
        pgoff: 0,
        f_name: pack_name(""),
    };
    send(fabric, 0, Opcode::P2mMmap, &req)
}

fn brk(fabric: &Fabric, target: u64) -> u64 {
    let reply: P2mBrkReply = send(
        fabric,
        0,
        Opcode::P2mBrk,
        &P2mBrk {
            pid: PID,
            _pad: 0,
            brk: target,
        },
    );
    reply.ret_brk
}

#[test]
fn brk_grows_populates_and_idempotent() {
    let (fabric, node, _runner) = local_node();
    let task = node.register_task(PROC, PID);

    // start_brk = 0x400000; grow to 0x410000.
    assert_eq!(brk(&fabric, 0x41_0000), 0x41_0000);
    {
        let inner = task.mm.read();
        let MmView::Local(tree) = &inner.view else {
            panic!("local node")
        };
        let heap = tree.find_vma(0x40_0000).expect("heap vma");
        assert_eq!((heap.start, heap.end), (0x40_0000, 0x41_0000));
        assert!(heap.is_anonymous());
        assert_eq!(tree.iter().count(), 1);
        // Populated eagerly.
        assert!(inner.pages.is_populated(0x40_0000));
        assert!(inner.pages.is_populated(0x40_f000));
        assert!(!inner.pages.is_populated(0x41_0000));
    }

    // brk(brk) is a no-op returning the current break.
    assert_eq!(brk(&fabric, 0x41_0000), 0x41_0000);
    // Below start_brk: rejected, current break replied.
    assert_eq!(brk(&fabric, 0x10_0000), 0x41_0000);

    // Shrink unmaps the tail.
    assert_eq!(brk(&fabric, 0x40_4000), 0x40_4000);
    let inner = task.mm.read();
    let MmView::Local(tree) = &inner.view else {
        panic!()
    };
    assert_eq!(tree.find_vma(0x40_0000).unwrap().end, 0x40_4000);
    assert!(!inner.pages.is_populated(0x40_5000));
}

#[test]
fn mmap_munmap_round_trip_reuses_address() {
    let (fabric, node, _runner) = local_node();
    let task = node.register_task(PROC, PID);

    let reply = anon_mmap(&fabric, 0, 0x3000, MapFlags::empty());
    assert_eq!(reply.ret, RetCode::Okay as u32);
    let addr = reply.ret_addr;
    assert_eq!(addr % PAGE_SIZE, 0);
    {
        let inner = task.mm.read();
        let MmView::Local(tree) = &inner.view else {
            panic!()
        };
        assert_eq!(tree.find_vma(addr).unwrap().end - addr, 0x3000);
    }

    let status: P2mMunmapReply = send(
        &fabric,
        0,
        Opcode::P2mMunmap,
        &P2mMunmap {
            pid: PID,
            _pad: 0,
            addr,
            len: 0x3000,
        },
    );
    assert_eq!(status.status, 0);

    // Identical request gets the slot back.
    let again = anon_mmap(&fabric, 0, 0x3000, MapFlags::empty());
    assert_eq!(again.ret, RetCode::Okay as u32);
    assert_eq!(again.ret_addr, addr);
}

#[test]
fn mremap_forced_move_relocates() {
    let (fabric, node, _runner) = local_node();
    let task = node.register_task(PROC, PID);

    // Top-down placement leaves no room above: growth must move.
    let a = anon_mmap(&fabric, 0, 0x1000, MapFlags::empty()).ret_addr;

    let reply: P2mMremapReply = send(
        &fabric,
        0,
        Opcode::P2mMremap,
        &P2mMremap {
            pid: PID,
            _pad: 0,
            old_addr: a,
            old_len: 0x1000,
            new_len: 0x4000,
            flags: MremapFlags::MAYMOVE.bits(),
            new_addr: 0,
        },
    );
    assert_eq!(reply.status, RetCode::Okay as u32);
    assert_eq!(reply.line, MremapSite::None as u32);
    let b = reply.new_addr;
    assert_ne!(b, a);

    let inner = task.mm.read();
    let MmView::Local(tree) = &inner.view else {
        panic!()
    };
    assert!(tree.find_intersection(a, a + 0x1000).is_none());
    assert_eq!(tree.find_vma(b).unwrap().end - b, 0x4000);
}

#[test]
fn mremap_failure_carries_site_tag() {
    let (fabric, node, _runner) = local_node();
    node.register_task(PROC, PID);

    // Nothing mapped there: resize target is missing.
    let reply: P2mMremapReply = send(
        &fabric,
        0,
        Opcode::P2mMremap,
        &P2mMremap {
            pid: PID,
            _pad: 0,
            old_addr: 0x7000_0000,
            old_len: 0x1000,
            new_len: 0x2000,
            flags: MremapFlags::MAYMOVE.bits(),
            new_addr: 0,
        },
    );
    assert_eq!(reply.status, RetCode::Enomem as u32);
    assert_eq!(reply.line, MremapSite::Resize as u32);
}

#[test]
fn unknown_task_is_esrch() {
    let (fabric, _node, _runner) = local_node();
    let reply = anon_mmap(&fabric, 0, 0x1000, MapFlags::empty());
    assert_eq!(reply.ret, RetCode::Esrch as u32);
    assert_eq!(brk(&fabric, 0x50_0000), RetCode::Esrch as u64);
}

#[test]
fn killed_task_interrupts_waiters() {
    let (fabric, node, _runner) = local_node();
    let task = node.register_task(PROC, PID);

    let guard = task.lock_mm_write().unwrap();
    let sender = {
        let fabric = fabric.clone();
        std::thread::spawn(move || brk(&fabric, 0x42_0000))
    };
    std::thread::sleep(Duration::from_millis(30));
    task.kill();
    assert_eq!(sender.join().unwrap(), RetCode::Eintr as u64);
    drop(guard);
}

#[test]
fn mprotect_is_refused_with_a_reply() {
    let (fabric, node, _runner) = local_node();
    node.register_task(PROC, PID);
    let reply: P2mMprotectReply = send(
        &fabric,
        0,
        Opcode::P2mMprotect,
        &P2mMprotect {
            pid: PID,
            _pad: 0,
            start: 0x40_0000,
            len: 0x1000,
            prot: ProtFlags::READ.bits(),
        },
    );
    assert_eq!(reply.status, RetCode::Einval as u32);
}

#[test]
fn msync_flushes_shared_file_mappings() {
    let (fabric, node, _runner) = local_node();
    let task = node.register_task(PROC, PID);

    let req = P2mMmap {
        pid: PID,
        _pad: 0,
        addr: 0,
        len: 0x4000,
        prot: (ProtFlags::READ | ProtFlags::WRITE).bits(),
        flags: MapFlags::SHARED.bits(),
        pgoff: 4,
        f_name: pack_name("/data/shared"),
    };
    let reply: P2mMmapReply = send(&fabric, 0, Opcode::P2mMmap, &req);
    assert_eq!(reply.ret, RetCode::Okay as u32);
    let addr = reply.ret_addr;

    let status: P2mMsyncReply = send(
        &fabric,
        0,
        Opcode::P2mMsync,
        &P2mMsync {
            pid: PID,
            _pad: 0,
            start: addr,
            len: 0x4000,
            flags: MsFlags::SYNC.bits(),
        },
    );
    assert_eq!(status.status, RetCode::Okay as u32);
    let file = task.files.open("/data/shared").unwrap();
    assert_eq!(file.synced_ranges(), vec![(0x4000, 0x7fff)]);

    // Span with a hole past the mapping: flushed what exists, ENOMEM back.
    let status: P2mMsyncReply = send(
        &fabric,
        0,
        Opcode::P2mMsync,
        &P2mMsync {
            pid: PID,
            _pad: 0,
            start: addr,
            len: 0x8000,
            flags: MsFlags::SYNC.bits(),
        },
    );
    assert_eq!(status.status, RetCode::Enomem as u32);
}

// === Distributed === //

const GIB: u64 = 1 << 30;

struct Cluster {
    fabric: Fabric,
    nodes: Vec<Arc<MemoryNode>>,
    _runners: Vec<NodeRunner>,
}

/// Three memory nodes; range [1 GiB) is node 1's, range [2 GiB) is node
/// 2's, everything else belongs to the home node 0.
fn cluster() -> Cluster {
    let mut placement = Placement::new(GIB, 0);
    placement.assign(GIB, 1);
    placement.assign(2 * GIB, 2);
    let placement = Arc::new(placement);

    let fabric = Fabric::new();
    let mut nodes = Vec::new();
    let mut runners = Vec::new();
    for nid in 0..3 {
        let (node, runner) = MemoryNode::launch(
            NodeConfig::distributed(nid, Arc::clone(&placement)),
            &fabric,
        );
        nodes.push(node);
        runners.push(runner);
    }
    Cluster {
        fabric,
        nodes,
        _runners: runners,
    }
}

impl Cluster {
    fn range_tree_assert(
        &self,
        node: usize,
        rstart: u64,
        check: impl FnOnce(&crate::VmaTree),
    ) {
        let task = self.nodes[node].tasks.find(0, PID).or_else(|| {
            // Home-node tasks are keyed under the processor's nid.
            self.nodes[node].tasks.find(PROC, PID)
        });
        let task = task.expect("task on node");
        let inner = task.mm.read();
        let MmView::Dist(ranges) = &inner.view else {
            panic!("distributed node")
        };
        let tree = ranges
            .range(rstart)
            .and_then(|r| r.local_tree())
            .expect("local range tree");
        check(tree);
    }
}

#[test]
fn dist_brk_stays_on_home_ranges() {
    let c = cluster();
    c.nodes[0].register_task(PROC, PID);

    assert_eq!(brk(&c.fabric, 0x41_0000), 0x41_0000);
    let task = c.nodes[0].tasks.find(PROC, PID).unwrap();
    let inner = task.mm.read();
    let MmView::Dist(ranges) = &inner.view else {
        panic!()
    };
    let tree = ranges.range(0).and_then(|r| r.local_tree()).unwrap();
    assert_eq!(tree.find_vma(0x40_0000).unwrap().end, 0x41_0000);
    assert!(inner.pages.is_populated(0x40_8000));
}

#[test]
fn dist_mmap_routes_to_range_owner() {
    let c = cluster();
    c.nodes[0].register_task(PROC, PID);

    // Hint inside node 1's range: mapped over there.
    let reply = anon_mmap(&c.fabric, GIB, 0x2000, MapFlags::empty());
    assert_eq!(reply.ret, RetCode::Okay as u32);
    assert_eq!(reply.ret_addr, GIB);
    assert_eq!(c.fabric.sent_count(Opcode::M2mMmap), 1);
    // The reply told the router the range's new gap.
    assert_eq!(reply.map.nr, 1);
    assert_eq!(reply.map.updates[0].range_start, GIB);
    assert_eq!(reply.map.updates[0].owner, 1);

    c.range_tree_assert(1, GIB, |tree| {
        assert_eq!(tree.find_vma(GIB).unwrap().end, GIB + 0x2000);
    });

    // Unmap travels to the owner too.
    let status: P2mMunmapReply = send(
        &c.fabric,
        0,
        Opcode::P2mMunmap,
        &P2mMunmap {
            pid: PID,
            _pad: 0,
            addr: GIB,
            len: 0x2000,
        },
    );
    assert_eq!(status.status, 0);
    c.range_tree_assert(1, GIB, |tree| {
        assert!(tree.find_intersection(GIB, GIB + 0x2000).is_none());
    });
}

#[test]
fn cross_range_mremap_move_split() {
    let c = cluster();
    c.nodes[0].register_task(PROC, PID);

    // One region on node 1, one on node 2.
    let a = anon_mmap(&c.fabric, GIB, 0x2000, MapFlags::empty());
    assert_eq!(a.ret, RetCode::Okay as u32);
    let b = anon_mmap(&c.fabric, 2 * GIB, 0x2000, MapFlags::empty());
    assert_eq!(b.ret, RetCode::Okay as u32);

    let split_before = c.fabric.sent_count(Opcode::M2mMremapMoveSplit);
    let munmap_before = c.fabric.sent_count(Opcode::M2mMunmap);

    // Fixed move of node 1's region onto node 2's.
    let reply: P2mMremapReply = send(
        &c.fabric,
        0,
        Opcode::P2mMremap,
        &P2mMremap {
            pid: PID,
            _pad: 0,
            old_addr: GIB,
            old_len: 0x2000,
            new_len: 0x2000,
            flags: (MremapFlags::MAYMOVE | MremapFlags::FIXED).bits(),
            new_addr: 2 * GIB,
        },
    );
    assert_eq!(reply.status, RetCode::Okay as u32);
    assert_eq!(reply.new_addr, 2 * GIB);

    // Exactly one MOVE_SPLIT to the destination owner and one MUNMAP to
    // the source owner.
    assert_eq!(c.fabric.sent_count(Opcode::M2mMremapMoveSplit) - split_before, 1);
    assert_eq!(c.fabric.sent_count(Opcode::M2mMunmap) - munmap_before, 1);

    // Mapping lives only on node 2 now.
    c.range_tree_assert(1, GIB, |tree| {
        assert!(tree.is_empty());
        assert_eq!(tree.max_gap(), GIB);
    });
    c.range_tree_assert(2, 2 * GIB, |tree| {
        let vma = tree.find_vma(2 * GIB).unwrap();
        assert_eq!((vma.start, vma.end), (2 * GIB, 2 * GIB + 0x2000));
    });

    // Both ranges reported fresh max_gap values to the home router.
    let updated: Vec<u64> = reply.map.iter().map(|u| u.range_start).collect();
    assert!(updated.contains(&GIB));
    assert!(updated.contains(&(2 * GIB)));

    let task = c.nodes[0].tasks.find(PROC, PID).unwrap();
    let inner = task.mm.read();
    let MmView::Dist(ranges) = &inner.view else {
        panic!()
    };
    assert_eq!(ranges.range(GIB).unwrap().max_gap(), GIB);
}

#[test]
fn rpc_failure_surfaces_as_resource_error() {
    // Range [1 GiB) belongs to node 1, which is never attached: the M2M
    // send fails outright and the handler reports a resource error instead
    // of hanging.
    let mut placement = Placement::new(GIB, 0);
    placement.assign(GIB, 1);
    let placement = Arc::new(placement);

    let fabric = Fabric::new();
    let (home, _runner) = MemoryNode::launch(NodeConfig::distributed(0, placement), &fabric);
    home.register_task(PROC, PID);

    let reply = anon_mmap(&fabric, GIB, 0x1000, MapFlags::FIXED);
    assert_eq!(reply.ret, RetCode::Enomem as u32);
}
