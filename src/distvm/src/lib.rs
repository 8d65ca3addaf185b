//! Per-process virtual-address-space management for the memory tier of a
//! disaggregated kernel.
//!
//! A [`MemoryNode`] handles the mmap-family P2M requests for the tasks it is
//! home to, and the M2M requests for the VMA ranges it owns. The router is a
//! construction-time choice: a single flat VMA tree, or the distributed
//! range map where every fixed-width slice of the address space has one
//! owning node that serialises its structural edits.

mod error;
mod file;
mod flags;
mod handlers;
mod mmap;
mod router;
mod task;
#[cfg(test)]
mod tests;
mod vma;

pub use error::{MremapSite, VmError, VmResult};
pub use file::{FileTable, VmFile};
pub use flags::{vm_flags_of, MapFlags, MremapFlags, MsFlags, ProtFlags, VmFlags};
pub use router::{Placement, RangeMap, RangeView, VmRange};
pub use task::{Mm, MmInner, MmLayout, MmView, PageStore, Pid, Task, TaskTable};
pub use vma::{page_align_down, page_align_up, page_aligned, Vma, VmaTree};

use std::sync::Arc;
use std::time::Duration;

use fabric::{Fabric, NodeId, NodeRunner};
use tracing::info;

/// Which router a node runs; the distributed variant shares the cluster's
/// static range placement.
#[derive(Clone)]
pub enum RouterMode {
    Local,
    Distributed(Arc<Placement>),
}

#[derive(Clone)]
pub struct NodeConfig {
    pub nid: NodeId,
    pub router: RouterMode,
    pub layout: MmLayout,
    pub rpc_timeout: Duration,
    pub polling_threads: usize,
}

impl NodeConfig {
    pub fn local(nid: NodeId) -> NodeConfig {
        NodeConfig {
            nid,
            router: RouterMode::Local,
            layout: MmLayout::default(),
            rpc_timeout: Duration::from_secs(5),
            polling_threads: 2,
        }
    }

    pub fn distributed(nid: NodeId, placement: Arc<Placement>) -> NodeConfig {
        NodeConfig {
            router: RouterMode::Distributed(placement),
            ..NodeConfig::local(nid)
        }
    }
}

/// One memory-manager node: task table plus request handlers, attached to
/// the fabric.
pub struct MemoryNode {
    pub(crate) cfg: NodeConfig,
    pub(crate) fabric: Fabric,
    pub tasks: TaskTable,
}

impl MemoryNode {
    /// Build the node and attach it to the fabric; the returned runner owns
    /// its polling threads.
    pub fn launch(cfg: NodeConfig, fabric: &Fabric) -> (Arc<MemoryNode>, NodeRunner) {
        let nid = cfg.nid;
        let polling = cfg.polling_threads;
        let node = Arc::new(MemoryNode {
            cfg,
            fabric: fabric.clone(),
            tasks: TaskTable::default(),
        });
        let runner = fabric.attach(nid, Arc::<MemoryNode>::clone(&node), polling);
        info!(nid, "memory node up");
        (node, runner)
    }

    pub fn nid(&self) -> NodeId {
        self.cfg.nid
    }

    /// Register a task this node is home for (the execve path is outside
    /// this crate; tests and the loader call this directly).
    pub fn register_task(&self, src_nid: NodeId, pid: Pid) -> Arc<Task> {
        let task = Task::new(src_nid, pid, self.cfg.layout, self.new_view());
        match self.tasks.insert(task) {
            Ok(t) => t,
            // First-contact races collapse onto whoever won.
            Err(existing) => existing,
        }
    }

    pub(crate) fn new_view(&self) -> MmView {
        match &self.cfg.router {
            RouterMode::Local => MmView::Local(VmaTree::new(
                self.cfg.layout.mmap_floor,
                self.cfg.layout.task_size,
            )),
            RouterMode::Distributed(placement) => MmView::Dist(RangeMap::new(
                placement.width(),
                self.cfg.layout.mmap_floor,
                self.cfg.layout.task_size,
            )),
        }
    }

    pub(crate) fn placement(&self) -> Arc<Placement> {
        match &self.cfg.router {
            RouterMode::Distributed(p) => Arc::clone(p),
            RouterMode::Local => unreachable!("placement requested on a local-router node"),
        }
    }
}
