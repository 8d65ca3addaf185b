//! Tasks, their address spaces, and the global task table.
//!
//! A task is keyed `(nid, pid)`: the node that spawned the process plus
//! its pid there. The table is a sharded concurrent map; handlers clone the
//! `Arc` out and drop the shard lock before doing real work. `mmap_sem` is a
//! write-killable reader-writer semaphore: a fatal signal cancels the wait
//! and the handler reports `EINTR` with nothing mutated.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fabric::{NodeId, PAGE_SIZE};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::{VmError, VmResult};
use crate::file::FileTable;
use crate::router::RangeMap;
use crate::vma::VmaTree;

pub type Pid = u32;

/// Fixed points of a fresh address space.
#[derive(Debug, Clone, Copy)]
pub struct MmLayout {
    pub start_brk: u64,
    pub task_size: u64,
    pub mmap_floor: u64,
}

impl Default for MmLayout {
    fn default() -> Self {
        MmLayout {
            start_brk: 0x0040_0000,
            task_size: 1 << 46,
            mmap_floor: 0x0001_0000,
        }
    }
}

/// Address-space view: one flat tree, or the distributed range map.
#[derive(Debug)]
pub enum MmView {
    Local(VmaTree),
    Dist(RangeMap),
}

/// Backing frames this node holds for a task, keyed by page address.
/// Populate fills zeroes; munmap drops; mremap re-keys.
#[derive(Default, Debug)]
pub struct PageStore {
    frames: FxHashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
}

impl PageStore {
    pub fn populate(&mut self, start: u64, len: u64) {
        let mut addr = start;
        while addr < start + len {
            self.frames
                .entry(addr)
                .or_insert_with(|| Box::new([0u8; PAGE_SIZE as usize]));
            addr += PAGE_SIZE;
        }
    }

    pub fn drop_range(&mut self, start: u64, end: u64) {
        self.frames.retain(|&a, _| a < start || a >= end);
    }

    pub fn move_range(&mut self, old_start: u64, old_end: u64, new_start: u64) {
        let moved: Vec<(u64, Box<[u8; PAGE_SIZE as usize]>)> = {
            let keys: Vec<u64> = self
                .frames
                .keys()
                .copied()
                .filter(|&a| a >= old_start && a < old_end)
                .collect();
            keys.into_iter()
                .map(|a| (a, self.frames.remove(&a).expect("listed key")))
                .collect()
        };
        for (a, frame) in moved {
            self.frames.insert(new_start + (a - old_start), frame);
        }
    }

    pub fn is_populated(&self, addr: u64) -> bool {
        self.frames.contains_key(&(addr & !(PAGE_SIZE - 1)))
    }

    pub fn nr_frames(&self) -> usize {
        self.frames.len()
    }
}

#[derive(Debug)]
pub struct MmInner {
    pub start_brk: u64,
    pub brk: u64,
    pub layout: MmLayout,
    pub view: MmView,
    pub pages: PageStore,
}

impl MmInner {
    /// The flat tree; panics if this mm is distributed. Local-mode helpers
    /// only.
    pub fn local_tree(&mut self) -> &mut VmaTree {
        match &mut self.view {
            MmView::Local(tree) => tree,
            MmView::Dist(_) => unreachable!("local tree requested on a distributed mm"),
        }
    }
}

#[derive(Debug)]
pub struct Mm {
    sem: RwLock<MmInner>,
}

impl Mm {
    fn new(layout: MmLayout, view: MmView) -> Mm {
        Mm {
            sem: RwLock::new(MmInner {
                start_brk: layout.start_brk,
                brk: layout.start_brk,
                layout,
                view,
                pages: PageStore::default(),
            }),
        }
    }

    /// Write-acquire `mmap_sem`, cancellably: a fatal signal on the task
    /// aborts the wait.
    pub fn write_killable(&self, killed: &AtomicBool) -> VmResult<RwLockWriteGuard<'_, MmInner>> {
        loop {
            if let Some(guard) = self.sem.try_write_for(Duration::from_millis(5)) {
                return Ok(guard);
            }
            if killed.load(Ordering::Acquire) {
                return Err(VmError::Interrupted);
            }
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, MmInner> {
        self.sem.read()
    }
}

#[derive(Debug)]
pub struct Task {
    pub nid: NodeId,
    pub pid: Pid,
    pub mm: Mm,
    pub files: FileTable,
    killed: AtomicBool,
}

impl Task {
    pub fn new(nid: NodeId, pid: Pid, layout: MmLayout, view: MmView) -> Arc<Task> {
        Arc::new(Task {
            nid,
            pid,
            mm: Mm::new(layout, view),
            files: FileTable::default(),
            killed: AtomicBool::new(false),
        })
    }

    /// Deliver a fatal signal: pending killable waits return `EINTR`.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn lock_mm_write(&self) -> VmResult<RwLockWriteGuard<'_, MmInner>> {
        self.mm.write_killable(&self.killed)
    }
}

/// Global `(nid, pid)` -> task map with interior synchronisation.
#[derive(Default)]
pub struct TaskTable {
    map: DashMap<(NodeId, Pid), Arc<Task>>,
}

impl TaskTable {
    pub fn find(&self, nid: NodeId, pid: Pid) -> Option<Arc<Task>> {
        self.map.get(&(nid, pid)).map(|t| Arc::clone(&t))
    }

    /// Insert a fresh task; `Err` hands back the existing one. Two racing
    /// first-contact inserts for the same process both end up with the same
    /// task, which callers treat as success.
    pub fn insert(&self, task: Arc<Task>) -> Result<Arc<Task>, Arc<Task>> {
        match self.map.entry((task.nid, task.pid)) {
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&task));
                Ok(task)
            }
            Entry::Occupied(existing) => Err(Arc::clone(existing.get())),
        }
    }

    pub fn remove(&self, nid: NodeId, pid: Pid) -> Option<Arc<Task>> {
        let (_, task) = self.map.remove(&(nid, pid))?;
        debug!(nid, pid, "task removed");
        Some(task)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
