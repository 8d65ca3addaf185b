//! File backing for non-anonymous mappings.
//!
//! The storage service behind these handles is an external collaborator; a
//! `VmFile` here is the handle plus the bookkeeping msync needs. Opens are
//! cached per task, matching the one-file-object-per-name behaviour the
//! handlers rely on.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{VmError, VmResult};

#[derive(Debug)]
pub struct VmFile {
    name: String,
    synced: Mutex<Vec<(u64, u64)>>,
}

impl VmFile {
    pub(crate) fn new(name: &str) -> VmFile {
        VmFile {
            name: name.to_string(),
            synced: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Flush `[start, end]` of the file to its backing store.
    pub fn sync_range(&self, start: u64, end: u64) -> VmResult<()> {
        if end < start {
            return Err(VmError::Invalid);
        }
        debug!(file = %self.name, start, end, "sync range");
        self.synced.lock().push((start, end));
        Ok(())
    }

    /// Ranges flushed so far; observable effect of msync.
    pub fn synced_ranges(&self) -> Vec<(u64, u64)> {
        self.synced.lock().clone()
    }
}

/// Per-task open-file cache keyed by name.
#[derive(Default, Debug)]
pub struct FileTable {
    open: Mutex<Vec<Arc<VmFile>>>,
}

impl FileTable {
    pub fn open(&self, name: &str) -> VmResult<Arc<VmFile>> {
        if name.is_empty() {
            return Err(VmError::Invalid);
        }
        let mut open = self.open.lock();
        if let Some(f) = open.iter().find(|f| f.name() == name) {
            return Ok(Arc::clone(f));
        }
        let f = Arc::new(VmFile::new(name));
        open.push(Arc::clone(&f));
        Ok(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_is_cached_per_name() {
        let files = FileTable::default();
        let a = files.open("/data/seg").unwrap();
        let b = files.open("/data/seg").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(files.open("").is_err());
    }

    #[test]
    fn sync_records_ranges() {
        let f = VmFile::new("/x");
        f.sync_range(0, 0xfff).unwrap();
        assert_eq!(f.synced_ranges(), vec![(0, 0xfff)]);
        assert!(f.sync_range(10, 2).is_err());
    }
}
