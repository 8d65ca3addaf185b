//! Protection, mapping, and sync flag words, with the Linux ABI values the
//! processor side speaks.

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u64 {
        const READ  = 0x1;
        const WRITE = 0x2;
        const EXEC  = 0x4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const SHARED     = 0x0001;
        const PRIVATE    = 0x0002;
        const FIXED      = 0x0010;
        const ANONYMOUS  = 0x0020;
        const GROWSDOWN  = 0x0100;
        const DENYWRITE  = 0x0800;
        const EXECUTABLE = 0x1000;
        const POPULATE   = 0x8000;
    }
}

bitflags! {
    /// Per-VMA state derived from `prot` and `map` flags at mmap time.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmFlags: u64 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const EXEC      = 1 << 2;
        const SHARED    = 1 << 3;
        const MAYSHARE  = 1 << 4;
        const GROWSDOWN = 1 << 5;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsFlags: u64 {
        const ASYNC      = 0x1;
        const INVALIDATE = 0x2;
        const SYNC       = 0x4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MremapFlags: u64 {
        const MAYMOVE = 0x1;
        const FIXED   = 0x2;
    }
}

/// Fold `(prot, map)` into the VMA's flag word.
pub fn vm_flags_of(prot: ProtFlags, map: MapFlags) -> VmFlags {
    let mut vm = VmFlags::empty();
    if prot.contains(ProtFlags::READ) {
        vm |= VmFlags::READ;
    }
    if prot.contains(ProtFlags::WRITE) {
        vm |= VmFlags::WRITE;
    }
    if prot.contains(ProtFlags::EXEC) {
        vm |= VmFlags::EXEC;
    }
    if map.contains(MapFlags::SHARED) {
        vm |= VmFlags::SHARED | VmFlags::MAYSHARE;
    }
    if map.contains(MapFlags::GROWSDOWN) {
        vm |= VmFlags::GROWSDOWN;
    }
    vm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_implies_mayshare() {
        let vm = vm_flags_of(ProtFlags::READ | ProtFlags::WRITE, MapFlags::SHARED);
        assert!(vm.contains(VmFlags::SHARED | VmFlags::MAYSHARE | VmFlags::READ | VmFlags::WRITE));
        let vm = vm_flags_of(ProtFlags::READ, MapFlags::PRIVATE | MapFlags::ANONYMOUS);
        assert!(!vm.intersects(VmFlags::SHARED | VmFlags::MAYSHARE));
    }
}
