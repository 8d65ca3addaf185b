//! On-the-wire request and reply layouts.
//!
//! Every message is a fixed-size `#[repr(C)]` struct with no padding holes,
//! so it can be shipped as raw bytes. Replies are fixed-size as well; there
//! is no streaming.

use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Maximum file-name length carried inline in mmap-family payloads.
pub const WIRE_NAME_LEN: usize = 64;

/// How many per-range max-gap updates a single reply can carry back to the
/// caller's router cache.
pub const MAX_GAP_UPDATES: usize = 8;

// === Opcodes === //

/// P2M requests come from the processor side; M2M requests are internal to
/// the memory tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    P2mBrk = 0x01,
    P2mMmap = 0x02,
    P2mMunmap = 0x03,
    P2mMremap = 0x04,
    P2mMsync = 0x05,
    P2mMprotect = 0x06,

    M2mMmap = 0x20,
    M2mMunmap = 0x21,
    M2mFindvma = 0x22,
    M2mMremapGrow = 0x23,
    M2mMremapMove = 0x24,
    M2mMremapMoveSplit = 0x25,
    M2mMsync = 0x26,
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Option<Opcode> {
        Some(match raw {
            0x01 => Opcode::P2mBrk,
            0x02 => Opcode::P2mMmap,
            0x03 => Opcode::P2mMunmap,
            0x04 => Opcode::P2mMremap,
            0x05 => Opcode::P2mMsync,
            0x06 => Opcode::P2mMprotect,
            0x20 => Opcode::M2mMmap,
            0x21 => Opcode::M2mMunmap,
            0x22 => Opcode::M2mFindvma,
            0x23 => Opcode::M2mMremapGrow,
            0x24 => Opcode::M2mMremapMove,
            0x25 => Opcode::M2mMremapMoveSplit,
            0x26 => Opcode::M2mMsync,
            _ => return None,
        })
    }
}

// === Status codes === //

/// Closed set of wire status codes.
///
/// These travel in `u32` status slots. Address-or-error slots (`u64`) use the
/// two's-complement encoding instead; see [`err_value`] / [`decode_value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RetCode {
    Okay = 0,
    Esrch = 3,
    Eintr = 4,
    Enomem = 12,
    Einval = 22,
}

impl RetCode {
    pub fn from_raw(raw: u32) -> Option<RetCode> {
        Some(match raw {
            0 => RetCode::Okay,
            3 => RetCode::Esrch,
            4 => RetCode::Eintr,
            12 => RetCode::Enomem,
            22 => RetCode::Einval,
            _ => return None,
        })
    }

    pub fn is_ok(self) -> bool {
        self == RetCode::Okay
    }
}

/// Highest `u64` value that is still a valid address in an address-or-error
/// slot. Anything above encodes a negated [`RetCode`].
pub const MAX_ADDR_VALUE: u64 = (-4095i64) as u64 - 1;

/// Encode a status code into an address-or-error slot.
pub fn err_value(code: RetCode) -> u64 {
    (-(code as u32 as i64)) as u64
}

/// Split an address-or-error slot into its two cases. Unknown codes in the
/// error range collapse to `Einval`.
pub fn decode_value(val: u64) -> Result<u64, RetCode> {
    if val <= MAX_ADDR_VALUE {
        Ok(val)
    } else {
        let raw = (val as i64).unsigned_abs() as u32;
        Err(RetCode::from_raw(raw).unwrap_or(RetCode::Einval))
    }
}

// === Shared fragments === //

/// One updated `(range, owner, max_gap)` triple, reported by range owners so
/// the caller's router can refresh its summary without another round trip.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct GapUpdate {
    pub range_start: u64,
    pub max_gap: u64,
    pub owner: u32,
    pub _pad: u32,
}

/// Fixed-capacity batch of [`GapUpdate`]s riding on mmap-family replies.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct GapMap {
    pub nr: u32,
    pub _pad: u32,
    pub updates: [GapUpdate; MAX_GAP_UPDATES],
}

impl Default for GapMap {
    fn default() -> Self {
        GapMap {
            nr: 0,
            _pad: 0,
            updates: [GapUpdate::default(); MAX_GAP_UPDATES],
        }
    }
}

impl GapMap {
    /// Append an update, silently dropping past capacity. Droppable: the
    /// caller falls back to querying the owner on a cache miss.
    pub fn push(&mut self, range_start: u64, owner: u32, max_gap: u64) {
        let idx = self.nr as usize;
        if idx < MAX_GAP_UPDATES {
            self.updates[idx] = GapUpdate {
                range_start,
                max_gap,
                owner,
                _pad: 0,
            };
            self.nr = idx as u32 + 1;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &GapUpdate> {
        self.updates.iter().take(self.nr as usize)
    }
}

/// Pack a file name into a fixed NUL-terminated slot. Over-long names are
/// truncated; the wire format has no out-of-line strings.
pub fn pack_name(name: &str) -> [u8; WIRE_NAME_LEN] {
    let mut buf = [0u8; WIRE_NAME_LEN];
    let bytes = name.as_bytes();
    let n = bytes.len().min(WIRE_NAME_LEN - 1);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

pub fn unpack_name(buf: &[u8; WIRE_NAME_LEN]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

// === P2M payloads === //

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mBrk {
    pub pid: u32,
    pub _pad: u32,
    pub brk: u64,
}

/// `ret_brk` carries the (possibly unchanged) brk on success and a bare
/// [`RetCode`] value on `ESRCH`/`EINTR`.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mBrkReply {
    pub ret_brk: u64,
    pub map: GapMap,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMmap {
    pub pid: u32,
    pub _pad: u32,
    pub addr: u64,
    pub len: u64,
    pub prot: u64,
    pub flags: u64,
    pub pgoff: u64,
    pub f_name: [u8; WIRE_NAME_LEN],
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMmapReply {
    pub ret: u32,
    pub _pad: u32,
    pub ret_addr: u64,
    pub map: GapMap,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMunmap {
    pub pid: u32,
    pub _pad: u32,
    pub addr: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMunmapReply {
    pub status: u64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMremap {
    pub pid: u32,
    pub _pad: u32,
    pub old_addr: u64,
    pub old_len: u64,
    pub new_len: u64,
    pub flags: u64,
    pub new_addr: u64,
}

/// `line` carries a stable failure-site tag (see the handler crate's
/// `MremapSite`); it is part of the wire format and survives releases.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMremapReply {
    pub status: u32,
    pub line: u32,
    pub new_addr: u64,
    pub map: GapMap,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMsync {
    pub pid: u32,
    pub _pad: u32,
    pub start: u64,
    pub len: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMsyncReply {
    pub status: u32,
    pub _pad: u32,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMprotect {
    pub pid: u32,
    pub _pad: u32,
    pub start: u64,
    pub len: u64,
    pub prot: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct P2mMprotectReply {
    pub status: u32,
    pub _pad: u32,
}

// === M2M payloads === //

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMmap {
    pub pid: u32,
    pub _pad: u32,
    /// Start of the VMA range this request is confined to.
    pub new_range: u64,
    pub addr: u64,
    pub len: u64,
    pub prot: u64,
    pub flags: u64,
    pub vm_flags: u64,
    pub pgoff: u64,
    pub f_name: [u8; WIRE_NAME_LEN],
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMmapReply {
    /// Address-or-error slot.
    pub addr: u64,
    pub max_gap: u64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMunmap {
    pub pid: u32,
    pub _pad: u32,
    pub begin: u64,
    pub len: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMunmapReply {
    pub status: u32,
    pub _pad: u32,
    pub max_gap: u64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mFindvma {
    pub pid: u32,
    pub _pad: u32,
    pub begin: u64,
    pub end: u64,
}

/// Besides the intersection verdict, the owner reports the mapping
/// descriptor at `begin` so a cross-node mremap can rebuild the mapping on
/// the destination owner without another round trip.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mFindvmaReply {
    pub vma_exist: u32,
    pub _pad: u32,
    pub vm_flags: u64,
    pub pgoff: u64,
    pub f_name: [u8; WIRE_NAME_LEN],
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMremapGrow {
    pub pid: u32,
    pub _pad: u32,
    pub addr: u64,
    pub old_len: u64,
    pub new_len: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMremapGrowReply {
    pub status: u32,
    pub _pad: u32,
    pub max_gap: u64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMremapMove {
    pub pid: u32,
    pub _pad: u32,
    pub old_addr: u64,
    pub old_len: u64,
    pub new_len: u64,
    pub new_range: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMremapMoveReply {
    /// Address-or-error slot.
    pub new_addr: u64,
    pub old_max_gap: u64,
    pub new_max_gap: u64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMremapMoveSplit {
    pub pid: u32,
    pub _pad: u32,
    /// Start of the destination VMA range on the receiving owner.
    pub new_range: u64,
    pub old_addr: u64,
    pub old_len: u64,
    /// Zero lets the destination owner pick the placement.
    pub new_addr: u64,
    pub new_len: u64,
    pub vm_flags: u64,
    pub pgoff: u64,
    pub f_name: [u8; WIRE_NAME_LEN],
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMremapMoveSplitReply {
    /// Address-or-error slot.
    pub new_addr: u64,
    pub new_max_gap: u64,
}

#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMsync {
    pub pid: u32,
    pub _pad: u32,
    pub start: u64,
    pub len: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct M2mMsyncReply {
    pub status: u32,
    pub _pad: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn opcode_round_trip() {
        for op in [
            Opcode::P2mBrk,
            Opcode::P2mMmap,
            Opcode::P2mMunmap,
            Opcode::P2mMremap,
            Opcode::P2mMsync,
            Opcode::P2mMprotect,
            Opcode::M2mMmap,
            Opcode::M2mMunmap,
            Opcode::M2mFindvma,
            Opcode::M2mMremapGrow,
            Opcode::M2mMremapMove,
            Opcode::M2mMremapMoveSplit,
            Opcode::M2mMsync,
        ] {
            assert_eq!(Opcode::from_raw(op as u32), Some(op));
        }
        assert_eq!(Opcode::from_raw(0xdead), None);
    }

    #[test]
    fn err_value_round_trip() {
        for code in [RetCode::Esrch, RetCode::Eintr, RetCode::Enomem, RetCode::Einval] {
            assert_eq!(decode_value(err_value(code)), Err(code));
        }
        assert_eq!(decode_value(0x7f00_0000), Ok(0x7f00_0000));
        assert_eq!(decode_value(0), Ok(0));
    }

    #[test]
    fn payload_round_trip() {
        let req = P2mMmap {
            pid: 7,
            _pad: 0,
            addr: 0,
            len: 0x3000,
            prot: 3,
            flags: 0x22,
            pgoff: 0,
            f_name: pack_name("/tmp/backing"),
        };
        let bytes = req.as_bytes().to_vec();
        let back = P2mMmap::read_from_prefix(bytes.as_slice()).unwrap();
        assert_eq!(back.len, 0x3000);
        assert_eq!(unpack_name(&back.f_name), "/tmp/backing");
    }

    #[test]
    fn gap_map_capacity() {
        let mut map = GapMap::default();
        for i in 0..MAX_GAP_UPDATES as u64 + 3 {
            map.push(i << 30, 1, 0x1000);
        }
        assert_eq!(map.nr as usize, MAX_GAP_UPDATES);
        assert_eq!(map.iter().count(), MAX_GAP_UPDATES);
    }

    #[test]
    fn name_truncation() {
        let long = "x".repeat(WIRE_NAME_LEN * 2);
        let packed = pack_name(&long);
        assert_eq!(unpack_name(&packed).len(), WIRE_NAME_LEN - 1);
    }
}
