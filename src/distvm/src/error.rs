//! Error surface of the VMA managers, and its translation onto the closed
//! wire status set.

use fabric::{FabricError, RetCode};
use thiserror::Error;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmError {
    /// `(nid, pid)` not present in the task table.
    #[error("no such task")]
    NoTask,
    /// A killable wait was cancelled by a fatal signal. Nothing mutated.
    #[error("interrupted while waiting for the address space")]
    Interrupted,
    #[error("address space exhausted")]
    NoMemory,
    #[error("invalid argument")]
    Invalid,
    /// Cross-node RPC failed or timed out; not retried here.
    #[error("transport failure: {0}")]
    Transport(String),
}

impl VmError {
    pub fn ret(&self) -> RetCode {
        match self {
            VmError::NoTask => RetCode::Esrch,
            VmError::Interrupted => RetCode::Eintr,
            VmError::NoMemory => RetCode::Enomem,
            VmError::Invalid => RetCode::Einval,
            // An I/O-style failure; the closed set has no EIO, so the
            // nearest resource error travels on the wire.
            VmError::Transport(_) => RetCode::Enomem,
        }
    }

    pub fn from_ret(ret: RetCode) -> Option<VmError> {
        match ret {
            RetCode::Okay => None,
            RetCode::Esrch => Some(VmError::NoTask),
            RetCode::Eintr => Some(VmError::Interrupted),
            RetCode::Enomem => Some(VmError::NoMemory),
            RetCode::Einval => Some(VmError::Invalid),
        }
    }
}

impl From<FabricError> for VmError {
    fn from(e: FabricError) -> Self {
        VmError::Transport(e.to_string())
    }
}

/// Stable identifiers for the places an mremap can fail.
///
/// The wire reply's `line` slot historically carried a source line number;
/// these values keep the slot populated without tying the protocol to a
/// compiler artifact. Values are append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MremapSite {
    None = 0,
    TaskLookup = 1,
    Wait = 2,
    BadAddress = 3,
    DestUnmap = 4,
    ShrinkUnmap = 5,
    Resize = 6,
    UnmappedArea = 7,
    MoveFailed = 8,
    ExpandFailed = 9,
    BadFlags = 10,
    CrossNode = 11,
}
