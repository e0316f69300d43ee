//! Fault classification and the error taxonomy.

use core::fmt;

/// Hardware translation-fault classification, decoded from the raw code the
/// trap path hands up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Translation miss on a load.
    Read,

    /// Translation miss on a store.
    Write,

    /// Store through a cached mapping whose write-permission bit is clear.
    ReadOnly,
}

impl FaultKind {
    /// Decodes a raw fault code. Returns `None` for codes this handler does
    /// not recognize.
    pub const fn from_code(code: usize) -> Option<Self> {
        match code {
            0 => Some(Self::Read),
            1 => Some(Self::Write),
            2 => Some(Self::ReadOnly),
            _ => None,
        }
    }
}

/// Errors surfaced by memory-manager operations.
///
/// Invariant violations do not get an error variant; those panic at the point
/// of detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame remains, or the page table is full.
    OutOfMemory,

    /// The address is not backed by any region, or the access violates the
    /// mapping's permissions. Fatal to the faulting thread.
    InvalidAccess,

    /// The request itself is malformed, such as an unrecognized fault code.
    InvalidRequest,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfMemory => "out of physical memory",
            Self::InvalidAccess => "invalid memory access",
            Self::InvalidRequest => "invalid memory-manager request",
        };
        f.write_str(message)
    }
}
