//! Plain host-side types shared between the stream layer and the sandbox.
//!
//! `OpenLimits` carries the allocation knobs forwarded to the guest's open
//! options. `StreamId` names one entry of the per-instance stream table and
//! doubles as the opaque client data the guest hands back to every callback.

use std::fmt;
use std::io::SeekFrom;

/// Return value of a stream callback that failed (read/write/seek/size).
pub const CALLBACK_FAILED: i32 = -1;

/// 64-bit variant of [`CALLBACK_FAILED`] for seek and size callbacks.
pub const CALLBACK_FAILED_64: i64 = -1;

/// Identifier of one entry in a [`StreamTable`](crate::StreamTable).
///
/// Ids start at 1. The guest treats the value as an opaque pointer-sized
/// client handle, so 0 is reserved for "no client".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Interpret a raw guest argument as a stream id. Returns `None` for 0
    /// and for negative values.
    pub fn from_guest(raw: i32) -> Option<Self> {
        u32::try_from(raw).ok().filter(|v| *v != 0).map(Self)
    }

    /// The value passed to the guest as client data.
    pub fn to_guest(self) -> i32 {
        self.0 as i32
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Seek origin as encoded by the guest's C library (`SEEK_SET`, `SEEK_CUR`, `SEEK_END`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Current,
    End,
}

impl Whence {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Set),
            1 => Some(Self::Current),
            2 => Some(Self::End),
            _ => None,
        }
    }

    /// Combine with an offset into a `SeekFrom`. A negative absolute offset
    /// is rejected.
    pub fn to_seek_from(self, offset: i64) -> Option<SeekFrom> {
        match self {
            Self::Set => u64::try_from(offset).ok().map(SeekFrom::Start),
            Self::Current => Some(SeekFrom::Current(offset)),
            Self::End => Some(SeekFrom::End(offset)),
        }
    }
}

/// Allocation limits enforced by the guest library for one opened file.
///
/// `None` leaves the guest's built-in default in place. Violations are
/// reported by the guest through its error handler with the attempted size
/// and the configured limit in the message text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenLimits {
    /// Largest single allocation the guest may perform for this file.
    pub max_single_alloc: Option<u64>,
    /// Largest total of live allocations the guest may hold for this file.
    pub max_cumulative_alloc: Option<u64>,
}

impl OpenLimits {
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_max_single_alloc(mut self, bytes: u64) -> Self {
        self.max_single_alloc = Some(bytes);
        self
    }

    pub fn with_max_cumulative_alloc(mut self, bytes: u64) -> Self {
        self.max_cumulative_alloc = Some(bytes);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_single_alloc.is_none() && self.max_cumulative_alloc.is_none()
    }
}
