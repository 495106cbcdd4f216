//! `tiffbridge-hostapi`: host-side types for the tiffbridge guest runtime.
//!
//! This crate defines what the sandbox exposes to the guest library's
//! client I/O and diagnostic callbacks, independent of the VM:
//!
//! - `GuestStream` trait: the host side of the guest's read/write/seek/size/close procedures
//! - `IoStream`, `ReadOnlyStream`: adapters over `std::io` types
//! - `MemStream`: shared in-memory stream for tests and buffers
//! - `StreamTable`: per-instance registry of open resources and their diagnostics
//! - `OpenLimits`: allocation limits forwarded to the guest's open options
//! - `HostError`, `GuestDiagnostic`: host failures and guest-reported messages

pub mod error;
pub mod types;
pub mod traits;
pub mod mem_stream;
pub mod stream_table;

// Re-export commonly used types at the crate root.
pub use error::{GuestDiagnostic, HostError};
pub use types::{OpenLimits, StreamId, Whence, CALLBACK_FAILED, CALLBACK_FAILED_64};
pub use traits::{GuestStream, IoStream, ReadOnlyStream, WarningHandler};
pub use mem_stream::MemStream;
pub use stream_table::StreamTable;
