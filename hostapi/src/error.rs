//! Host-side error and diagnostic types.
//!
//! `HostError` covers failures of host resources reached from guest
//! callbacks. `GuestDiagnostic` is the message the guest library formats and
//! passes to its error or warning handler; it is data, not a host failure.

use std::fmt;
use std::io;

use crate::types::StreamId;

/// Host-side error type returned by stream table operations.
#[derive(Debug)]
pub enum HostError {
    /// The guest referred to a stream id that is not (or no longer) registered.
    UnknownStream(StreamId),
    /// The entry exists but its stream was already closed or never attached.
    StreamDetached(StreamId),
    /// The underlying host stream failed.
    Io(io::Error),
    /// The requested operation is not supported by this stream.
    Unsupported(&'static str),
}

impl HostError {
    /// Create an unsupported-operation error.
    pub fn unsupported(op: &'static str) -> Self {
        Self::Unsupported(op)
    }

    /// Convert into an `io::Error`, for stream adapters that must speak `io`.
    pub fn into_io(self) -> io::Error {
        match self {
            Self::Io(e) => e,
            Self::Unsupported(op) => io::Error::new(io::ErrorKind::Unsupported, op),
            other => io::Error::new(io::ErrorKind::NotFound, other.to_string()),
        }
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownStream(id) => write!(f, "unknown {}", id),
            Self::StreamDetached(id) => write!(f, "{} has no open stream", id),
            Self::Io(e) => write!(f, "stream i/o error: {}", e),
            Self::Unsupported(op) => write!(f, "unsupported stream operation: {}", op),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// A message reported by the guest library through its error or warning handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestDiagnostic {
    /// The guest module (usually the C function name) that raised the message.
    pub module: String,
    /// The fully formatted message text.
    pub message: String,
}

impl GuestDiagnostic {
    pub fn new(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for GuestDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.module.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.module, self.message)
        }
    }
}

impl std::error::Error for GuestDiagnostic {}
