//! Bridge error types.

use std::fmt;

use tiffbridge_hostapi::{GuestDiagnostic, HostError};

use crate::field::FieldTag;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BridgeError> = std::result::Result<T, E>;

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The guest binary failed to parse or compile. Fatal for that binary.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// Import resolution or initializer execution failed.
    #[error("instantiation failed: {0}")]
    Instantiation(String),

    /// Module validation failed (missing exports, wrong export kinds).
    #[error("validation error: {0}")]
    Validation(String),

    /// The guest allocator returned null or the fresh region could not be zeroed.
    #[error("guest allocation of {size} bytes failed: {reason}")]
    Allocation { size: u64, reason: String },

    /// A host read or write fell outside the guest's linear memory.
    #[error("guest memory access out of bounds: {len} bytes at {ptr:#x} (memory size {memory_size})")]
    MemoryAccess { ptr: u32, len: u64, memory_size: u64 },

    /// The tag is absent from the current directory, or present with a
    /// different type. The guest ABI does not distinguish the two.
    #[error("tag {tag} is not defined in the current directory")]
    FieldNotDefined { tag: FieldTag },

    /// The guest rejected a field update.
    #[error("could not set tag {tag}{}", suffix(.diagnostic))]
    FieldSet {
        tag: FieldTag,
        diagnostic: Option<GuestDiagnostic>,
    },

    /// A guest export reported failure through its sentinel return.
    #[error("{operation} failed: {detail}")]
    CallFailed { operation: String, detail: String },

    /// The guest reported a failure through its error handler.
    #[error("guest error: {0}")]
    Guest(GuestDiagnostic),

    /// A required export is not present in the module.
    #[error("missing export: {0}")]
    MissingExport(String),

    /// The guest trapped while running an export.
    #[error("guest trapped in {export}: {message}")]
    Trap { export: String, message: String },

    /// The per-call execution budget ran out.
    #[error("fuel exhausted in {export}")]
    FuelExhausted { export: String },

    /// An embedded program ran to completion with a non-zero exit code.
    #[error("program exited with status {code}")]
    ExitStatus { code: i32 },

    /// No tool is registered under this name.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// The calling thread already holds this instance's call guard, for
    /// example through a raster view that is still alive.
    #[error("call guard is already held by this thread")]
    Reentrant,

    /// The instance or file was already closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// One or more steps of a close sequence failed.
    #[error(transparent)]
    Close(#[from] CloseError),

    /// Host resource failure reached from a callback or a stream operation.
    #[error("host error: {0}")]
    Host(#[from] HostError),

    /// Wasmtime engine, linker or store error.
    #[error("wasmtime error: {0}")]
    Wasmtime(#[from] anyhow::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

fn suffix(diagnostic: &Option<GuestDiagnostic>) -> String {
    match diagnostic {
        Some(d) => format!(": {}", d),
        None => String::new(),
    }
}

impl BridgeError {
    /// Generic failure of a guest export, with the arguments that caused it.
    pub fn call_failed(operation: impl Into<String>, detail: impl fmt::Display) -> Self {
        Self::CallFailed {
            operation: operation.into(),
            detail: detail.to_string(),
        }
    }

    /// True for the recoverable "optional metadata absent" case.
    pub fn is_field_not_defined(&self) -> bool {
        matches!(self, Self::FieldNotDefined { .. })
    }

    /// Exit code of a program run, if this is an exit status error.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::ExitStatus { code } => Some(*code),
            _ => None,
        }
    }
}

/// Every failure encountered by a close sequence, in the order the steps ran.
#[derive(Debug, Default)]
pub struct CloseError {
    failures: Vec<BridgeError>,
}

impl CloseError {
    pub fn push(&mut self, err: BridgeError) {
        self.failures.push(err);
    }

    pub fn failures(&self) -> &[BridgeError] {
        &self.failures
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// `Ok(())` when no step failed.
    pub fn into_result(self) -> Result<(), CloseError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "close failed")?;
        for (i, err) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}", sep, err)?;
        }
        Ok(())
    }
}

impl std::error::Error for CloseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_set_display_includes_diagnostic() {
        let err = BridgeError::FieldSet {
            tag: FieldTag(305),
            diagnostic: Some(GuestDiagnostic::new("_TIFFmallocExt", "limit hit")),
        };
        assert_eq!(err.to_string(), "could not set tag 305: _TIFFmallocExt: limit hit");

        let err = BridgeError::FieldSet {
            tag: FieldTag(305),
            diagnostic: None,
        };
        assert_eq!(err.to_string(), "could not set tag 305");
    }

    #[test]
    fn test_close_error_aggregates() {
        let mut agg = CloseError::default();
        assert!(agg.is_empty());
        agg.push(BridgeError::call_failed("close stream", "broken pipe"));
        agg.push(BridgeError::Closed("instance"));
        let msg = agg.to_string();
        assert!(msg.starts_with("close failed: close stream failed: broken pipe"));
        assert!(msg.contains("; instance is closed"));
        assert_eq!(agg.into_result().unwrap_err().failures().len(), 2);
    }

    #[test]
    fn test_empty_close_error_is_ok() {
        assert!(CloseError::default().into_result().is_ok());
    }

    #[test]
    fn test_exit_code_accessor() {
        assert_eq!(BridgeError::ExitStatus { code: 3 }.exit_code(), Some(3));
        assert_eq!(BridgeError::UnknownTool("x".into()).exit_code(), None);
        assert!(BridgeError::FieldNotDefined { tag: FieldTag(256) }.is_field_not_defined());
    }
}
