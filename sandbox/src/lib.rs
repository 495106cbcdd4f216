//! `tiffbridge-sandbox`: drives a WebAssembly build of libtiff from Rust.
//!
//! The guest library runs inside a wasmtime sandbox. This crate compiles it,
//! binds the host callbacks it imports, and exposes it through a typed API:
//!
//! - **Compilation:** [`CompiledImage`], optionally shared through a
//!   [`CompilationCache`] keyed by content digest
//! - **Instances:** [`GuestInstance`] in library or program mode, with one
//!   call guard per instance and aggregated shutdown errors
//! - **Marshaling:** [`Session`] allocates, reads and writes guest memory
//!   and releases every allocation on all exit paths
//! - **Files:** [`TiffLibrary`] opens [`TiffFile`]s from guest paths or
//!   host streams; fields, directories, strips, scanlines, tiles and RGBA
//!   rasters are typed
//! - **Introspection:** configured codecs and field descriptors, decoded
//!   into owned values
//! - **Tools:** [`CommandRegistry`] runs embedded command-line programs
//!
//! There is no cancellation. A per-call fuel budget
//! ([`RuntimeConfig::with_fuel_limit`]) bounds how long one export may run.

pub mod abi;
pub mod cache;
pub mod config;
pub mod directory;
pub mod error;
pub mod field;
pub mod file;
pub mod host_impl;
pub mod introspect;
pub mod library;
pub mod linker;
pub mod memory;
pub mod raster;
pub mod registry;
pub mod runtime;
pub mod session;
pub mod tags;
pub mod validation;

pub use abi::GuestHandle;
pub use cache::{CompilationCache, CompiledImage};
pub use config::{DirMount, FsConfig, OutputCapture, OutputTarget, RandomSource, RuntimeConfig};
pub use directory::Directories;
pub use error::{BridgeError, CloseError, Result};
pub use field::{FieldShape, FieldTag, FieldType, FieldValue, Lookup};
pub use file::TiffFile;
pub use introspect::{Codec, FieldCount, FieldInfo};
pub use library::TiffLibrary;
pub use raster::RasterView;
pub use registry::CommandRegistry;
pub use runtime::{GuestInstance, InstanceMode};
pub use session::Session;

pub use tiffbridge_hostapi as hostapi;
pub use tiffbridge_hostapi::{GuestDiagnostic, GuestStream, MemStream, OpenLimits};
