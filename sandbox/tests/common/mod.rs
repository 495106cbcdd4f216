//! Shared test helpers for integration tests.
//!
//! Provides the guest fixtures, a process-wide compiled image of the fake
//! library, and builders for in-memory files in its container format.

#![allow(dead_code)]

use std::sync::OnceLock;

use tiffbridge_sandbox::{
    CompiledImage, MemStream, RuntimeConfig, TiffFile, TiffLibrary,
};

/// Text of the fake guest library. wasmtime accepts the text format directly.
pub const FAKE_LIBTIFF: &str = include_str!("../fixtures/fake_libtiff.wat");

/// Text of the WASI command used by registry tests.
pub const ECHO_TOOL: &str = include_str!("../fixtures/echo_tool.wat");

/// A command whose entry point traps.
pub const TRAP_TOOL: &str = r#"(module
    (memory (export "memory") 1)
    (func (export "_start") unreachable))"#;

/// A command that never returns.
pub const SPIN_TOOL: &str = r#"(module
    (memory (export "memory") 1)
    (func (export "_start") (loop $l (br $l))))"#;

/// Container magic of the fake library ("WTIF").
pub const MAGIC: u32 = 0x4649_5457;

/// Size of the container's header area.
pub const HEADER_LEN: usize = 40;

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// The fake library compiled once per test binary.
pub fn image() -> &'static CompiledImage {
    static IMAGE: OnceLock<CompiledImage> = OnceLock::new();
    IMAGE.get_or_init(|| {
        CompiledImage::compile(FAKE_LIBTIFF.as_bytes(), None).expect("fake library compiles")
    })
}

/// A fresh library-mode instance with default capabilities.
pub fn library() -> TiffLibrary {
    library_with(&RuntimeConfig::default())
}

pub fn library_with(config: &RuntimeConfig) -> TiffLibrary {
    init_tracing();
    TiffLibrary::from_image(image(), config).expect("library instantiates")
}

/// Container bytes with one directory per `(width, height)` entry.
pub fn container(dims: &[(u32, u32)]) -> Vec<u8> {
    container_with_count(dims, dims.len() as u32)
}

/// Container bytes whose header claims `count` directories.
pub fn container_with_count(dims: &[(u32, u32)], count: u32) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(HEADER_LEN.max(8 + dims.len() * 8));
    bytes.extend_from_slice(&MAGIC.to_le_bytes());
    bytes.extend_from_slice(&count.to_le_bytes());
    for (w, h) in dims {
        bytes.extend_from_slice(&w.to_le_bytes());
        bytes.extend_from_slice(&h.to_le_bytes());
    }
    if bytes.len() < HEADER_LEN {
        bytes.resize(HEADER_LEN, 0);
    }
    bytes
}

/// Decode the directory table of a container.
pub fn parse_container(bytes: &[u8]) -> Vec<(u32, u32)> {
    let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
    assert_eq!(word(0), MAGIC, "container magic");
    (0..word(4) as usize)
        .map(|d| (word(8 + d * 8), word(12 + d * 8)))
        .collect()
}

/// Open an in-memory container for reading.
pub fn open_dims(library: &TiffLibrary, dims: &[(u32, u32)]) -> TiffFile {
    library
        .open_stream("memory.wtif", "r", MemStream::with_data(container(dims)))
        .expect("container opens")
}

/// Open a new, empty in-memory file for writing; the stream is returned so
/// the written bytes can be inspected.
pub fn create(library: &TiffLibrary) -> (TiffFile, MemStream) {
    let sink = MemStream::new();
    let file = library
        .open_stream("new.wtif", "w", sink.clone())
        .expect("write mode opens");
    (file, sink)
}
