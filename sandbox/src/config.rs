//! Runtime configuration.
//!
//! A `RuntimeConfig` is built once per logical session and cloned into each
//! instance at instantiation. Nothing in it is mutated after handoff.

use std::fmt;
use std::path::PathBuf;

use wasmtime_wasi::pipe::MemoryOutputPipe;

use tiffbridge_hostapi::OpenLimits;

use crate::cache::CompilationCache;

/// Default capacity of an [`OutputCapture`] (1 MiB).
pub const DEFAULT_CAPTURE_CAPACITY: usize = 1024 * 1024;

/// Configuration for compiling and instantiating guest modules.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Shared compilation cache. `None` compiles on a private engine each time.
    pub compilation_cache: Option<CompilationCache>,

    /// Host directories visible to the guest. Empty by default.
    pub filesystem: FsConfig,

    /// Where the guest's stdout goes. Default: discarded.
    pub stdout: OutputTarget,

    /// Where the guest's stderr goes. Default: discarded.
    pub stderr: OutputTarget,

    /// Randomness exposed to the guest.
    pub random: RandomSource,

    /// Log every guest export call and callback at debug level.
    pub debug: bool,

    /// Allocation limits passed to the guest's open options for every file.
    pub limits: OpenLimits,

    /// Upper bound on guest linear memory in bytes.
    pub max_memory_bytes: Option<usize>,

    /// Fuel granted to each guest export call. `None` means unmetered.
    pub fuel_limit: Option<u64>,
}

impl RuntimeConfig {
    pub fn with_cache(mut self, cache: CompilationCache) -> Self {
        self.compilation_cache = Some(cache);
        self
    }

    pub fn with_mount(mut self, mount: DirMount) -> Self {
        self.filesystem.mounts.push(mount);
        self
    }

    pub fn with_stdout(mut self, target: OutputTarget) -> Self {
        self.stdout = target;
        self
    }

    pub fn with_stderr(mut self, target: OutputTarget) -> Self {
        self.stderr = target;
        self
    }

    pub fn with_random(mut self, random: RandomSource) -> Self {
        self.random = random;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_limits(mut self, limits: OpenLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_max_memory_bytes(mut self, bytes: usize) -> Self {
        self.max_memory_bytes = Some(bytes);
        self
    }

    pub fn with_fuel_limit(mut self, fuel: u64) -> Self {
        self.fuel_limit = Some(fuel);
        self
    }
}

/// Filesystem visibility.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FsConfig {
    pub mounts: Vec<DirMount>,
}

impl FsConfig {
    /// No host paths are visible.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }
}

/// One host directory exposed to the guest under `guest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirMount {
    pub host: PathBuf,
    pub guest: String,
    pub read_only: bool,
}

impl DirMount {
    pub fn read_write(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: false,
        }
    }

    pub fn read_only(host: impl Into<PathBuf>, guest: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            guest: guest.into(),
            read_only: true,
        }
    }
}

/// Destination of a guest output stream.
#[derive(Debug, Clone, Default)]
pub enum OutputTarget {
    #[default]
    Discard,
    /// Forward to the host process's own stream.
    Inherit,
    /// Keep in memory; read back through the [`OutputCapture`].
    Capture(OutputCapture),
}

impl OutputTarget {
    /// A fresh in-memory capture, returned alongside the target for reading.
    pub fn capture() -> (Self, OutputCapture) {
        let capture = OutputCapture::new(DEFAULT_CAPTURE_CAPACITY);
        (Self::Capture(capture.clone()), capture)
    }
}

/// In-memory sink for guest output. Clones share the same buffer.
#[derive(Clone)]
pub struct OutputCapture {
    pipe: MemoryOutputPipe,
}

impl OutputCapture {
    pub fn new(capacity: usize) -> Self {
        Self {
            pipe: MemoryOutputPipe::new(capacity),
        }
    }

    pub(crate) fn pipe(&self) -> MemoryOutputPipe {
        self.pipe.clone()
    }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.pipe.contents().to_vec()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl fmt::Debug for OutputCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputCapture")
            .field("len", &self.pipe.contents().len())
            .finish()
    }
}

/// Source of the guest's random bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RandomSource {
    /// Operating system randomness.
    #[default]
    Os,
    /// Deterministic stream from a fixed seed.
    Seeded(u64),
}
