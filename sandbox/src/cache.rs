//! Compiled guest images and the shared compilation cache.
//!
//! A `CompiledImage` is immutable and may back any number of instances.
//! The cache keys images by the blake3 digest of their bytes and serializes
//! every compile through a dedicated lock. That lock is never held across
//! instantiation or execution.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use wasmtime::{Config, Engine, Module};

use crate::error::{BridgeError, Result};

/// A parsed, validated and compiled guest binary.
#[derive(Clone)]
pub struct CompiledImage {
    engine: Engine,
    module: Module,
    digest: blake3::Hash,
}

impl CompiledImage {
    /// Compile `bytes`, through `cache` when given.
    ///
    /// Accepts a binary module or its text format.
    pub fn compile(bytes: &[u8], cache: Option<&CompilationCache>) -> Result<Self> {
        match cache {
            Some(cache) => cache.compile(bytes),
            None => {
                let engine = create_engine()?;
                let module = compile_module(&engine, bytes)?;
                Ok(Self {
                    engine,
                    module,
                    digest: blake3::hash(bytes),
                })
            }
        }
    }

    /// Load and compile a module from disk.
    pub fn from_file(path: &Path, cache: Option<&CompilationCache>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Self::compile(&bytes, cache)
    }

    /// Content digest of the source bytes.
    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Whether the module exports a function named `name`.
    pub fn exports_function(&self, name: &str) -> bool {
        self.module
            .get_export(name)
            .map(|ty| ty.func().is_some())
            .unwrap_or(false)
    }
}

impl fmt::Debug for CompiledImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledImage")
            .field("digest", &self.digest.to_hex())
            .finish()
    }
}

/// Process-wide cache of compiled modules sharing one engine.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct CompilationCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    engine: Engine,
    modules: Mutex<HashMap<blake3::Hash, Module>>,
    compile_lock: Mutex<()>,
    compilations: AtomicUsize,
}

impl CompilationCache {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(CacheInner {
                engine: create_engine()?,
                modules: Mutex::new(HashMap::new()),
                compile_lock: Mutex::new(()),
                compilations: AtomicUsize::new(0),
            }),
        })
    }

    /// Return the cached image for `bytes`, compiling it on first use.
    pub fn compile(&self, bytes: &[u8]) -> Result<CompiledImage> {
        let digest = blake3::hash(bytes);
        let _compiling = self
            .inner
            .compile_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        if let Some(module) = self.modules().get(&digest).cloned() {
            tracing::trace!(digest = %digest.to_hex(), "compilation cache hit");
            return Ok(self.image(module, digest));
        }

        tracing::info!(digest = %digest.to_hex(), len = bytes.len(), "compiling guest module");
        let module = compile_module(&self.inner.engine, bytes)?;
        self.inner.compilations.fetch_add(1, Ordering::Relaxed);
        self.modules().insert(digest, module.clone());
        Ok(self.image(module, digest))
    }

    pub fn contains(&self, digest: &blake3::Hash) -> bool {
        self.modules().contains_key(digest)
    }

    /// Number of distinct binaries cached.
    pub fn len(&self) -> usize {
        self.modules().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules().is_empty()
    }

    /// How many real compilations this cache has performed.
    pub fn compilations(&self) -> usize {
        self.inner.compilations.load(Ordering::Relaxed)
    }

    /// Drop every cached module. Images already handed out stay valid.
    pub fn clear(&self) {
        self.modules().clear();
    }

    pub fn engine(&self) -> &Engine {
        &self.inner.engine
    }

    fn image(&self, module: Module, digest: blake3::Hash) -> CompiledImage {
        CompiledImage {
            engine: self.inner.engine.clone(),
            module,
            digest,
        }
    }

    fn modules(&self) -> MutexGuard<'_, HashMap<blake3::Hash, Module>> {
        self.inner.modules.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for CompilationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompilationCache")
            .field("modules", &self.len())
            .field("compilations", &self.compilations())
            .finish()
    }
}

/// Create an engine for guest modules.
///
/// Fuel metering is always compiled in so a per-call budget can be applied
/// by any instance sharing the engine.
pub(crate) fn create_engine() -> Result<Engine> {
    let mut config = Config::new();
    config.consume_fuel(true);
    config.wasm_threads(false);
    Engine::new(&config).map_err(|e| BridgeError::Compilation(format!("engine setup: {:#}", e)))
}

fn compile_module(engine: &Engine, bytes: &[u8]) -> Result<Module> {
    Module::new(engine, bytes).map_err(|e| BridgeError::Compilation(format!("{:#}", e)))
}
