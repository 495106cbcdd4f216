//! Registry of embedded command-line tools, each its own guest program.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::cache::CompiledImage;
use crate::config::RuntimeConfig;
use crate::error::{BridgeError, Result};
use crate::runtime::GuestInstance;

/// Maps a tool name to the guest binary that implements it.
///
/// Registration is idempotent by name: the first binary registered under a
/// name stays, later registrations are ignored.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    tools: RwLock<BTreeMap<String, Arc<[u8]>>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static CommandRegistry {
        static GLOBAL: OnceLock<CommandRegistry> = OnceLock::new();
        GLOBAL.get_or_init(CommandRegistry::new)
    }

    /// Register `wasm` under `name`. Returns `false` if the name was taken.
    pub fn register(&self, name: impl Into<String>, wasm: impl Into<Arc<[u8]>>) -> bool {
        let name = name.into();
        let mut tools = self.tools.write().unwrap_or_else(|e| e.into_inner());
        if tools.contains_key(&name) {
            tracing::debug!(tool = %name, "tool already registered");
            return false;
        }
        tracing::debug!(tool = %name, "registered tool");
        tools.insert(name, wasm.into());
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<[u8]>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn list(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run tool `name` to completion with `args` (argv[0] is the tool name).
    ///
    /// An unknown name fails with [`BridgeError::UnknownTool`] before anything
    /// is compiled. A non-zero exit fails with [`BridgeError::ExitStatus`].
    pub fn run(&self, name: &str, args: &[String], config: &RuntimeConfig) -> Result<()> {
        let wasm = self
            .get(name)
            .ok_or_else(|| BridgeError::UnknownTool(name.to_owned()))?;

        let image = CompiledImage::compile(&wasm, config.compilation_cache.as_ref())?;
        let instance = GuestInstance::program(&image, config)?;

        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(name.to_owned());
        argv.extend_from_slice(args);

        let outcome = instance.run_program(&argv);
        if let Err(e) = instance.close() {
            tracing::warn!(tool = name, error = %e, "closing tool instance");
        }
        outcome
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Arc<[u8]>>> {
        self.tools.read().unwrap_or_else(|e| e.into_inner())
    }
}
