//! Guest instance lifecycle: instantiation, the call guard, and shutdown.
//!
//! A `GuestInstance` is one running copy of a `CompiledImage` bound to the
//! host import table and a capability set. All access to its store goes
//! through a per-instance mutex, so at most one export call (or memory
//! access that must be consistent with a call) is in flight at a time.
//! Independent instances share nothing mutable and run fully in parallel.
//!
//! The guard is not reentrant. A thread that already holds it (through a
//! live [`Session`] or a raster view) gets [`BridgeError::Reentrant`] from
//! any further attempt instead of blocking on itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use wasmtime::{Instance, Linker, Memory, Store, Trap, Val};
use wasmtime_wasi::I32Exit;

use tiffbridge_hostapi::StreamTable;

use crate::abi;
use crate::cache::CompiledImage;
use crate::config::RuntimeConfig;
use crate::error::{BridgeError, CloseError, Result};
use crate::host_impl::HostState;
use crate::linker::register_host_functions;
use crate::session::Session;
use crate::validation::validate_module;

/// How an instance runs its guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceMode {
    /// Static initializers only; exports are called on demand.
    Library,
    /// The full program entry point runs with an argv, once per run.
    Program,
}

/// The live module handle: store, instance and exported memory.
pub(crate) struct Live {
    pub(crate) store: Store<HostState>,
    pub(crate) instance: Instance,
    pub(crate) memory: Memory,
}

impl Live {
    /// Invoke export `name` with untyped arguments and return its raw results.
    pub(crate) fn call(
        &mut self,
        name: &str,
        args: &[Val],
        fuel: Option<u64>,
        debug: bool,
    ) -> Result<Vec<Val>> {
        let func = self
            .instance
            .get_func(&mut self.store, name)
            .ok_or_else(|| BridgeError::MissingExport(name.to_string()))?;
        let mut results = vec![Val::I32(0); func.ty(&self.store).results().len()];

        self.store.set_fuel(fuel.unwrap_or(u64::MAX))?;
        if debug {
            tracing::debug!(export = name, ?args, "guest call");
        }
        func.call(&mut self.store, args, &mut results)
            .map_err(|e| classify_trap(name, e))?;
        if debug {
            tracing::debug!(export = name, ?results, "guest call returned");
        }
        Ok(results)
    }
}

/// Everything the call guard protects.
pub(crate) struct Slot {
    pub(crate) live: Option<Live>,
    image: Option<CompiledImage>,
}

/// Thread currently holding the call guard.
#[derive(Default)]
struct GuardOwner(Mutex<Option<ThreadId>>);

impl GuardOwner {
    fn is_current(&self) -> bool {
        *self.lock() == Some(thread::current().id())
    }

    fn set(&self, owner: Option<ThreadId>) {
        *self.lock() = owner;
    }

    fn lock(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One instantiated guest.
pub struct GuestInstance {
    slot: Mutex<Slot>,
    owner: GuardOwner,
    closed: AtomicBool,
    mode: InstanceMode,
    config: RuntimeConfig,
    streams: Arc<StreamTable>,
    digest: blake3::Hash,
}

impl GuestInstance {
    /// Instantiate `image` in library mode and run its static initializers.
    pub fn library(image: &CompiledImage, config: &RuntimeConfig) -> Result<Self> {
        validate_module(image.module(), InstanceMode::Library)?;
        let streams = Arc::new(StreamTable::new());
        let mut live = instantiate(image, config, Arc::clone(&streams), &[])?;

        if image.exports_function(abi::INITIALIZE) {
            live.call(abi::INITIALIZE, &[], config.fuel_limit, config.debug)
                .map_err(|e| BridgeError::Instantiation(format!("{}: {}", abi::INITIALIZE, e)))?;
        }
        tracing::debug!(digest = %image.digest().to_hex(), "library instance ready");

        Ok(Self {
            slot: Mutex::new(Slot {
                live: Some(live),
                image: Some(image.clone()),
            }),
            owner: GuardOwner::default(),
            closed: AtomicBool::new(false),
            mode: InstanceMode::Library,
            config: config.clone(),
            streams,
            digest: image.digest(),
        })
    }

    /// Prepare `image` for program mode. Nothing runs until [`run_program`](Self::run_program).
    pub fn program(image: &CompiledImage, config: &RuntimeConfig) -> Result<Self> {
        validate_module(image.module(), InstanceMode::Program)?;
        Ok(Self {
            slot: Mutex::new(Slot {
                live: None,
                image: Some(image.clone()),
            }),
            owner: GuardOwner::default(),
            closed: AtomicBool::new(false),
            mode: InstanceMode::Program,
            config: config.clone(),
            streams: Arc::new(StreamTable::new()),
            digest: image.digest(),
        })
    }

    /// Run the program entry point with `args` as argv.
    ///
    /// Every run starts from a fresh module handle. A normal return or an
    /// exit code of 0 is success; any other exit code is
    /// [`BridgeError::ExitStatus`].
    pub fn run_program(&self, args: &[String]) -> Result<()> {
        if self.mode != InstanceMode::Program {
            return Err(BridgeError::call_failed(
                abi::START,
                "instance was created in library mode",
            ));
        }
        let mut slot = self.guard()?;
        if self.is_closed() {
            return Err(BridgeError::Closed("instance"));
        }
        let image = slot.image.clone().ok_or(BridgeError::Closed("instance"))?;
        // The previous run's handle goes before the next one is built.
        slot.live = None;

        let live = slot
            .live
            .insert(instantiate(&image, &self.config, Arc::clone(&self.streams), args)?);
        tracing::debug!(args = ?args, "running program");
        match live.call(abi::START, &[], self.config.fuel_limit, self.config.debug) {
            Ok(_) | Err(BridgeError::ExitStatus { code: 0 }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Acquire the call guard for a sequence of calls and memory accesses.
    ///
    /// Blocks while another thread holds the guard. Fails with
    /// [`BridgeError::Reentrant`] if the calling thread already holds it.
    pub fn session(&self) -> Result<Session<'_>> {
        let slot = self.guard()?;
        if self.is_closed() || slot.live.is_none() {
            return Err(BridgeError::Closed("instance"));
        }
        self.owner.set(Some(thread::current().id()));
        Ok(Session::new(self, slot))
    }

    /// Called by a dropping session just before it unlocks the guard.
    pub(crate) fn release_owner(&self) {
        self.owner.set(None);
    }

    /// Call one export under the guard and return its raw results.
    pub fn call_export(&self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        self.session()?.call(name, args)
    }

    /// Shut the instance down: module handle, then host streams, then the
    /// compiled image.
    ///
    /// Each step runs even if an earlier one failed; all failures are
    /// returned together. Closing an already closed instance is a no-op.
    pub fn close(&self) -> Result<(), CloseError> {
        let mut failures = CloseError::default();
        if self.owner.is_current() {
            failures.push(BridgeError::Reentrant);
            return failures.into_result();
        }
        let mut slot = match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                failures.push(BridgeError::call_failed(
                    "close",
                    "call guard poisoned by a panic during an earlier call",
                ));
                poisoned.into_inner()
            }
        };
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if slot.live.take().is_some() {
            tracing::trace!("module handle released");
        }
        for (id, err) in self.streams.close_all() {
            failures.push(BridgeError::call_failed(format!("close {}", id), err));
        }
        slot.image = None;

        failures.into_result()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> InstanceMode {
        self.mode
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Resources reachable from this instance's callbacks.
    pub fn streams(&self) -> &Arc<StreamTable> {
        &self.streams
    }

    /// Digest of the image this instance was created from.
    pub fn digest(&self) -> blake3::Hash {
        self.digest
    }

    fn guard(&self) -> Result<MutexGuard<'_, Slot>> {
        if self.owner.is_current() {
            return Err(BridgeError::Reentrant);
        }
        Ok(self.lock())
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // A panic inside a guest call leaves the store usable; carry on.
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for GuestInstance {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "closing guest instance on drop");
        }
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("mode", &self.mode)
            .field("digest", &self.digest.to_hex())
            .finish()
    }
}

/// Build a store, bind the import table and instantiate.
fn instantiate(
    image: &CompiledImage,
    config: &RuntimeConfig,
    streams: Arc<StreamTable>,
    args: &[String],
) -> Result<Live> {
    let state = HostState::new(config, streams, args)?;
    let mut store = Store::new(image.engine(), state);
    store.limiter(|state| &mut state.limits);
    store.set_fuel(config.fuel_limit.unwrap_or(u64::MAX))?;

    let mut linker = Linker::new(image.engine());
    register_host_functions(&mut linker)?;

    let instance = linker
        .instantiate(&mut store, image.module())
        .map_err(|e| BridgeError::Instantiation(format!("{:#}", e)))?;
    let memory = instance
        .get_memory(&mut store, abi::MEMORY)
        .ok_or_else(|| BridgeError::Validation("module must export 'memory'".into()))?;

    Ok(Live {
        store,
        instance,
        memory,
    })
}

/// Convert a failed call into the bridge taxonomy.
///
/// `proc_exit` → `ExitStatus`
/// Fuel exhaustion → `FuelExhausted`
/// Other traps and host errors → `Trap`
fn classify_trap(export: &str, err: anyhow::Error) -> BridgeError {
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return BridgeError::ExitStatus { code: exit.0 };
    }
    if matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel)) {
        return BridgeError::FuelExhausted {
            export: export.to_string(),
        };
    }
    BridgeError::Trap {
        export: export.to_string(),
        message: format!("{:#}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $n (mut i32) (i32.const 0))
            (global $init (mut i32) (i32.const 0))
            (func (export "_initialize") (global.set $init (i32.const 1)))
            (func (export "initialized") (result i32) (global.get $init))
            (func (export "malloc") (param i32) (result i32) (i32.const 1024))
            (func (export "free") (param i32))
            (func (export "bump") (param $by i32) (result i32)
                (global.set $n (i32.add (global.get $n) (local.get $by)))
                (global.get $n))
            (func (export "spin") (loop $l (br $l)))
            (func (export "boom") unreachable))
    "#;

    fn counter() -> GuestInstance {
        let image = CompiledImage::compile(COUNTER.as_bytes(), None).unwrap();
        GuestInstance::library(&image, &RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_library_runs_initializer() {
        let instance = counter();
        let results = instance.call_export("initialized", &[]).unwrap();
        assert_eq!(results[0].unwrap_i32(), 1);
        assert_eq!(instance.mode(), InstanceMode::Library);
    }

    #[test]
    fn test_call_export_keeps_state_between_calls() {
        let instance = counter();
        instance.call_export("bump", &[Val::I32(2)]).unwrap();
        let results = instance.call_export("bump", &[Val::I32(3)]).unwrap();
        assert_eq!(results[0].unwrap_i32(), 5);
    }

    #[test]
    fn test_missing_export() {
        let instance = counter();
        match instance.call_export("nope", &[]) {
            Err(BridgeError::MissingExport(name)) => assert_eq!(name, "nope"),
            other => panic!("expected MissingExport, got {:?}", other),
        }
    }

    #[test]
    fn test_trap_leaves_instance_usable() {
        let instance = counter();
        match instance.call_export("boom", &[]) {
            Err(BridgeError::Trap { export, .. }) => assert_eq!(export, "boom"),
            other => panic!("expected Trap, got {:?}", other),
        }
        assert!(instance.call_export("bump", &[Val::I32(1)]).is_ok());
    }

    #[test]
    fn test_fuel_limit_stops_runaway_call() {
        let image = CompiledImage::compile(COUNTER.as_bytes(), None).unwrap();
        let config = RuntimeConfig::default().with_fuel_limit(100_000);
        let instance = GuestInstance::library(&image, &config).unwrap();

        match instance.call_export("spin", &[]) {
            Err(BridgeError::FuelExhausted { export }) => assert_eq!(export, "spin"),
            other => panic!("expected FuelExhausted, got {:?}", other),
        }
        // the budget is per call
        assert!(instance.call_export("bump", &[Val::I32(1)]).is_ok());
    }

    #[test]
    fn test_close_is_idempotent() {
        let instance = counter();
        assert!(instance.close().is_ok());
        assert!(instance.is_closed());
        assert!(instance.close().is_ok());
        assert!(matches!(
            instance.call_export("bump", &[Val::I32(1)]),
            Err(BridgeError::Closed(_))
        ));
    }

    #[test]
    fn test_nested_session_on_one_thread_is_refused() {
        let instance = counter();
        let mut outer = instance.session().unwrap();
        match instance.session() {
            Err(BridgeError::Reentrant) => {}
            other => panic!("expected Reentrant, got {:?}", other.map(|_| ())),
        }
        match instance.close() {
            Err(e) => assert!(matches!(e.failures(), [BridgeError::Reentrant])),
            Ok(()) => panic!("expected close to refuse while the guard is held"),
        }
        assert!(!instance.is_closed());
        assert_eq!(outer.call_i32("bump", &[Val::I32(1)]).unwrap(), 1);
        drop(outer);

        assert!(instance.session().is_ok());
        assert!(instance.close().is_ok());
    }

    #[test]
    fn test_other_threads_wait_for_the_guard() {
        let instance = Arc::new(counter());
        let session = instance.session().unwrap();
        let waiter = {
            let instance = Arc::clone(&instance);
            thread::spawn(move || instance.call_export("bump", &[Val::I32(2)]))
        };
        thread::sleep(std::time::Duration::from_millis(50));
        assert!(!waiter.is_finished());
        drop(session);
        let results = waiter.join().unwrap().unwrap();
        assert_eq!(results[0].unwrap_i32(), 2);
    }

    #[test]
    fn test_program_mode_requires_start() {
        let image = CompiledImage::compile(COUNTER.as_bytes(), None).unwrap();
        match GuestInstance::program(&image, &RuntimeConfig::default()) {
            Err(BridgeError::MissingExport(name)) => assert_eq!(name, "_start"),
            other => panic!("expected MissingExport, got {:?}", other),
        }
    }

    #[test]
    fn test_library_instance_cannot_run_program() {
        let instance = counter();
        assert!(matches!(
            instance.run_program(&[]),
            Err(BridgeError::CallFailed { .. })
        ));
    }
}
