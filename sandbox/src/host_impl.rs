//! Per-instance state held in the Wasmtime `Store`.
//!
//! `HostState` combines the WASI preview1 context, the stream table shared
//! with the owning instance, and the store resource limits into one struct
//! that lives inside `Store<HostState>` for the lifetime of the module handle.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::SeedableRng;
use wasmtime::{StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::{DirPerms, FilePerms, WasiCtxBuilder};

use tiffbridge_hostapi::{GuestDiagnostic, StreamId, StreamTable};

use crate::config::{OutputTarget, RandomSource, RuntimeConfig};
use crate::error::{BridgeError, Result};

/// Mutable state of one module handle.
pub struct HostState {
    /// WASI preview1 context backing the system interface imports.
    pub wasi: WasiP1Ctx,
    /// Resources reachable from the guest's client I/O and diagnostic callbacks.
    pub streams: Arc<StreamTable>,
    /// Linear memory growth limits.
    pub limits: StoreLimits,
    /// Trace every callback at debug level.
    pub debug: bool,
}

impl HostState {
    /// Build the state for a new module handle.
    ///
    /// `args` becomes the guest's argv; library instances pass an empty slice.
    pub fn new(config: &RuntimeConfig, streams: Arc<StreamTable>, args: &[String]) -> Result<Self> {
        let mut limits = StoreLimitsBuilder::new();
        if let Some(bytes) = config.max_memory_bytes {
            limits = limits.memory_size(bytes);
        }
        Ok(Self {
            wasi: build_wasi(config, args)?,
            streams,
            limits: limits.build(),
            debug: config.debug,
        })
    }

    /// Route an error reported by the guest to the resource `user_data` names.
    pub fn record_error(&self, user_data: i32, diag: GuestDiagnostic) {
        match StreamId::from_guest(user_data) {
            Some(id) => {
                if let Err(e) = self.streams.record_error(id, diag.clone()) {
                    tracing::warn!(error = %e, %diag, "guest error for unregistered resource");
                }
            }
            None => tracing::warn!(%diag, "guest error without a resource"),
        }
    }

    /// Route a warning reported by the guest to the resource `user_data` names.
    pub fn record_warning(&self, user_data: i32, diag: GuestDiagnostic) {
        tracing::warn!(module = %diag.module, message = %diag.message, "guest warning");
        if let Some(id) = StreamId::from_guest(user_data) {
            if let Err(e) = self.streams.record_warning(id, diag) {
                tracing::warn!(error = %e, "guest warning for unregistered resource");
            }
        }
    }
}

/// Configure the WASI context from the runtime capabilities.
fn build_wasi(config: &RuntimeConfig, args: &[String]) -> Result<WasiP1Ctx> {
    let mut builder = WasiCtxBuilder::new();
    builder.args(args);

    match &config.stdout {
        OutputTarget::Discard => {}
        OutputTarget::Inherit => {
            builder.inherit_stdout();
        }
        OutputTarget::Capture(capture) => {
            builder.stdout(capture.pipe());
        }
    }
    match &config.stderr {
        OutputTarget::Discard => {}
        OutputTarget::Inherit => {
            builder.inherit_stderr();
        }
        OutputTarget::Capture(capture) => {
            builder.stderr(capture.pipe());
        }
    }

    if let RandomSource::Seeded(seed) = config.random {
        builder.secure_random(StdRng::seed_from_u64(seed));
        builder.insecure_random(StdRng::seed_from_u64(seed.wrapping_add(1)));
        builder.insecure_random_seed(u128::from(seed));
    }

    for mount in &config.filesystem.mounts {
        let (dir_perms, file_perms) = if mount.read_only {
            (DirPerms::READ, FilePerms::READ)
        } else {
            (DirPerms::all(), FilePerms::all())
        };
        builder
            .preopened_dir(&mount.host, &mount.guest, dir_perms, file_perms)
            .map_err(|e| {
                BridgeError::Instantiation(format!(
                    "cannot mount {} at {}: {:#}",
                    mount.host.display(),
                    mount.guest,
                    e
                ))
            })?;
    }

    Ok(builder.build_p1())
}
