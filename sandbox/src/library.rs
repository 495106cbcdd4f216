//! Library-mode entry point: one guest instance, many open files.

use std::sync::Arc;

use tiffbridge_hostapi::{GuestStream, OpenLimits, StreamId};
use wasmtime::Val;

use crate::abi::{self, GuestHandle};
use crate::cache::CompiledImage;
use crate::config::RuntimeConfig;
use crate::error::{BridgeError, CloseError, Result};
use crate::file::TiffFile;
use crate::introspect::{self, Codec};
use crate::memory::GuestPtr;
use crate::runtime::GuestInstance;
use crate::session::Session;

/// A library-mode guest instance.
///
/// Cloning is cheap and shares the instance. Files opened from one library
/// share its call guard; use separate libraries to decode in parallel.
#[derive(Debug, Clone)]
pub struct TiffLibrary {
    instance: Arc<GuestInstance>,
}

impl TiffLibrary {
    /// Compile `wasm` (through the config's cache, if any) and instantiate it.
    pub fn new(wasm: &[u8], config: RuntimeConfig) -> Result<Self> {
        let image = CompiledImage::compile(wasm, config.compilation_cache.as_ref())?;
        Self::from_image(&image, &config)
    }

    /// Instantiate an already compiled image.
    pub fn from_image(image: &CompiledImage, config: &RuntimeConfig) -> Result<Self> {
        let instance = GuestInstance::library(image, config)?;
        Ok(Self {
            instance: Arc::new(instance),
        })
    }

    pub fn instance(&self) -> &Arc<GuestInstance> {
        &self.instance
    }

    /// Open `path` through the guest's own file layer. The path is resolved
    /// against the directories mounted in the config.
    pub fn open(&self, path: &str, mode: &str) -> Result<TiffFile> {
        self.open_entry(path, mode, None)
    }

    /// Open a file whose bytes live in a host stream. `name` only appears in
    /// diagnostics.
    pub fn open_stream(
        &self,
        name: &str,
        mode: &str,
        stream: impl GuestStream + 'static,
    ) -> Result<TiffFile> {
        self.open_entry(name, mode, Some(Box::new(stream)))
    }

    fn open_entry(
        &self,
        name: &str,
        mode: &str,
        stream: Option<Box<dyn GuestStream>>,
    ) -> Result<TiffFile> {
        let streams = self.instance.streams();
        let client = stream.is_some();
        let entry = streams.register(stream);

        let opened = self
            .instance
            .session()
            .and_then(|mut session| open_handle(&mut session, entry, name, mode, client, &self.instance.config().limits));

        match opened {
            Ok(Some(handle)) => {
                tracing::debug!(name, mode, %entry, "opened file");
                Ok(TiffFile::new(Arc::clone(&self.instance), handle, entry, name.to_owned()))
            }
            Ok(None) => {
                let err = match streams.take_error(entry) {
                    Some(diag) => BridgeError::Guest(diag),
                    None => BridgeError::call_failed(
                        if client { abi::CLIENT_OPEN } else { abi::OPEN },
                        format!("could not open {:?} in mode {:?}", name, mode),
                    ),
                };
                discard_entry(self, entry);
                Err(err)
            }
            Err(e) => {
                discard_entry(self, entry);
                Err(e)
            }
        }
    }

    /// Version banner of the guest library.
    pub fn version(&self) -> Result<String> {
        let mut session = self.instance.session()?;
        let ptr = session.call_i32(abi::GET_VERSION, &[])?;
        if ptr == 0 {
            return Err(BridgeError::call_failed(abi::GET_VERSION, "null version string"));
        }
        session.read_cstring(ptr as GuestPtr)
    }

    /// Size in bytes of one value of the on-disk data type `data_type`.
    pub fn data_width(&self, data_type: u16) -> Result<u32> {
        let width = self
            .instance
            .call_export(abi::DATA_WIDTH, &[Val::I32(i32::from(data_type))])?;
        match width.first().and_then(Val::i32) {
            Some(0) => Err(BridgeError::call_failed(
                abi::DATA_WIDTH,
                format!("unknown data type {}", data_type),
            )),
            Some(w) => Ok(w as u32),
            None => Err(BridgeError::call_failed(abi::DATA_WIDTH, "expected one i32 result")),
        }
    }

    /// Compression schemes the guest library was built with.
    pub fn configured_codecs(&self) -> Result<Vec<Codec>> {
        let mut session = self.instance.session()?;
        introspect::configured_codecs(&mut session)
    }

    /// Close the instance. Files still open become unusable.
    pub fn close(&self) -> std::result::Result<(), CloseError> {
        self.instance.close()
    }
}

/// Run the open sequence inside one session. The open options are freed on
/// every path.
fn open_handle(
    session: &mut Session<'_>,
    entry: StreamId,
    name: &str,
    mode: &str,
    client: bool,
    limits: &OpenLimits,
) -> Result<Option<GuestHandle>> {
    let opts = session.call_i32(abi::OPEN_OPTIONS_ALLOC, &[])?;
    if opts == 0 {
        return Err(BridgeError::Allocation {
            size: 0,
            reason: "guest could not allocate open options".into(),
        });
    }

    let opened = configure_and_open(session, opts, entry, name, mode, client, limits);
    let freed = session.call_unit(abi::OPEN_OPTIONS_FREE, &[Val::I32(opts)]);
    match (opened, freed) {
        (Ok(handle), Ok(())) => Ok(GuestHandle::from_raw(handle)),
        (Err(e), _) => Err(e),
        (Ok(handle), Err(e)) => {
            if handle != 0 {
                // The handle is live even though the options leaked.
                tracing::warn!(error = %e, "freeing open options");
                Ok(GuestHandle::from_raw(handle))
            } else {
                Err(e)
            }
        }
    }
}

fn configure_and_open(
    session: &mut Session<'_>,
    opts: i32,
    entry: StreamId,
    name: &str,
    mode: &str,
    client: bool,
    limits: &OpenLimits,
) -> Result<i32> {
    if let Some(max) = limits.max_single_alloc {
        session.call_unit(abi::OPEN_OPTIONS_MAX_SINGLE, &[Val::I32(opts), Val::I64(clamp_i64(max))])?;
    }
    if let Some(max) = limits.max_cumulative_alloc {
        session.call_unit(
            abi::OPEN_OPTIONS_MAX_CUMULATED,
            &[Val::I32(opts), Val::I64(clamp_i64(max))],
        )?;
    }
    session.call_unit(abi::OPEN_OPTIONS_HOST_HANDLERS, &[Val::I32(opts), Val::I32(entry.to_guest())])?;

    session.with_cstring(name, |s, name_ptr| {
        s.with_cstring(mode, |s, mode_ptr| {
            if client {
                s.call_i32(
                    abi::CLIENT_OPEN,
                    &[
                        Val::I32(name_ptr as i32),
                        Val::I32(mode_ptr as i32),
                        Val::I32(entry.to_guest()),
                        Val::I32(opts),
                    ],
                )
            } else {
                s.call_i32(
                    abi::OPEN,
                    &[Val::I32(name_ptr as i32), Val::I32(mode_ptr as i32), Val::I32(opts)],
                )
            }
        })
    })
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn discard_entry(library: &TiffLibrary, entry: StreamId) {
    if let Err(e) = library.instance.streams().remove(entry) {
        tracing::warn!(%entry, error = %e, "discarding stream entry after failed open");
    }
}
