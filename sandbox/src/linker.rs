//! Host function registration via the Wasmtime linker.
//!
//! Registers the WASI preview1 shim and the nine `env` callbacks of the
//! guest library's client I/O and diagnostics layer. Each callback:
//! 1. Resolves the client id to a stream table entry
//! 2. Validates pointer/length arguments against linear memory
//! 3. Performs the operation on the host stream
//! 4. Returns the value the C calling convention expects (-1 on failure)

use std::io::{self, ErrorKind};

use anyhow::anyhow;
use wasmtime::{Caller, Extern, Linker, Memory, TypedFunc, WasmParams, WasmResults};

use tiffbridge_hostapi::{
    GuestDiagnostic, GuestStream, StreamId, Whence, CALLBACK_FAILED, CALLBACK_FAILED_64,
};

use crate::abi::{self, ENV_MODULE};
use crate::error::Result;
use crate::host_impl::HostState;
use crate::memory::{self, guest_ptr};

/// Get the guest's exported memory from a Caller.
fn get_memory(caller: &mut Caller<'_, HostState>) -> Option<Memory> {
    caller.get_export(abi::MEMORY).and_then(Extern::into_memory)
}

/// Register the system interface and every `env` callback with the linker.
pub fn register_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
    wasmtime_wasi::preview1::add_to_linker_sync(linker, |state: &mut HostState| &mut state.wasi)?;
    register_read_proc(linker)?;
    register_write_proc(linker)?;
    register_seek_proc(linker)?;
    register_close_proc(linker)?;
    register_size_proc(linker)?;
    register_map_proc(linker)?;
    register_unmap_proc(linker)?;
    register_error_handler(linker)?;
    register_warning_handler(linker)?;
    Ok(())
}

// ── Stream I/O ──

fn register_read_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::READ_PROC,
        |mut caller: Caller<'_, HostState>, client: i32, buf: i32, size: i32| -> i32 {
            let Some(id) = StreamId::from_guest(client) else {
                return CALLBACK_FAILED;
            };
            let Some(mem) = get_memory(&mut caller) else {
                return CALLBACK_FAILED;
            };
            let Ok(len) = u64::try_from(size) else {
                return CALLBACK_FAILED;
            };

            let (data, state) = mem.data_and_store_mut(&mut caller);
            let range = match memory::check_range(data.len(), guest_ptr(buf), len) {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(%id, error = %e, "read callback with bad buffer");
                    return CALLBACK_FAILED;
                }
            };
            let dst = &mut data[range];

            match state.streams.with_stream(id, |s| read_full(s, dst)) {
                Ok(n) => {
                    if state.debug {
                        tracing::debug!(%id, requested = len, read = n, "read callback");
                    }
                    n as i32
                }
                Err(e) => {
                    tracing::debug!(%id, error = %e, "read callback failed");
                    CALLBACK_FAILED
                }
            }
        },
    )?;
    Ok(())
}

fn register_write_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::WRITE_PROC,
        |mut caller: Caller<'_, HostState>, client: i32, buf: i32, size: i32| -> i32 {
            let Some(id) = StreamId::from_guest(client) else {
                return CALLBACK_FAILED;
            };
            let Some(mem) = get_memory(&mut caller) else {
                return CALLBACK_FAILED;
            };
            let Ok(len) = u64::try_from(size) else {
                return CALLBACK_FAILED;
            };

            let (data, state) = mem.data_and_store_mut(&mut caller);
            let src = match memory::slice(data, guest_ptr(buf), len) {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(%id, error = %e, "write callback with bad buffer");
                    return CALLBACK_FAILED;
                }
            };

            match state.streams.with_stream(id, |s| write_full(s, src)) {
                Ok(n) => {
                    if state.debug {
                        tracing::debug!(%id, written = n, "write callback");
                    }
                    n as i32
                }
                Err(e) => {
                    tracing::debug!(%id, error = %e, "write callback failed");
                    CALLBACK_FAILED
                }
            }
        },
    )?;
    Ok(())
}

fn register_seek_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::SEEK_PROC,
        |caller: Caller<'_, HostState>, client: i32, offset: i64, whence: i32| -> i64 {
            let Some(id) = StreamId::from_guest(client) else {
                return CALLBACK_FAILED_64;
            };
            let Some(pos) = Whence::from_raw(whence).and_then(|w| w.to_seek_from(offset)) else {
                return CALLBACK_FAILED_64;
            };
            let state = caller.data();
            match state.streams.with_stream(id, |s| s.seek(pos)) {
                Ok(p) => {
                    if state.debug {
                        tracing::debug!(%id, ?pos, position = p, "seek callback");
                    }
                    i64::try_from(p).unwrap_or(CALLBACK_FAILED_64)
                }
                Err(e) => {
                    tracing::debug!(%id, error = %e, "seek callback failed");
                    CALLBACK_FAILED_64
                }
            }
        },
    )?;
    Ok(())
}

fn register_close_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::CLOSE_PROC,
        |caller: Caller<'_, HostState>, client: i32| -> i32 {
            let Some(id) = StreamId::from_guest(client) else {
                return CALLBACK_FAILED;
            };
            match caller.data().streams.close_stream(id) {
                Ok(()) => 0,
                Err(e) => {
                    tracing::warn!(%id, error = %e, "closing host stream failed");
                    CALLBACK_FAILED
                }
            }
        },
    )?;
    Ok(())
}

fn register_size_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::SIZE_PROC,
        |caller: Caller<'_, HostState>, client: i32| -> i64 {
            let Some(id) = StreamId::from_guest(client) else {
                return CALLBACK_FAILED_64;
            };
            match caller.data().streams.with_stream(id, |s| s.size()) {
                Ok(n) => i64::try_from(n).unwrap_or(CALLBACK_FAILED_64),
                Err(e) => {
                    tracing::debug!(%id, error = %e, "size callback failed");
                    CALLBACK_FAILED_64
                }
            }
        },
    )?;
    Ok(())
}

// ── Memory mapping (unsupported; the guest falls back to reads) ──

fn register_map_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::MAP_PROC,
        |_caller: Caller<'_, HostState>, _client: i32, _base_out: i32, _size_out: i32| -> i32 { 0 },
    )?;
    Ok(())
}

fn register_unmap_proc(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::UNMAP_PROC,
        |_caller: Caller<'_, HostState>, _client: i32, _base: i32, _size: i64| {},
    )?;
    Ok(())
}

// ── Diagnostics ──

fn register_error_handler(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::ERROR_HANDLER,
        |mut caller: Caller<'_, HostState>,
         _tif: i32,
         user_data: i32,
         module: i32,
         fmt: i32,
         va: i32|
         -> i32 {
            let diag = format_diagnostic(&mut caller, module, fmt, va);
            if caller.data().debug {
                tracing::debug!(%diag, user_data, "guest error");
            }
            caller.data().record_error(user_data, diag);
            1
        },
    )?;
    Ok(())
}

fn register_warning_handler(linker: &mut Linker<HostState>) -> Result<()> {
    linker.func_wrap(
        ENV_MODULE,
        abi::WARNING_HANDLER,
        |mut caller: Caller<'_, HostState>,
         _tif: i32,
         user_data: i32,
         module: i32,
         fmt: i32,
         va: i32|
         -> i32 {
            let diag = format_diagnostic(&mut caller, module, fmt, va);
            caller.data().record_warning(user_data, diag);
            1
        },
    )?;
    Ok(())
}

/// Build a diagnostic from the handler arguments.
///
/// The message is formatted by the guest's own `vsnprintf` so every printf
/// conversion it supports works. If formatting fails the raw format string
/// is used instead.
fn format_diagnostic(
    caller: &mut Caller<'_, HostState>,
    module: i32,
    fmt: i32,
    va: i32,
) -> GuestDiagnostic {
    let Some(mem) = get_memory(caller) else {
        return GuestDiagnostic::new("", "guest memory unavailable");
    };
    let module_name = if module == 0 {
        String::new()
    } else {
        memory::read_cstring(mem.data(&*caller), guest_ptr(module))
    };
    let message = match guest_vformat(caller, mem, fmt, va) {
        Ok(text) => text,
        Err(e) => {
            tracing::trace!(error = %e, "using unformatted diagnostic");
            memory::read_cstring(mem.data(&*caller), guest_ptr(fmt))
        }
    };
    GuestDiagnostic::new(module_name, message)
}

fn guest_vformat(
    caller: &mut Caller<'_, HostState>,
    mem: Memory,
    fmt: i32,
    va: i32,
) -> anyhow::Result<String> {
    let malloc = typed_export::<i32, i32>(caller, abi::MALLOC)?;
    let free = typed_export::<i32, ()>(caller, abi::FREE)?;
    let vsnprintf = typed_export::<(i32, i32, i32, i32), i32>(caller, abi::VSNPRINTF)?;

    let buf = malloc.call(&mut *caller, abi::DIAGNOSTIC_BUFFER_LEN)?;
    if buf == 0 {
        return Err(anyhow!("no guest memory for a diagnostic buffer"));
    }
    let formatted = match vsnprintf.call(&mut *caller, (buf, abi::DIAGNOSTIC_BUFFER_LEN, fmt, va)) {
        Ok(n) if n >= 0 => Ok(memory::read_cstring(mem.data(&*caller), guest_ptr(buf))),
        Ok(n) => Err(anyhow!("vsnprintf returned {}", n)),
        Err(e) => Err(e),
    };
    if let Err(e) = free.call(&mut *caller, buf) {
        tracing::warn!(error = %e, "freeing diagnostic buffer failed");
    }
    formatted
}

/// Look up a typed function export from inside a callback.
fn typed_export<P: WasmParams, R: WasmResults>(
    caller: &mut Caller<'_, HostState>,
    name: &str,
) -> anyhow::Result<TypedFunc<P, R>> {
    let func = caller
        .get_export(name)
        .and_then(Extern::into_func)
        .ok_or_else(|| anyhow!("missing export {}", name))?;
    func.typed::<P, R>(&*caller)
}

/// Read until `buf` is full or the stream reports end of file.
fn read_full(stream: &mut dyn GuestStream, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Write all of `buf`, stopping early only if the stream accepts nothing.
fn write_full(stream: &mut dyn GuestStream, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => break,
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}
