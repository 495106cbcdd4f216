//! Guarded access to one guest instance: calls and memory marshaling.
//!
//! A `Session` owns the instance's call guard for as long as it lives. Every
//! export call and every read or write of guest memory goes through it, so a
//! multi-step exchange (allocate, call, decode, free) cannot interleave with
//! another thread's calls on the same instance.
//!
//! Guest pointers obtained from [`Session::allocate`] must be released exactly
//! once. [`Session::with_allocation`] and [`Session::with_cstring`] do that
//! on every exit path.
//!
//! Warning handlers registered on the instance's files run when the session
//! is dropped, after the guard is unlocked, so a handler may call back into
//! the file that warned.

use std::sync::MutexGuard;

use wasmtime::Val;

use crate::abi;
use crate::error::{BridgeError, Result};
use crate::memory::{self, GuestPtr};
use crate::runtime::{GuestInstance, Live, Slot};

/// Exclusive access to a guest instance.
pub struct Session<'a> {
    instance: &'a GuestInstance,
    slot: Option<MutexGuard<'a, Slot>>,
    fuel: Option<u64>,
    debug: bool,
}

impl<'a> Session<'a> {
    pub(crate) fn new(instance: &'a GuestInstance, slot: MutexGuard<'a, Slot>) -> Self {
        Self {
            instance,
            slot: Some(slot),
            fuel: instance.config().fuel_limit,
            debug: instance.config().debug,
        }
    }

    fn live(&self) -> Result<&Live> {
        self.slot
            .as_ref()
            .and_then(|slot| slot.live.as_ref())
            .ok_or(BridgeError::Closed("instance"))
    }

    fn live_mut(&mut self) -> Result<&mut Live> {
        self.slot
            .as_mut()
            .and_then(|slot| slot.live.as_mut())
            .ok_or(BridgeError::Closed("instance"))
    }

    fn memory(&self) -> Result<&[u8]> {
        let live = self.live()?;
        Ok(live.memory.data(&live.store))
    }

    fn memory_mut(&mut self) -> Result<&mut [u8]> {
        let live = self.live_mut()?;
        Ok(live.memory.data_mut(&mut live.store))
    }

    // ── Calls ──

    /// Invoke an export and return its raw results.
    pub fn call(&mut self, name: &str, args: &[Val]) -> Result<Vec<Val>> {
        let (fuel, debug) = (self.fuel, self.debug);
        self.live_mut()?.call(name, args, fuel, debug)
    }

    /// Invoke an export that returns a single i32.
    pub fn call_i32(&mut self, name: &str, args: &[Val]) -> Result<i32> {
        let results = self.call(name, args)?;
        match results.first() {
            Some(Val::I32(v)) => Ok(*v),
            _ => Err(BridgeError::call_failed(
                name,
                format!("expected one i32 result, got {:?}", results),
            )),
        }
    }

    /// Invoke an export and ignore its results.
    pub fn call_unit(&mut self, name: &str, args: &[Val]) -> Result<()> {
        self.call(name, args).map(|_| ())
    }

    // ── Allocation ──

    /// Allocate `size` bytes on the guest heap and zero them.
    pub fn allocate(&mut self, size: u64) -> Result<GuestPtr> {
        let raw = i32::try_from(size).map_err(|_| BridgeError::Allocation {
            size,
            reason: "exceeds the guest address space".into(),
        })?;
        let ptr = memory::guest_ptr(self.call_i32(abi::MALLOC, &[Val::I32(raw)])?);
        if ptr == 0 {
            return Err(BridgeError::Allocation {
                size,
                reason: "guest allocator returned null".into(),
            });
        }

        let zeroed = self
            .memory_mut()
            .and_then(|mem| memory::zero(mem, ptr, size));
        if let Err(e) = zeroed {
            if let Err(free_err) = self.release(ptr) {
                tracing::warn!(ptr, error = %free_err, "releasing unusable allocation failed");
            }
            return Err(BridgeError::Allocation {
                size,
                reason: format!("zero-fill rejected: {}", e),
            });
        }
        Ok(ptr)
    }

    /// Free a pointer obtained from [`allocate`](Self::allocate).
    pub fn release(&mut self, ptr: GuestPtr) -> Result<()> {
        self.call_unit(abi::FREE, &[Val::I32(ptr as i32)])
    }

    /// Allocate `size` bytes, run `f`, and free the buffer whatever `f` returns.
    ///
    /// If both `f` and the release fail, the error from `f` wins.
    pub fn with_allocation<R>(
        &mut self,
        size: u64,
        f: impl FnOnce(&mut Self, GuestPtr) -> Result<R>,
    ) -> Result<R> {
        let ptr = self.allocate(size)?;
        let result = f(self, ptr);
        let released = self.release(ptr);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(free_err)) => {
                tracing::warn!(ptr, error = %free_err, "release after failed operation also failed");
                Err(e)
            }
        }
    }

    // ── Strings ──

    /// Copy `text` into a fresh NUL-terminated guest buffer. The caller
    /// releases it.
    pub fn write_cstring(&mut self, text: &str) -> Result<GuestPtr> {
        if text.as_bytes().contains(&0) {
            return Err(BridgeError::call_failed(
                "write string",
                format!("{:?} contains a NUL byte", text),
            ));
        }
        let ptr = self.allocate(text.len() as u64 + 1)?;
        // The allocation is already zeroed, which supplies the terminator.
        if let Err(e) = self.write_buffer(ptr, text.as_bytes()) {
            if let Err(free_err) = self.release(ptr) {
                tracing::warn!(ptr, error = %free_err, "releasing string buffer failed");
            }
            return Err(e);
        }
        Ok(ptr)
    }

    /// Run `f` with `text` available as a guest C string, then free it.
    pub fn with_cstring<R>(
        &mut self,
        text: &str,
        f: impl FnOnce(&mut Self, GuestPtr) -> Result<R>,
    ) -> Result<R> {
        let ptr = self.write_cstring(text)?;
        let result = f(self, ptr);
        let released = self.release(ptr);
        match (result, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
            (Err(e), Err(free_err)) => {
                tracing::warn!(ptr, error = %free_err, "releasing string buffer failed");
                Err(e)
            }
        }
    }

    /// Read a NUL-terminated string. A string running off the end of memory
    /// yields what was read so far.
    pub fn read_cstring(&self, ptr: GuestPtr) -> Result<String> {
        Ok(memory::read_cstring(self.memory()?, ptr))
    }

    // ── Buffers and scalars ──

    pub fn read_buffer(&self, ptr: GuestPtr, len: u64) -> Result<Vec<u8>> {
        memory::read_bytes(self.memory()?, ptr, len)
    }

    pub fn write_buffer(&mut self, ptr: GuestPtr, bytes: &[u8]) -> Result<()> {
        memory::write_bytes(self.memory_mut()?, ptr, bytes)
    }

    /// Borrow guest memory directly. Valid until the next call through this session.
    pub(crate) fn view(&self, ptr: GuestPtr, len: u64) -> Result<&[u8]> {
        memory::slice(self.memory()?, ptr, len)
    }

    pub fn read_u16(&self, ptr: GuestPtr) -> Result<u16> {
        memory::read_u16(self.memory()?, ptr)
    }

    pub fn read_u32(&self, ptr: GuestPtr) -> Result<u32> {
        memory::read_u32(self.memory()?, ptr)
    }

    pub fn read_i32(&self, ptr: GuestPtr) -> Result<i32> {
        memory::read_i32(self.memory()?, ptr)
    }

    pub fn read_f32(&self, ptr: GuestPtr) -> Result<f32> {
        memory::read_f32(self.memory()?, ptr)
    }

    pub fn read_f64(&self, ptr: GuestPtr) -> Result<f64> {
        memory::read_f64(self.memory()?, ptr)
    }

    /// Current size of guest linear memory in bytes.
    pub fn memory_size(&self) -> Result<u64> {
        Ok(self.memory()?.len() as u64)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        self.instance.release_owner();
        drop(self.slot.take());
        self.instance.streams().deliver_warnings();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CompiledImage;
    use crate::config::RuntimeConfig;
    use crate::runtime::GuestInstance;

    /// Bump allocator that records how many frees it saw.
    const BUMP: &str = r#"
        (module
            (memory (export "memory") 1 4)
            (global $heap (mut i32) (i32.const 1024))
            (global $frees (mut i32) (i32.const 0))
            (data (i32.const 16) "dirty\ff\ff\ff")
            (func (export "malloc") (param $n i32) (result i32)
                (local $p i32)
                (if (i32.gt_u (local.get $n) (i32.const 32768)) (then (return (i32.const 0))))
                (local.set $p (global.get $heap))
                (memory.fill (local.get $p) (i32.const 0xAB) (local.get $n))
                (global.set $heap (i32.and
                    (i32.add (i32.add (local.get $p) (local.get $n)) (i32.const 15))
                    (i32.const -8)))
                (local.get $p))
            (func (export "free") (param i32)
                (global.set $frees (i32.add (global.get $frees) (i32.const 1))))
            (func (export "frees") (result i32) (global.get $frees))
            (func (export "edge") (result i32) (i32.const 65532)))
    "#;

    fn bump() -> GuestInstance {
        let image = CompiledImage::compile(BUMP.as_bytes(), None).unwrap();
        GuestInstance::library(&image, &RuntimeConfig::default()).unwrap()
    }

    #[test]
    fn test_allocate_returns_zeroed_memory() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        for n in [0u64, 1, 4, 4096] {
            let ptr = session.allocate(n).unwrap();
            assert_eq!(session.read_buffer(ptr, n).unwrap(), vec![0u8; n as usize]);
            session.release(ptr).unwrap();
        }
    }

    #[test]
    fn test_allocate_null_is_allocation_error() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        match session.allocate(100_000) {
            Err(BridgeError::Allocation { size, reason }) => {
                assert_eq!(size, 100_000);
                assert!(reason.contains("null"));
            }
            other => panic!("expected Allocation error, got {:?}", other),
        }
        // still usable for a smaller request
        assert!(session.allocate(16).is_ok());
    }

    #[test]
    fn test_allocate_rejects_sizes_beyond_address_space() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        assert!(matches!(
            session.allocate(u64::from(u32::MAX) + 1),
            Err(BridgeError::Allocation { .. })
        ));
    }

    #[test]
    fn test_with_allocation_releases_on_error() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        let result: Result<()> = session.with_allocation(8, |_, _| {
            Err(BridgeError::call_failed("test", "forced"))
        });
        assert!(matches!(result, Err(BridgeError::CallFailed { .. })));

        let value = session.with_allocation(8, |s, ptr| s.read_u32(ptr)).unwrap();
        assert_eq!(value, 0);
        assert_eq!(session.call_i32("frees", &[]).unwrap(), 2);
    }

    #[test]
    fn test_cstring_round_trip() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        let text = session
            .with_cstring("Photoshop 3.0", |s, ptr| s.read_cstring(ptr))
            .unwrap();
        assert_eq!(text, "Photoshop 3.0");
        assert_eq!(session.call_i32("frees", &[]).unwrap(), 1);
    }

    #[test]
    fn test_cstring_with_nul_is_rejected() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        assert!(session.write_cstring("a\0b").is_err());
        assert_eq!(session.call_i32("frees", &[]).unwrap(), 0);
    }

    #[test]
    fn test_buffer_access_out_of_bounds() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        let edge = memory::guest_ptr(session.call_i32("edge", &[]).unwrap());
        assert!(session.read_buffer(edge, 4).is_ok());
        match session.read_buffer(edge, 8) {
            Err(BridgeError::MemoryAccess { memory_size, .. }) => assert_eq!(memory_size, 65536),
            other => panic!("expected MemoryAccess, got {:?}", other),
        }
        assert!(session.write_buffer(edge + 2, &[1, 2, 3]).is_err());
    }

    #[test]
    fn test_scalar_reads() {
        let instance = bump();
        let mut session = instance.session().unwrap();
        session.write_buffer(2048, &7u16.to_le_bytes()).unwrap();
        session.write_buffer(2056, &2.5f32.to_le_bytes()).unwrap();
        session.write_buffer(2064, &(-1.25f64).to_le_bytes()).unwrap();
        assert_eq!(session.read_u16(2048).unwrap(), 7);
        assert_eq!(session.read_f32(2056).unwrap(), 2.5);
        assert_eq!(session.read_f64(2064).unwrap(), -1.25);
        assert_eq!(session.memory_size().unwrap(), 65536);
    }
}
