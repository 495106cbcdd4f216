//! Bounds-checked guest linear memory helpers.
//!
//! All functions take the memory as a plain slice and validate the pointer
//! and length against its current size before touching it. A failed check
//! is a `MemoryAccess` error, never a panic.

use std::ops::Range;

use crate::error::{BridgeError, Result};

/// An offset into guest linear memory (wasm32).
pub type GuestPtr = u32;

/// Reinterpret a raw i32 argument from the guest as a pointer.
pub fn guest_ptr(raw: i32) -> GuestPtr {
    raw as u32
}

/// Validate `[ptr, ptr+len)` against a memory of `mem_len` bytes.
pub fn check_range(mem_len: usize, ptr: GuestPtr, len: u64) -> Result<Range<usize>> {
    let fault = || BridgeError::MemoryAccess {
        ptr,
        len,
        memory_size: mem_len as u64,
    };
    let start = ptr as usize;
    let len = usize::try_from(len).map_err(|_| fault())?;
    let end = start.checked_add(len).ok_or_else(fault)?;
    if end > mem_len {
        return Err(fault());
    }
    Ok(start..end)
}

/// Borrow `len` bytes of guest memory at `ptr`.
pub fn slice(mem: &[u8], ptr: GuestPtr, len: u64) -> Result<&[u8]> {
    let range = check_range(mem.len(), ptr, len)?;
    Ok(&mem[range])
}

/// Copy `len` bytes of guest memory at `ptr`.
pub fn read_bytes(mem: &[u8], ptr: GuestPtr, len: u64) -> Result<Vec<u8>> {
    slice(mem, ptr, len).map(<[u8]>::to_vec)
}

/// Write `data` into guest memory at `ptr`.
pub fn write_bytes(mem: &mut [u8], ptr: GuestPtr, data: &[u8]) -> Result<()> {
    let range = check_range(mem.len(), ptr, data.len() as u64)?;
    mem[range].copy_from_slice(data);
    Ok(())
}

/// Zero `len` bytes of guest memory at `ptr`.
pub fn zero(mem: &mut [u8], ptr: GuestPtr, len: u64) -> Result<()> {
    let range = check_range(mem.len(), ptr, len)?;
    mem[range].fill(0);
    Ok(())
}

fn read_array<const N: usize>(mem: &[u8], ptr: GuestPtr) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    out.copy_from_slice(slice(mem, ptr, N as u64)?);
    Ok(out)
}

pub fn read_u16(mem: &[u8], ptr: GuestPtr) -> Result<u16> {
    read_array(mem, ptr).map(u16::from_le_bytes)
}

pub fn read_u32(mem: &[u8], ptr: GuestPtr) -> Result<u32> {
    read_array(mem, ptr).map(u32::from_le_bytes)
}

pub fn read_i32(mem: &[u8], ptr: GuestPtr) -> Result<i32> {
    read_array(mem, ptr).map(i32::from_le_bytes)
}

pub fn read_f32(mem: &[u8], ptr: GuestPtr) -> Result<f32> {
    read_array(mem, ptr).map(f32::from_le_bytes)
}

pub fn read_f64(mem: &[u8], ptr: GuestPtr) -> Result<f64> {
    read_array(mem, ptr).map(f64::from_le_bytes)
}

pub fn write_u32(mem: &mut [u8], ptr: GuestPtr, value: u32) -> Result<()> {
    write_bytes(mem, ptr, &value.to_le_bytes())
}

/// Read a NUL-terminated string starting at `ptr`.
///
/// Stops at the first NUL or at the end of memory, whichever comes first. A
/// string running off the end of memory yields what was read so far. Invalid
/// UTF-8 is replaced, not rejected.
pub fn read_cstring(mem: &[u8], ptr: GuestPtr) -> String {
    let tail = mem.get(ptr as usize..).unwrap_or(&[]);
    let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end]).into_owned()
}
