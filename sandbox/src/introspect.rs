//! Library metadata that lives in guest structs: the configured codec table
//! and field descriptors.
//!
//! Both are decoded into owned values while the call guard is held. No guest
//! pointer escapes to the caller.

use wasmtime::Val;

use crate::abi;
use crate::error::{BridgeError, Result};
use crate::field::FieldTag;
use crate::memory::{self, GuestPtr};
use crate::session::Session;

/// One compression scheme the guest library was built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codec {
    pub name: String,
    /// Value of the Compression tag that selects this codec.
    pub scheme: u16,
}

/// How many values a field carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldCount {
    Fixed(u32),
    /// Any number of values, counted with a u16.
    Variable,
    /// One value per sample.
    SamplesPerPixel,
    /// Any number of values, counted with a u32.
    Variable2,
}

impl FieldCount {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            abi::COUNT_VARIABLE => Some(Self::Variable),
            abi::COUNT_SAMPLES_PER_PIXEL => Some(Self::SamplesPerPixel),
            abi::COUNT_VARIABLE2 => Some(Self::Variable2),
            n => u32::try_from(n).ok().map(Self::Fixed),
        }
    }
}

/// Snapshot of a guest field descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub tag: FieldTag,
    pub name: String,
    /// On-disk data type; see [`TiffLibrary::data_width`](crate::TiffLibrary::data_width).
    pub data_type: u16,
    pub read_count: FieldCount,
    pub write_count: FieldCount,
    /// Whether reading or writing the field takes an explicit count argument.
    pub pass_count: bool,
    /// True for tags the library met in a file but has no definition for.
    pub anonymous: bool,
    /// Bytes of one value as passed to the get and set calls.
    pub set_get_size: u32,
    /// Bytes of the count argument when `pass_count` is set.
    pub set_get_count_size: u32,
}

/// Walk the codec table the guest returns, then free it.
pub(crate) fn configured_codecs(session: &mut Session<'_>) -> Result<Vec<Codec>> {
    let raw = session.call_i32(abi::GET_CONFIGURED_CODECS, &[])?;
    if raw == 0 {
        return Err(BridgeError::call_failed(
            abi::GET_CONFIGURED_CODECS,
            "library returned no codec table",
        ));
    }
    let table = memory::guest_ptr(raw);
    let codecs = read_codec_table(session, table);
    let released = session.release(table);
    match (codecs, released) {
        (Ok(codecs), Ok(())) => Ok(codecs),
        (Ok(_), Err(e)) | (Err(e), Ok(())) => Err(e),
        (Err(e), Err(free_err)) => {
            tracing::warn!(ptr = table, error = %free_err, "releasing codec table failed");
            Err(e)
        }
    }
}

fn read_codec_table(session: &Session<'_>, table: GuestPtr) -> Result<Vec<Codec>> {
    let mut codecs = Vec::new();
    let mut entry = table;
    loop {
        let name = session.read_u32(entry)?;
        let scheme = session.read_u16(entry.saturating_add(4))?;
        if name == 0 && scheme == 0 {
            return Ok(codecs);
        }
        let name = if name == 0 {
            String::new()
        } else {
            session.read_cstring(name)?
        };
        codecs.push(Codec { name, scheme });
        entry = entry.checked_add(abi::CODEC_ENTRY_LEN).ok_or_else(|| {
            BridgeError::call_failed(abi::GET_CONFIGURED_CODECS, "codec table is not terminated")
        })?;
    }
}

/// Read every property of the descriptor at `field`.
pub(crate) fn describe_field(session: &mut Session<'_>, field: GuestPtr) -> Result<FieldInfo> {
    let name = match session.call_i32(abi::FIELD_NAME, &[Val::I32(field as i32)])? {
        0 => {
            return Err(BridgeError::call_failed(
                abi::FIELD_NAME,
                format!("descriptor at {:#x} has no name", field),
            ))
        }
        ptr => session.read_cstring(memory::guest_ptr(ptr))?,
    };
    let data_type = u16::try_from(accessor(session, abi::FIELD_DATA_TYPE, field)?).map_err(|_| {
        BridgeError::call_failed(abi::FIELD_DATA_TYPE, format!("out of range for {}", name))
    })?;

    Ok(FieldInfo {
        tag: FieldTag(accessor(session, abi::FIELD_TAG, field)? as u32),
        data_type,
        read_count: count(session, abi::FIELD_READ_COUNT, field)?,
        write_count: count(session, abi::FIELD_WRITE_COUNT, field)?,
        pass_count: abi::succeeded(accessor(session, abi::FIELD_PASS_COUNT, field)?),
        anonymous: abi::succeeded(accessor(session, abi::FIELD_IS_ANONYMOUS, field)?),
        set_get_size: accessor(session, abi::FIELD_SET_GET_SIZE, field)? as u32,
        set_get_count_size: accessor(session, abi::FIELD_SET_GET_COUNT_SIZE, field)? as u32,
        name,
    })
}

fn accessor(session: &mut Session<'_>, export: &str, field: GuestPtr) -> Result<i32> {
    session.call_i32(export, &[Val::I32(field as i32)])
}

fn count(session: &mut Session<'_>, export: &str, field: GuestPtr) -> Result<FieldCount> {
    let raw = accessor(session, export, field)?;
    FieldCount::from_raw(raw)
        .ok_or_else(|| BridgeError::call_failed(export, format!("unknown count {}", raw)))
}
