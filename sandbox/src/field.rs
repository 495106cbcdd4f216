//! Typed field access over the guest's tag getters and setters.
//!
//! Every tag belongs to one of a small closed set of shapes. A shape picks
//! the getter/setter export pair and the layout of the value in guest
//! memory:
//!
//! | shape     | getter out-args          | setter args         |
//! |-----------|--------------------------|---------------------|
//! | `U16`     | one `uint16*`            | value as i32        |
//! | `U32`     | one `uint32*`            | value as i32        |
//! | `Int`     | one `int*`               | value as i32        |
//! | `F32`     | one `float*`             | value as f32        |
//! | `F64`     | one `double*`            | value as f64        |
//! | `PairU16` | two `uint16*`            | two values as i32   |
//! | `Text`    | one `char**`             | pointer to C string |
//!
//! Getters return 0 when the tag is absent from the current directory *or*
//! present with another type; both become [`BridgeError::FieldNotDefined`].

use std::fmt;

use wasmtime::Val;

use crate::abi::{self, GuestHandle};
use crate::error::{BridgeError, Result};
use crate::memory::GuestPtr;
use crate::session::Session;

/// Numeric tag identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldTag(pub u32);

impl fmt::Display for FieldTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for FieldTag {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Layout of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldShape {
    U16,
    U32,
    Int,
    F32,
    F64,
    PairU16,
    Text,
}

/// Whether a getter falls back to the library's default for unset tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Explicit,
    Defaulted,
}

impl FieldShape {
    fn export_suffix(self) -> &'static str {
        match self {
            Self::U16 => "Uint16",
            Self::U32 => "Uint32",
            Self::Int => "Int",
            Self::F32 => "Float",
            Self::F64 => "Double",
            Self::PairU16 => "TwoUint16",
            Self::Text => "String",
        }
    }

    /// Name of the getter export for this shape.
    pub fn getter(self, lookup: Lookup) -> String {
        match lookup {
            Lookup::Explicit => format!("TIFFGetField{}", self.export_suffix()),
            Lookup::Defaulted => format!("TIFFGetFieldDefaulted{}", self.export_suffix()),
        }
    }

    /// Name of the setter export for this shape.
    pub fn setter(self) -> String {
        format!("TIFFSetField{}", self.export_suffix())
    }

    /// Bytes of guest memory a getter writes into.
    pub fn buffer_len(self) -> u64 {
        match self {
            Self::U16 => 2,
            Self::U32 | Self::Int | Self::F32 | Self::PairU16 | Self::Text => 4,
            Self::F64 => 8,
        }
    }
}

/// A decoded field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    U16(u16),
    U32(u32),
    Int(i32),
    F32(f32),
    F64(f64),
    PairU16(u16, u16),
    Text(String),
}

impl FieldValue {
    pub fn shape(&self) -> FieldShape {
        match self {
            Self::U16(_) => FieldShape::U16,
            Self::U32(_) => FieldShape::U32,
            Self::Int(_) => FieldShape::Int,
            Self::F32(_) => FieldShape::F32,
            Self::F64(_) => FieldShape::F64,
            Self::PairU16(..) => FieldShape::PairU16,
            Self::Text(_) => FieldShape::Text,
        }
    }

    /// Setter arguments after `(handle, tag)`, for every shape passed by value.
    fn scalar_args(&self) -> Vec<Val> {
        match self {
            Self::U16(v) => vec![Val::I32(i32::from(*v))],
            Self::U32(v) => vec![Val::I32(*v as i32)],
            Self::Int(v) => vec![Val::I32(*v)],
            Self::F32(v) => vec![Val::F32(v.to_bits())],
            Self::F64(v) => vec![Val::F64(v.to_bits())],
            Self::PairU16(a, b) => vec![Val::I32(i32::from(*a)), Val::I32(i32::from(*b))],
            Self::Text(_) => Vec::new(),
        }
    }
}

/// Rust types that map onto one field shape.
pub trait FieldType: Sized {
    const SHAPE: FieldShape;

    fn from_value(value: FieldValue) -> Option<Self>;

    fn into_value(self) -> FieldValue;
}

macro_rules! scalar_field_type {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl FieldType for $ty {
                const SHAPE: FieldShape = FieldShape::$variant;

                fn from_value(value: FieldValue) -> Option<Self> {
                    match value {
                        FieldValue::$variant(v) => Some(v),
                        _ => None,
                    }
                }

                fn into_value(self) -> FieldValue {
                    FieldValue::$variant(self)
                }
            }
        )*
    };
}

scalar_field_type! {
    u16 => U16,
    u32 => U32,
    i32 => Int,
    f32 => F32,
    f64 => F64,
    String => Text,
}

impl FieldType for (u16, u16) {
    const SHAPE: FieldShape = FieldShape::PairU16;

    fn from_value(value: FieldValue) -> Option<Self> {
        match value {
            FieldValue::PairU16(a, b) => Some((a, b)),
            _ => None,
        }
    }

    fn into_value(self) -> FieldValue {
        FieldValue::PairU16(self.0, self.1)
    }
}

/// Read `tag` as `shape` from the current directory of `handle`.
pub fn get_field(
    session: &mut Session<'_>,
    handle: GuestHandle,
    tag: FieldTag,
    shape: FieldShape,
    lookup: Lookup,
) -> Result<FieldValue> {
    let getter = shape.getter(lookup);
    session.with_allocation(shape.buffer_len(), |s, buf| {
        let mut args = vec![
            Val::I32(handle.raw()),
            Val::I32(tag.0 as i32),
            Val::I32(buf as i32),
        ];
        if shape == FieldShape::PairU16 {
            args.push(Val::I32((buf + 2) as i32));
        }
        if !abi::succeeded(s.call_i32(&getter, &args)?) {
            return Err(BridgeError::FieldNotDefined { tag });
        }
        decode(s, shape, buf)
    })
}

fn decode(session: &Session<'_>, shape: FieldShape, buf: GuestPtr) -> Result<FieldValue> {
    Ok(match shape {
        FieldShape::U16 => FieldValue::U16(session.read_u16(buf)?),
        FieldShape::U32 => FieldValue::U32(session.read_u32(buf)?),
        FieldShape::Int => FieldValue::Int(session.read_i32(buf)?),
        FieldShape::F32 => FieldValue::F32(session.read_f32(buf)?),
        FieldShape::F64 => FieldValue::F64(session.read_f64(buf)?),
        FieldShape::PairU16 => FieldValue::PairU16(session.read_u16(buf)?, session.read_u16(buf + 2)?),
        FieldShape::Text => {
            // The string stays owned by the guest's directory.
            let ptr = session.read_u32(buf)?;
            if ptr == 0 {
                FieldValue::Text(String::new())
            } else {
                FieldValue::Text(session.read_cstring(ptr)?)
            }
        }
    })
}

/// Write `value` to `tag` in the current directory of `handle`.
///
/// A rejected update is `FieldSet` without a diagnostic; callers that track
/// guest diagnostics attach one.
pub fn set_field(
    session: &mut Session<'_>,
    handle: GuestHandle,
    tag: FieldTag,
    value: &FieldValue,
) -> Result<()> {
    let setter = value.shape().setter();
    let head = [Val::I32(handle.raw()), Val::I32(tag.0 as i32)];

    let code = match value {
        FieldValue::Text(text) => session.with_cstring(text, |s, ptr| {
            s.call_i32(&setter, &[head[0].clone(), head[1].clone(), Val::I32(ptr as i32)])
        })?,
        scalar => {
            let mut args = head.to_vec();
            args.extend(scalar.scalar_args());
            session.call_i32(&setter, &args)?
        }
    };

    if abi::succeeded(code) {
        Ok(())
    } else {
        Err(BridgeError::FieldSet {
            tag,
            diagnostic: None,
        })
    }
}
