//! IEC elementary types as laid out in the program's debug buffer.

#![allow(missing_docs)]

use std::os::raw::c_long;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::RuntimeError;

/// Capacity of the native `STRING` body (`IEC_STRING.body`).
pub const STRING_CAPACITY: usize = 126;

/// Elementary IEC 61131-3 types that can be traced or forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IecType {
    Bool,
    Step,
    Transition,
    Action,
    Sint,
    Usint,
    Byte,
    Int,
    Uint,
    Word,
    Dint,
    Udint,
    Dword,
    Lint,
    Ulint,
    Lword,
    Real,
    Lreal,
    Time,
    Date,
    Tod,
    Dt,
    String,
}

const ALL_TYPES: [IecType; 23] = [
    IecType::Bool,
    IecType::Step,
    IecType::Transition,
    IecType::Action,
    IecType::Sint,
    IecType::Usint,
    IecType::Byte,
    IecType::Int,
    IecType::Uint,
    IecType::Word,
    IecType::Dint,
    IecType::Udint,
    IecType::Dword,
    IecType::Lint,
    IecType::Ulint,
    IecType::Lword,
    IecType::Real,
    IecType::Lreal,
    IecType::Time,
    IecType::Date,
    IecType::Tod,
    IecType::Dt,
    IecType::String,
];

/// Seconds/nanoseconds pair used by `TIME`, `DATE`, `TOD` and `DT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IecTimespec {
    pub sec: i64,
    pub nsec: i64,
}

/// A decoded (or to-be-forced) scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IecValue {
    Bool(bool),
    Signed(i64),
    Unsigned(u64),
    Real(f64),
    Time(IecTimespec),
    Text(String),
}

impl IecType {
    /// Parse an IEC type name (`"INT"`, `"lreal"`, ...).
    pub fn parse(name: &str) -> Result<Self, RuntimeError> {
        let upper = name.trim().to_ascii_uppercase();
        ALL_TYPES
            .iter()
            .copied()
            .find(|ty| ty.name() == upper)
            .ok_or_else(|| RuntimeError::UnsupportedType(SmolStr::new(name)))
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Bool => "BOOL",
            Self::Step => "STEP",
            Self::Transition => "TRANSITION",
            Self::Action => "ACTION",
            Self::Sint => "SINT",
            Self::Usint => "USINT",
            Self::Byte => "BYTE",
            Self::Int => "INT",
            Self::Uint => "UINT",
            Self::Word => "WORD",
            Self::Dint => "DINT",
            Self::Udint => "UDINT",
            Self::Dword => "DWORD",
            Self::Lint => "LINT",
            Self::Ulint => "ULINT",
            Self::Lword => "LWORD",
            Self::Real => "REAL",
            Self::Lreal => "LREAL",
            Self::Time => "TIME",
            Self::Date => "DATE",
            Self::Tod => "TOD",
            Self::Dt => "DT",
            Self::String => "STRING",
        }
    }

    /// Stable wire tag.
    #[must_use]
    pub fn code(self) -> u8 {
        ALL_TYPES
            .iter()
            .position(|ty| *ty == self)
            .and_then(|pos| u8::try_from(pos).ok())
            .unwrap_or(u8::MAX)
    }

    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        ALL_TYPES.get(usize::from(code)).copied()
    }

    /// Width in the debug buffer. `None` for `STRING`, which is
    /// length-prefixed and variable.
    #[must_use]
    pub fn fixed_width(self) -> Option<usize> {
        match self {
            Self::Bool
            | Self::Step
            | Self::Transition
            | Self::Action
            | Self::Sint
            | Self::Usint
            | Self::Byte => Some(1),
            Self::Int | Self::Uint | Self::Word => Some(2),
            Self::Dint | Self::Udint | Self::Dword | Self::Real => Some(4),
            Self::Lint | Self::Ulint | Self::Lword | Self::Lreal => Some(8),
            Self::Time | Self::Date | Self::Tod | Self::Dt => Some(2 * timespec_field_width()),
            Self::String => None,
        }
    }

    /// Decode one value at the start of `buf`, returning it with the number
    /// of bytes consumed.
    pub fn decode(self, buf: &[u8]) -> Result<(IecValue, usize), RuntimeError> {
        let Some(width) = self.fixed_width() else {
            return decode_string(buf);
        };
        if buf.len() < width {
            return Err(truncated(self, width, buf.len()));
        }
        let bytes = &buf[..width];
        let value = match self {
            Self::Bool => IecValue::Bool(bytes[0] != 0),
            Self::Step | Self::Transition | Self::Action | Self::Usint | Self::Byte => {
                IecValue::Unsigned(u64::from(bytes[0]))
            }
            Self::Sint => IecValue::Signed(i64::from(i8::from_le_bytes([bytes[0]]))),
            Self::Int => IecValue::Signed(i64::from(i16::from_le_bytes(array(bytes)))),
            Self::Uint | Self::Word => {
                IecValue::Unsigned(u64::from(u16::from_le_bytes(array(bytes))))
            }
            Self::Dint => IecValue::Signed(i64::from(i32::from_le_bytes(array(bytes)))),
            Self::Udint | Self::Dword => {
                IecValue::Unsigned(u64::from(u32::from_le_bytes(array(bytes))))
            }
            Self::Lint => IecValue::Signed(i64::from_le_bytes(array(bytes))),
            Self::Ulint | Self::Lword => IecValue::Unsigned(u64::from_le_bytes(array(bytes))),
            Self::Real => IecValue::Real(f64::from(f32::from_le_bytes(array(bytes)))),
            Self::Lreal => IecValue::Real(f64::from_le_bytes(array(bytes))),
            Self::Time | Self::Date | Self::Tod | Self::Dt => {
                let field = timespec_field_width();
                IecValue::Time(IecTimespec {
                    sec: read_signed(&bytes[..field]),
                    nsec: read_signed(&bytes[field..]),
                })
            }
            Self::String => return decode_string(buf),
        };
        Ok((value, width))
    }

    /// Encode a value the way the program publishes it in its debug buffer.
    pub fn encode_sample(self, value: &IecValue) -> Result<Vec<u8>, RuntimeError> {
        if self == Self::String {
            let text = self.expect_text(value)?;
            let mut out = Vec::with_capacity(text.len() + 1);
            out.push(u8::try_from(text.len()).map_err(|_| self.mismatch(value))?);
            out.extend_from_slice(text.as_bytes());
            return Ok(out);
        }
        self.encode_fixed(value)
    }

    /// Encode a force value with the native variable layout
    /// (`STRING` is the full `IEC_STRING` struct).
    pub fn encode_force(self, value: &IecValue) -> Result<Vec<u8>, RuntimeError> {
        if self == Self::String {
            let text = self.expect_text(value)?;
            let mut out = vec![0u8; STRING_CAPACITY + 1];
            out[0] = u8::try_from(text.len()).map_err(|_| self.mismatch(value))?;
            out[1..=text.len()].copy_from_slice(text.as_bytes());
            return Ok(out);
        }
        self.encode_fixed(value)
    }

    /// Inverse of [`IecType::encode_force`].
    pub fn decode_force(self, bytes: &[u8]) -> Result<IecValue, RuntimeError> {
        if self == Self::String {
            let len = bytes.first().copied().map(usize::from).unwrap_or(0);
            let len = len.min(STRING_CAPACITY);
            if bytes.len() < len + 1 {
                return Err(truncated(self, len + 1, bytes.len()));
            }
            return Ok(IecValue::Text(
                String::from_utf8_lossy(&bytes[1..=len]).into_owned(),
            ));
        }
        self.decode(bytes).map(|(value, _)| value)
    }

    fn encode_fixed(self, value: &IecValue) -> Result<Vec<u8>, RuntimeError> {
        let err = || self.mismatch(value);
        let out = match self {
            Self::Bool => vec![u8::from(value_as_bool(value).ok_or_else(err)?)],
            Self::Step | Self::Transition | Self::Action | Self::Usint | Self::Byte => {
                let raw = value_as_u64(value).ok_or_else(err)?;
                vec![u8::try_from(raw).map_err(|_| err())?]
            }
            Self::Sint => {
                let raw = value_as_i64(value).ok_or_else(err)?;
                i8::try_from(raw).map_err(|_| err())?.to_le_bytes().to_vec()
            }
            Self::Int => {
                let raw = value_as_i64(value).ok_or_else(err)?;
                i16::try_from(raw).map_err(|_| err())?.to_le_bytes().to_vec()
            }
            Self::Uint | Self::Word => {
                let raw = value_as_u64(value).ok_or_else(err)?;
                u16::try_from(raw).map_err(|_| err())?.to_le_bytes().to_vec()
            }
            Self::Dint => {
                let raw = value_as_i64(value).ok_or_else(err)?;
                i32::try_from(raw).map_err(|_| err())?.to_le_bytes().to_vec()
            }
            Self::Udint | Self::Dword => {
                let raw = value_as_u64(value).ok_or_else(err)?;
                u32::try_from(raw).map_err(|_| err())?.to_le_bytes().to_vec()
            }
            Self::Lint => value_as_i64(value).ok_or_else(err)?.to_le_bytes().to_vec(),
            Self::Ulint | Self::Lword => value_as_u64(value).ok_or_else(err)?.to_le_bytes().to_vec(),
            #[allow(clippy::cast_possible_truncation)]
            Self::Real => (value_as_f64(value).ok_or_else(err)? as f32)
                .to_le_bytes()
                .to_vec(),
            Self::Lreal => value_as_f64(value).ok_or_else(err)?.to_le_bytes().to_vec(),
            Self::Time | Self::Date | Self::Tod | Self::Dt => {
                let IecValue::Time(spec) = value else {
                    return Err(err());
                };
                let mut out = write_signed(spec.sec).ok_or_else(err)?;
                out.extend(write_signed(spec.nsec).ok_or_else(err)?);
                out
            }
            Self::String => return Err(err()),
        };
        Ok(out)
    }

    fn expect_text<'a>(self, value: &'a IecValue) -> Result<&'a str, RuntimeError> {
        match value {
            IecValue::Text(text) if text.len() <= STRING_CAPACITY => Ok(text.as_str()),
            _ => Err(self.mismatch(value)),
        }
    }

    fn mismatch(self, value: &IecValue) -> RuntimeError {
        RuntimeError::DebugDecode(format!("value {value:?} does not fit {}", self.name()).into())
    }
}

impl std::fmt::Display for IecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Length-prefixed string: one length byte, then that many bytes.
fn decode_string(buf: &[u8]) -> Result<(IecValue, usize), RuntimeError> {
    let Some((&len, rest)) = buf.split_first() else {
        return Err(truncated(IecType::String, 1, 0));
    };
    let len = usize::from(len);
    if rest.len() < len {
        return Err(truncated(IecType::String, len + 1, buf.len()));
    }
    let text = String::from_utf8_lossy(&rest[..len]).into_owned();
    Ok((IecValue::Text(text), len + 1))
}

/// Decode a whole debug buffer against the ordered list of traced types.
///
/// The buffer must contain exactly one value per type; a short buffer or
/// trailing bytes both mean the program and the trace list disagree.
pub fn decode_buffer(types: &[IecType], buf: &[u8]) -> Result<Vec<IecValue>, RuntimeError> {
    let mut values = Vec::with_capacity(types.len());
    let mut offset = 0usize;
    for ty in types {
        let (value, used) = ty.decode(&buf[offset..]).map_err(|err| {
            RuntimeError::DebugDecode(
                format!("variable #{} at offset {offset}: {err}", values.len()).into(),
            )
        })?;
        values.push(value);
        offset += used;
    }
    if offset != buf.len() {
        return Err(RuntimeError::DebugDecode(
            format!("{} trailing bytes after {} values", buf.len() - offset, values.len()).into(),
        ));
    }
    Ok(values)
}

fn timespec_field_width() -> usize {
    std::mem::size_of::<c_long>()
}

fn truncated(ty: IecType, needed: usize, available: usize) -> RuntimeError {
    RuntimeError::DebugDecode(
        format!("{ty} needs {needed} bytes, {available} available").into(),
    )
}

fn array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn read_signed(bytes: &[u8]) -> i64 {
    match bytes.len() {
        4 => i64::from(i32::from_le_bytes(array(bytes))),
        _ => i64::from_le_bytes(array(bytes)),
    }
}

fn write_signed(value: i64) -> Option<Vec<u8>> {
    match timespec_field_width() {
        4 => i32::try_from(value).ok().map(|v| v.to_le_bytes().to_vec()),
        _ => Some(value.to_le_bytes().to_vec()),
    }
}

fn value_as_bool(value: &IecValue) -> Option<bool> {
    match value {
        IecValue::Bool(flag) => Some(*flag),
        IecValue::Signed(raw) => Some(*raw != 0),
        IecValue::Unsigned(raw) => Some(*raw != 0),
        _ => None,
    }
}

fn value_as_i64(value: &IecValue) -> Option<i64> {
    match value {
        IecValue::Signed(raw) => Some(*raw),
        IecValue::Unsigned(raw) => i64::try_from(*raw).ok(),
        IecValue::Bool(flag) => Some(i64::from(*flag)),
        _ => None,
    }
}

fn value_as_u64(value: &IecValue) -> Option<u64> {
    match value {
        IecValue::Unsigned(raw) => Some(*raw),
        IecValue::Signed(raw) => u64::try_from(*raw).ok(),
        IecValue::Bool(flag) => Some(u64::from(*flag)),
        _ => None,
    }
}

#[allow(clippy::cast_precision_loss)]
fn value_as_f64(value: &IecValue) -> Option<f64> {
    match value {
        IecValue::Real(raw) => Some(*raw),
        IecValue::Signed(raw) => Some(*raw as f64),
        IecValue::Unsigned(raw) => Some(*raw as f64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_type_names_case_insensitively() {
        assert_eq!(IecType::parse("int").unwrap(), IecType::Int);
        assert_eq!(IecType::parse(" LREAL ").unwrap(), IecType::Lreal);
        assert!(matches!(
            IecType::parse("WSTRING"),
            Err(RuntimeError::UnsupportedType(_))
        ));
    }

    #[test]
    fn wire_codes_are_stable() {
        for ty in ALL_TYPES {
            assert_eq!(IecType::from_code(ty.code()), Some(ty));
        }
        assert_eq!(IecType::from_code(200), None);
    }

    #[test]
    fn decodes_mixed_buffer_in_order() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(-2i16).to_le_bytes());
        buf.push(1);
        buf.extend_from_slice(&1.5f32.to_le_bytes());
        buf.push(3);
        buf.extend_from_slice(b"abc");
        let values = decode_buffer(
            &[IecType::Int, IecType::Bool, IecType::Real, IecType::String],
            &buf,
        )
        .unwrap();
        assert_eq!(
            values,
            vec![
                IecValue::Signed(-2),
                IecValue::Bool(true),
                IecValue::Real(1.5),
                IecValue::Text("abc".into()),
            ]
        );
    }

    #[test]
    fn short_buffer_is_a_decode_error() {
        let buf = 7i32.to_le_bytes();
        let err = decode_buffer(&[IecType::Dint, IecType::Int], &buf).unwrap_err();
        assert!(matches!(err, RuntimeError::DebugDecode(_)));
    }

    #[test]
    fn trailing_bytes_are_a_decode_error() {
        let err = decode_buffer(&[IecType::Bool], &[1, 0]).unwrap_err();
        assert!(err.to_string().contains("trailing"));
    }

    #[test]
    fn bool_is_any_non_zero_byte() {
        let (value, used) = IecType::Bool.decode(&[0x80]).unwrap();
        assert_eq!(value, IecValue::Bool(true));
        assert_eq!(used, 1);
    }

    #[test]
    fn force_encoding_rejects_out_of_range_values() {
        assert!(IecType::Sint.encode_force(&IecValue::Signed(200)).is_err());
        assert!(IecType::Uint.encode_force(&IecValue::Signed(-1)).is_err());
        assert_eq!(
            IecType::Word.encode_force(&IecValue::Unsigned(0x1234)).unwrap(),
            vec![0x34, 0x12]
        );
    }

    #[test]
    fn string_force_uses_full_native_struct() {
        let bytes = IecType::String
            .encode_force(&IecValue::Text("hi".into()))
            .unwrap();
        assert_eq!(bytes.len(), STRING_CAPACITY + 1);
        assert_eq!(&bytes[..3], &[2, b'h', b'i']);
        assert_eq!(
            IecType::String.decode_force(&bytes).unwrap(),
            IecValue::Text("hi".into())
        );
    }

    #[test]
    fn time_values_use_native_long_width() {
        let spec = IecTimespec { sec: 3, nsec: 500 };
        let bytes = IecType::Time.encode_sample(&IecValue::Time(spec)).unwrap();
        assert_eq!(bytes.len(), IecType::Time.fixed_width().unwrap());
        let (value, _) = IecType::Time.decode(&bytes).unwrap();
        assert_eq!(value, IecValue::Time(spec));
    }
}
