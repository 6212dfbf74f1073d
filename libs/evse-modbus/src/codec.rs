//! Register value codec
//!
//! Converts between raw 16-bit wire words and typed values. Each word arrives
//! in standard big-endian byte order; on top of that the charge controller has
//! two quirks of its own:
//!
//! - 32-bit values (integers and `float32`) are sent **low word first**
//!   (`CDAB` in byte-order notation);
//! - ASCII strings have the two bytes **swapped inside every word**.

use std::fmt;

use serde::{Serialize, Serializer};
use tracing::trace;

use crate::catalog::DataType;
use crate::error::{ChargerError, Result};

/// Typed register value
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    /// Unnarrowed number from an external source, checked against the target on encode
    F64(f64),
    Text(String),
}

impl RegisterValue {
    /// Numeric view of the value, `None` for text
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::U16(v) => Some(f64::from(*v)),
            RegisterValue::I16(v) => Some(f64::from(*v)),
            RegisterValue::U32(v) => Some(f64::from(*v)),
            RegisterValue::I32(v) => Some(f64::from(*v)),
            RegisterValue::F32(v) => Some(f64::from(*v)),
            RegisterValue::F64(v) => Some(*v),
            RegisterValue::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RegisterValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::U16(v) => write!(f, "{v}"),
            RegisterValue::I16(v) => write!(f, "{v}"),
            RegisterValue::U32(v) => write!(f, "{v}"),
            RegisterValue::I32(v) => write!(f, "{v}"),
            RegisterValue::F32(v) => write!(f, "{v}"),
            RegisterValue::F64(v) => write!(f, "{v}"),
            RegisterValue::Text(s) => f.write_str(s),
        }
    }
}

// Bare JSON number or string, no enum tagging
impl Serialize for RegisterValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RegisterValue::U16(v) => serializer.serialize_u16(*v),
            RegisterValue::I16(v) => serializer.serialize_i16(*v),
            RegisterValue::U32(v) => serializer.serialize_u32(*v),
            RegisterValue::I32(v) => serializer.serialize_i32(*v),
            RegisterValue::F32(v) => serializer.serialize_f32(*v),
            RegisterValue::F64(v) => serializer.serialize_f64(*v),
            RegisterValue::Text(s) => serializer.serialize_str(s),
        }
    }
}

impl From<u16> for RegisterValue {
    fn from(v: u16) -> Self {
        RegisterValue::U16(v)
    }
}

impl From<i16> for RegisterValue {
    fn from(v: i16) -> Self {
        RegisterValue::I16(v)
    }
}

impl From<u32> for RegisterValue {
    fn from(v: u32) -> Self {
        RegisterValue::U32(v)
    }
}

impl From<i32> for RegisterValue {
    fn from(v: i32) -> Self {
        RegisterValue::I32(v)
    }
}

impl From<f32> for RegisterValue {
    fn from(v: f32) -> Self {
        RegisterValue::F32(v)
    }
}

impl From<f64> for RegisterValue {
    fn from(v: f64) -> Self {
        RegisterValue::F64(v)
    }
}

fn expect_words(words: &[u16], count: usize, data_type: DataType) -> Result<()> {
    if words.len() != count {
        return Err(ChargerError::decode(format!(
            "{data_type} needs {count} word(s), got {}",
            words.len()
        )));
    }
    Ok(())
}

/// Join a low-word-first pair into a 32-bit value
#[inline]
pub fn join_low_first(low: u16, high: u16) -> u32 {
    u32::from(low) | (u32::from(high) << 16)
}

/// Split a 32-bit value into a low-word-first pair
#[inline]
pub fn split_low_first(value: u32) -> [u16; 2] {
    [(value & 0xFFFF) as u16, (value >> 16) as u16]
}

/// Decode wire words into a typed value
pub fn decode(data_type: DataType, words: &[u16]) -> Result<RegisterValue> {
    let value = match data_type {
        DataType::Unsigned16 => {
            expect_words(words, 1, data_type)?;
            RegisterValue::U16(words[0])
        },
        DataType::Signed16 => {
            expect_words(words, 1, data_type)?;
            RegisterValue::I16(words[0] as i16)
        },
        DataType::Unsigned32 => {
            expect_words(words, 2, data_type)?;
            RegisterValue::U32(join_low_first(words[0], words[1]))
        },
        DataType::Signed32 => {
            expect_words(words, 2, data_type)?;
            RegisterValue::I32(join_low_first(words[0], words[1]) as i32)
        },
        DataType::Float32 => {
            expect_words(words, 2, data_type)?;
            // High word's bytes first, then low word's: plain big-endian float
            let [h0, h1] = words[1].to_be_bytes();
            let [l0, l1] = words[0].to_be_bytes();
            RegisterValue::F32(f32::from_be_bytes([h0, h1, l0, l1]))
        },
        DataType::AsciiString => RegisterValue::Text(decode_ascii(words)?),
    };

    trace!("Decoded {}: words={:04X?}, value={}", data_type, words, value);
    Ok(value)
}

fn decode_ascii(words: &[u16]) -> Result<String> {
    if words.is_empty() {
        return Err(ChargerError::decode("string needs at least one word"));
    }

    let bytes: Vec<u8> = words
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .filter(|&b| b != 0)
        .collect();

    if let Some(bad) = bytes.iter().find(|b| !b.is_ascii()) {
        return Err(ChargerError::decode(format!(
            "non-ASCII byte 0x{bad:02X} in string register"
        )));
    }

    // All bytes are ASCII, so this cannot fail
    let text = String::from_utf8(bytes).map_err(|e| ChargerError::decode(e.to_string()))?;
    Ok(text.trim().to_string())
}

fn integral_in(value: f64, min: f64, max: f64, data_type: DataType) -> Result<f64> {
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(ChargerError::encode(format!(
            "{value} is not an integer, cannot encode as {data_type}"
        )));
    }
    if value < min || value > max {
        return Err(ChargerError::encode(format!(
            "{value} out of range for {data_type} ({min}..={max})"
        )));
    }
    Ok(value)
}

/// Narrow to float32, refusing values that would read back as a different number
///
/// A value round-trips when the shortest decimal form of the nearest float32
/// parses back to the same f64, so `0.1` is accepted and `16777217` is not.
fn narrow_f32(number: f64) -> Result<f32> {
    if number.is_finite() && number.abs() > f64::from(f32::MAX) {
        return Err(ChargerError::encode(format!(
            "{number} out of range for float32"
        )));
    }
    let narrowed = number as f32;
    if narrowed.is_finite() && narrowed.to_string().parse::<f64>() != Ok(number) {
        return Err(ChargerError::encode(format!(
            "{number} is not exactly representable as float32 (nearest {narrowed})"
        )));
    }
    Ok(narrowed)
}

/// Encode a typed value into wire words for the given data type
///
/// Any numeric variant is accepted as long as it is representable in the
/// target type; text is never writable.
pub fn encode(data_type: DataType, value: &RegisterValue) -> Result<Vec<u16>> {
    let number = value.as_f64().ok_or_else(|| {
        ChargerError::encode(format!("text value cannot be encoded as {data_type}"))
    })?;

    let words = match data_type {
        DataType::Unsigned16 => {
            let v = integral_in(number, 0.0, f64::from(u16::MAX), data_type)?;
            vec![v as u16]
        },
        DataType::Signed16 => {
            let v = integral_in(number, f64::from(i16::MIN), f64::from(i16::MAX), data_type)?;
            vec![(v as i16) as u16]
        },
        DataType::Unsigned32 => {
            let v = integral_in(number, 0.0, f64::from(u32::MAX), data_type)?;
            split_low_first(v as u32).to_vec()
        },
        DataType::Signed32 => {
            let v = integral_in(number, f64::from(i32::MIN), f64::from(i32::MAX), data_type)?;
            split_low_first((v as i32) as u32).to_vec()
        },
        DataType::Float32 => {
            let v = match value {
                RegisterValue::F32(f) => *f,
                _ => narrow_f32(number)?,
            };
            if !v.is_finite() {
                return Err(ChargerError::encode(format!(
                    "{v} is not a finite float32"
                )));
            }
            let [b0, b1, b2, b3] = v.to_be_bytes();
            vec![
                u16::from_be_bytes([b2, b3]),
                u16::from_be_bytes([b0, b1]),
            ]
        },
        DataType::AsciiString => {
            return Err(ChargerError::encode("string registers are not writable"));
        },
    };

    trace!("Encoded {} as {}: words={:04X?}", value, data_type, words);
    Ok(words)
}
