//! The tagged value model for plain (non-shared) content.
//!
//! `Any` is what a binding layer exchanges with the engine: null, booleans,
//! numbers, strings, byte buffers, and nested arrays/maps of those. Values
//! are immutable once inserted, so nested collections are reference
//! counted and cheap to clone.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::encoding::Decode;
use crate::encoding::Decoder;
use crate::encoding::Encode;
use crate::encoding::Encoder;
use crate::error::Error;
use crate::error::Result;

/// Integers within this magnitude are written as var-ints.
const BITS31: f64 = 0x7FFF_FFFF as f64;

/// Nesting limit when decoding untrusted payloads.
const MAX_DEPTH: usize = 256;

const TAG_UNDEFINED: u8 = 127;
const TAG_NULL: u8 = 126;
const TAG_INTEGER: u8 = 125;
const TAG_FLOAT32: u8 = 124;
const TAG_FLOAT64: u8 = 123;
const TAG_BIGINT: u8 = 122;
const TAG_FALSE: u8 = 121;
const TAG_TRUE: u8 = 120;
const TAG_STRING: u8 = 119;
const TAG_OBJECT: u8 = 118;
const TAG_ARRAY: u8 = 117;
const TAG_BUFFER: u8 = 116;

/// A plain value stored inside a shared type.
#[derive(Clone, Debug, PartialEq)]
pub enum Any {
    Null,
    Undefined,
    Bool(bool),
    Number(f64),
    BigInt(i64),
    String(Arc<str>),
    Buffer(Arc<[u8]>),
    Array(Arc<[Any]>),
    Map(Arc<BTreeMap<String, Any>>),
}

impl Any {
    /// Returns the string slice if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Any::String(s) => return Some(s),
            _ => return None,
        }
    }

    /// Returns the numeric value for `Number` and `BigInt`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Any::Number(n) => return Some(*n),
            Any::BigInt(n) => return Some(*n as f64),
            _ => return None,
        }
    }

    fn decode_at(decoder: &mut Decoder<'_>, depth: usize) -> Result<Any> {
        if depth > MAX_DEPTH {
            return Err(Error::malformed("value nesting too deep"));
        }
        let tag = decoder.read_u8()?;
        let value = match tag {
            TAG_UNDEFINED => Any::Undefined,
            TAG_NULL => Any::Null,
            TAG_INTEGER => Any::Number(decoder.read_var_i64()? as f64),
            TAG_FLOAT32 => Any::Number(decoder.read_f32()? as f64),
            TAG_FLOAT64 => Any::Number(decoder.read_f64()?),
            TAG_BIGINT => Any::BigInt(decoder.read_i64()?),
            TAG_FALSE => Any::Bool(false),
            TAG_TRUE => Any::Bool(true),
            TAG_STRING => Any::String(decoder.read_string()?.into()),
            TAG_OBJECT => {
                let len = decoder.read_len()?;
                let mut map = BTreeMap::new();
                for _ in 0..len {
                    let key = decoder.read_string()?.to_string();
                    let value = Any::decode_at(decoder, depth + 1)?;
                    map.insert(key, value);
                }
                Any::Map(Arc::new(map))
            }
            TAG_ARRAY => {
                let len = decoder.read_len()?;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(Any::decode_at(decoder, depth + 1)?);
                }
                Any::Array(items.into())
            }
            TAG_BUFFER => Any::Buffer(decoder.read_bytes()?.into()),
            other => {
                return Err(Error::malformed(format!("unknown value tag {other}")));
            }
        };
        return Ok(value);
    }
}

impl Encode for Any {
    fn encode(&self, encoder: &mut Encoder) {
        match self {
            Any::Undefined => encoder.write_u8(TAG_UNDEFINED),
            Any::Null => encoder.write_u8(TAG_NULL),
            Any::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= BITS31 {
                    encoder.write_u8(TAG_INTEGER);
                    encoder.write_var_i64(*n as i64);
                } else if (*n as f32) as f64 == *n {
                    encoder.write_u8(TAG_FLOAT32);
                    encoder.write_f32(*n as f32);
                } else {
                    encoder.write_u8(TAG_FLOAT64);
                    encoder.write_f64(*n);
                }
            }
            Any::BigInt(n) => {
                encoder.write_u8(TAG_BIGINT);
                encoder.write_i64(*n);
            }
            Any::Bool(false) => encoder.write_u8(TAG_FALSE),
            Any::Bool(true) => encoder.write_u8(TAG_TRUE),
            Any::String(s) => {
                encoder.write_u8(TAG_STRING);
                encoder.write_string(s);
            }
            Any::Map(map) => {
                encoder.write_u8(TAG_OBJECT);
                encoder.write_var_u64(map.len() as u64);
                for (key, value) in map.iter() {
                    encoder.write_string(key);
                    value.encode(encoder);
                }
            }
            Any::Array(items) => {
                encoder.write_u8(TAG_ARRAY);
                encoder.write_var_u64(items.len() as u64);
                for item in items.iter() {
                    item.encode(encoder);
                }
            }
            Any::Buffer(bytes) => {
                encoder.write_u8(TAG_BUFFER);
                encoder.write_bytes(bytes);
            }
        }
    }
}

impl Decode for Any {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Any> {
        return Any::decode_at(decoder, 0);
    }
}

fn write_json_string(f: &mut fmt::Formatter<'_>, s: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in s.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if (c as u32) < 0x20 => write!(f, "\\u{:04x}", c as u32)?,
            c => write!(f, "{c}")?,
        }
    }
    return f.write_str("\"");
}

/// JSON-like rendering, for logs and test failure messages.
impl fmt::Display for Any {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Any::Null => return f.write_str("null"),
            Any::Undefined => return f.write_str("undefined"),
            Any::Bool(b) => return write!(f, "{b}"),
            Any::Number(n) => return write!(f, "{n}"),
            Any::BigInt(n) => return write!(f, "{n}"),
            Any::String(s) => return write_json_string(f, s),
            Any::Buffer(bytes) => return write!(f, "{bytes:?}"),
            Any::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{item}")?;
                }
                return f.write_str("]");
            }
            Any::Map(map) => {
                f.write_str("{")?;
                for (i, (key, value)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write_json_string(f, key)?;
                    write!(f, ":{value}")?;
                }
                return f.write_str("}");
            }
        }
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<bool> for Any {
    fn from(value: bool) -> Any {
        return Any::Bool(value);
    }
}

impl From<f64> for Any {
    fn from(value: f64) -> Any {
        return Any::Number(value);
    }
}

impl From<f32> for Any {
    fn from(value: f32) -> Any {
        return Any::Number(value as f64);
    }
}

impl From<i32> for Any {
    fn from(value: i32) -> Any {
        return Any::Number(value as f64);
    }
}

impl From<u32> for Any {
    fn from(value: u32) -> Any {
        return Any::Number(value as f64);
    }
}

/// 64-bit integers keep their full precision as `BigInt`.
impl From<i64> for Any {
    fn from(value: i64) -> Any {
        return Any::BigInt(value);
    }
}

impl From<&str> for Any {
    fn from(value: &str) -> Any {
        return Any::String(value.into());
    }
}

impl From<String> for Any {
    fn from(value: String) -> Any {
        return Any::String(value.into());
    }
}

impl<T: Into<Any>> From<Option<T>> for Any {
    fn from(value: Option<T>) -> Any {
        match value {
            Some(value) => return value.into(),
            None => return Any::Null,
        }
    }
}

impl<T: Into<Any>> From<Vec<T>> for Any {
    fn from(values: Vec<T>) -> Any {
        let items: Vec<Any> = values.into_iter().map(Into::into).collect();
        return Any::Array(items.into());
    }
}

impl<T: Into<Any>> From<BTreeMap<String, T>> for Any {
    fn from(values: BTreeMap<String, T>) -> Any {
        let map = values.into_iter().map(|(k, v)| (k, v.into())).collect();
        return Any::Map(Arc::new(map));
    }
}

impl<T: Into<Any>> From<HashMap<String, T>> for Any {
    fn from(values: HashMap<String, T>) -> Any {
        let map = values.into_iter().map(|(k, v)| (k, v.into())).collect();
        return Any::Map(Arc::new(map));
    }
}
