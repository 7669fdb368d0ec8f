//! Primitive binary encoding shared by updates, state vectors and delete sets.
//!
//! The layout follows the lib0 "v1" conventions so that payloads are
//! byte-compatible with other engines speaking the same format:
//!
//! - var-uint: little-endian base-128, high bit means "more bytes follow"
//! - var-int: first byte carries a continuation bit, a sign bit and six
//!   data bits; following bytes are plain base-128
//! - var-string: var-uint byte length followed by UTF-8
//! - fixed-width numbers are big-endian
//!
//! Every read is bounds-checked. A truncated or inconsistent payload yields
//! `Error::MalformedUpdate` rather than a panic.

use crate::error::Error;
use crate::error::Result;

const BIT7: u8 = 0b0100_0000;
const BIT8: u8 = 0b1000_0000;
const BITS6: u8 = 0b0011_1111;
const BITS7: u8 = 0b0111_1111;

/// Largest integer a var-int may carry (2^53 - 1).
const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

// =============================================================================
// Encoder
// =============================================================================

/// An append-only byte buffer with lib0 primitive writers.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Encoder {
        return Encoder { buf: Vec::new() };
    }

    /// Consume the encoder and return the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        return self.buf;
    }

    #[inline]
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_var_u64(&mut self, mut value: u64) {
        while value > BITS7 as u64 {
            self.buf.push(BIT8 | (value as u8 & BITS7));
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    #[inline]
    pub fn write_var_u32(&mut self, value: u32) {
        self.write_var_u64(value as u64);
    }

    /// Write a signed integer using the lib0 sign-bit layout.
    pub fn write_var_i64(&mut self, value: i64) {
        let negative = value < 0;
        let mut num = value.unsigned_abs();
        let mut first = (num as u8) & BITS6;
        if num > BITS6 as u64 {
            first |= BIT8;
        }
        if negative {
            first |= BIT7;
        }
        self.buf.push(first);
        num >>= 6;
        while num > 0 {
            let mut byte = (num as u8) & BITS7;
            if num > BITS7 as u64 {
                byte |= BIT8;
            }
            self.buf.push(byte);
            num >>= 7;
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_var_u64(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }
}

// =============================================================================
// Decoder
// =============================================================================

/// A cursor over an encoded payload.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Decoder<'a> {
        return Decoder { buf, pos: 0 };
    }

    /// Whether every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        return self.pos >= self.buf.len();
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| Error::malformed("unexpected end of payload"))?;
        self.pos += 1;
        return Ok(byte);
    }

    fn read_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| Error::malformed("length prefix runs past end of payload"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        return Ok(slice);
    }

    pub fn read_var_u64(&mut self) -> Result<u64> {
        let mut num: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && byte & BITS7 > 1) {
                return Err(Error::malformed("var-uint overflows 64 bits"));
            }
            num |= ((byte & BITS7) as u64) << shift;
            if byte < BIT8 {
                return Ok(num);
            }
            shift += 7;
        }
    }

    pub fn read_var_u32(&mut self) -> Result<u32> {
        let num = self.read_var_u64()?;
        return u32::try_from(num).map_err(|_| Error::malformed("var-uint overflows 32 bits"));
    }

    /// Read a length prefix, rejecting values that cannot possibly fit in
    /// the remaining payload (each element takes at least one byte).
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_var_u64()?;
        let remaining = (self.buf.len() - self.pos) as u64;
        if len > remaining {
            return Err(Error::malformed("element count exceeds payload size"));
        }
        return Ok(len as usize);
    }

    pub fn read_var_i64(&mut self) -> Result<i64> {
        let first = self.read_u8()?;
        let mut num = (first & BITS6) as u64;
        let negative = first & BIT7 != 0;
        if first & BIT8 != 0 {
            let mut shift = 6u32;
            loop {
                let byte = self.read_u8()?;
                num |= ((byte & BITS7) as u64)
                    .checked_shl(shift)
                    .filter(|_| shift < 57)
                    .ok_or_else(|| Error::malformed("var-int overflows"))?;
                if num > MAX_SAFE_INTEGER {
                    return Err(Error::malformed("var-int exceeds safe integer range"));
                }
                if byte < BIT8 {
                    break;
                }
                shift += 7;
            }
        }
        let value = num as i64;
        if negative {
            return Ok(-value);
        }
        return Ok(value);
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        return self.read_exact(len);
    }

    pub fn read_string(&mut self) -> Result<&'a str> {
        let bytes = self.read_bytes()?;
        return std::str::from_utf8(bytes).map_err(|_| Error::malformed("string is not valid UTF-8"));
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        let bytes = self.read_exact(4)?;
        return Ok(f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.read_exact(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        return Ok(f64::from_be_bytes(raw));
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        let bytes = self.read_exact(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        return Ok(i64::from_be_bytes(raw));
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Types with a v1 binary representation.
pub trait Encode {
    fn encode(&self, encoder: &mut Encoder);

    fn encode_v1(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode(&mut encoder);
        return encoder.into_bytes();
    }
}

/// Types that can be read back from their v1 binary representation.
pub trait Decode: Sized {
    fn decode(decoder: &mut Decoder<'_>) -> Result<Self>;

    fn decode_v1(bytes: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(bytes);
        return Self::decode(&mut decoder);
    }
}
