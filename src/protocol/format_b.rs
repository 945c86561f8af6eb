//! Self-describing compact binary decoder.
//!
//! The whole buffer is one value in a MessagePack-style encoding: the
//! leading byte of each element selects its type and, for the fix
//! variants, its size. Decoded values land in `serde_json::Value`;
//! binary blobs become arrays of byte values, extension payloads are
//! skipped and surface as null.

use super::DecodeError;
use serde_json::{Map, Value};

const MAX_DEPTH: usize = 32;

/// Detection predicate for the auto dispatcher: the leading byte must
/// fall in one of the format's defined ranges. Bare fixints are excluded
/// on purpose, a top-level integer is never a valid message.
pub fn looks_like(bytes: &[u8]) -> bool {
    let Some(&first) = bytes.first() else {
        return false;
    };
    match first {
        0x80..=0xbf => true,                 // fixmap / fixarray / fixstr
        0xc0 | 0xc2 | 0xc3 => true,          // nil / bool
        0xc4..=0xc9 => true,                 // bin8-32 / ext8-32
        0xca..=0xd3 => true,                 // floats / uints / ints
        0xd4..=0xd8 => true,                 // fixext
        0xd9..=0xdb => true,                 // str8-32
        0xdc | 0xdd => true,                 // array16/32
        0xde | 0xdf => true,                 // map16/32
        _ => false,
    }
}

/// Decode the whole buffer as one value. Trailing bytes are an error so
/// that misdetected frames fall through to the other decoder.
pub fn decode_value(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut cursor = Cursor::new(bytes);
    let value = read_value(&mut cursor, 0)?;
    if !cursor.is_empty() {
        return Err(DecodeError::TrailingBytes(cursor.remaining()));
    }
    Ok(value)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
}

fn read_value(cursor: &mut Cursor, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::DepthExceeded);
    }
    let first = cursor.u8()?;
    let value = match first {
        0x00..=0x7f => Value::from(first as i64),
        0x80..=0x8f => read_map(cursor, (first & 0x0f) as usize, depth)?,
        0x90..=0x9f => read_array(cursor, (first & 0x0f) as usize, depth)?,
        0xa0..=0xbf => read_str(cursor, (first & 0x1f) as usize)?,
        0xc0 => Value::Null,
        0xc1 => return Err(DecodeError::UnknownTag(0xc1)),
        0xc2 => Value::Bool(false),
        0xc3 => Value::Bool(true),
        0xc4 => {
            let len = cursor.u8()? as usize;
            read_bin(cursor, len)?
        }
        0xc5 => {
            let len = cursor.u16()? as usize;
            read_bin(cursor, len)?
        }
        0xc6 => {
            let len = cursor.u32()? as usize;
            read_bin(cursor, len)?
        }
        0xc7 => {
            let len = cursor.u8()? as usize;
            skip_ext(cursor, len)?
        }
        0xc8 => {
            let len = cursor.u16()? as usize;
            skip_ext(cursor, len)?
        }
        0xc9 => {
            let len = cursor.u32()? as usize;
            skip_ext(cursor, len)?
        }
        0xca => {
            let bits = cursor.u32()?;
            float_value(f32::from_bits(bits) as f64)
        }
        0xcb => {
            let bits = cursor.u64()?;
            float_value(f64::from_bits(bits))
        }
        0xcc => Value::from(cursor.u8()? as u64),
        0xcd => Value::from(cursor.u16()? as u64),
        0xce => Value::from(cursor.u32()? as u64),
        0xcf => Value::from(cursor.u64()?),
        0xd0 => Value::from(cursor.u8()? as i8 as i64),
        0xd1 => Value::from(cursor.u16()? as i16 as i64),
        0xd2 => Value::from(cursor.u32()? as i32 as i64),
        0xd3 => Value::from(cursor.u64()? as i64),
        0xd4 => skip_ext(cursor, 1)?,
        0xd5 => skip_ext(cursor, 2)?,
        0xd6 => skip_ext(cursor, 4)?,
        0xd7 => skip_ext(cursor, 8)?,
        0xd8 => skip_ext(cursor, 16)?,
        0xd9 => {
            let len = cursor.u8()? as usize;
            read_str(cursor, len)?
        }
        0xda => {
            let len = cursor.u16()? as usize;
            read_str(cursor, len)?
        }
        0xdb => {
            let len = cursor.u32()? as usize;
            read_str(cursor, len)?
        }
        0xdc => {
            let count = cursor.u16()? as usize;
            read_array(cursor, count, depth)?
        }
        0xdd => {
            let count = cursor.u32()? as usize;
            read_array(cursor, count, depth)?
        }
        0xde => {
            let count = cursor.u16()? as usize;
            read_map(cursor, count, depth)?
        }
        0xdf => {
            let count = cursor.u32()? as usize;
            read_map(cursor, count, depth)?
        }
        0xe0..=0xff => Value::from(first as i8 as i64),
    };
    Ok(value)
}

fn float_value(v: f64) -> Value {
    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

fn read_str(cursor: &mut Cursor, len: usize) -> Result<Value, DecodeError> {
    let raw = cursor.take(len)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8)?;
    Ok(Value::String(s.to_string()))
}

fn read_bin(cursor: &mut Cursor, len: usize) -> Result<Value, DecodeError> {
    let raw = cursor.take(len)?;
    Ok(Value::Array(raw.iter().map(|b| Value::from(*b)).collect()))
}

fn skip_ext(cursor: &mut Cursor, len: usize) -> Result<Value, DecodeError> {
    cursor.take(1 + len)?; // type byte + payload
    Ok(Value::Null)
}

fn read_array(cursor: &mut Cursor, count: usize, depth: usize) -> Result<Value, DecodeError> {
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(read_value(cursor, depth + 1)?);
    }
    Ok(Value::Array(items))
}

fn read_map(cursor: &mut Cursor, count: usize, depth: usize) -> Result<Value, DecodeError> {
    let mut map = Map::with_capacity(count.min(1024));
    for _ in 0..count {
        let key = match read_value(cursor, depth + 1)? {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let value = read_value(cursor, depth + 1)?;
        map.insert(key, value);
    }
    Ok(Value::Object(map))
}
