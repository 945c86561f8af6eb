//! Tag-length-value frame codec.
//!
//! Frame layout: 1-byte header (top bit must be set) + big-endian u16 body
//! length + body. The body holds exactly one tagged value and may be
//! zlib-deflated as a whole, detected by the 0x78 magic prefix. Values are
//! a recursive tagged tree: primitives, typed primitive arrays, an ordered
//! list of tagged values and a string-keyed object.
//!
//! The encoder exists for fixtures and for the heartbeat/handshake tooling;
//! both directions share the same tag table so round-trips are exact.

use super::DecodeError;
use flate2::read::ZlibDecoder;
use serde_json::{json, Value};
use std::io::Read;

const HEADER_BINARY: u8 = 0x80;
const ZLIB_MAGIC: u8 = 0x78;

/// Nesting guard for hostile frames.
const MAX_DEPTH: usize = 32;
/// Cap on inflated body size; frames are kilobytes in practice.
const MAX_INFLATED: u64 = 1 << 20;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_BYTE: u8 = 2;
const TAG_SHORT: u8 = 3;
const TAG_INT: u8 = 4;
const TAG_LONG: u8 = 5;
const TAG_FLOAT: u8 = 6;
const TAG_DOUBLE: u8 = 7;
const TAG_TEXT: u8 = 8;
const TAG_BOOL_ARRAY: u8 = 9;
const TAG_BYTE_ARRAY: u8 = 10;
const TAG_SHORT_ARRAY: u8 = 11;
const TAG_INT_ARRAY: u8 = 12;
const TAG_LONG_ARRAY: u8 = 13;
const TAG_FLOAT_ARRAY: u8 = 14;
const TAG_DOUBLE_ARRAY: u8 = 15;
const TAG_TEXT_ARRAY: u8 = 16;
const TAG_LIST: u8 = 17;
const TAG_OBJECT: u8 = 18;

/// One decoded tagged value. Keeps the original width information so
/// encode/decode round-trips are lossless.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Text(String),
    BoolArray(Vec<bool>),
    ByteArray(Vec<i8>),
    ShortArray(Vec<i16>),
    IntArray(Vec<i32>),
    LongArray(Vec<i64>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    TextArray(Vec<String>),
    List(Vec<FieldValue>),
    Object(Vec<(String, FieldValue)>),
}

impl FieldValue {
    /// Lower the typed tree into the JSON value model used everywhere
    /// downstream of the decoder.
    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => json!(b),
            FieldValue::Byte(v) => json!(v),
            FieldValue::Short(v) => json!(v),
            FieldValue::Int(v) => json!(v),
            FieldValue::Long(v) => json!(v),
            FieldValue::Float(v) => float_json(*v as f64),
            FieldValue::Double(v) => float_json(*v),
            FieldValue::Text(s) => json!(s),
            FieldValue::BoolArray(v) => json!(v),
            FieldValue::ByteArray(v) => json!(v),
            FieldValue::ShortArray(v) => json!(v),
            FieldValue::IntArray(v) => json!(v),
            FieldValue::LongArray(v) => json!(v),
            FieldValue::FloatArray(v) => {
                Value::Array(v.iter().map(|f| float_json(*f as f64)).collect())
            }
            FieldValue::DoubleArray(v) => {
                Value::Array(v.iter().map(|f| float_json(*f)).collect())
            }
            FieldValue::TextArray(v) => json!(v),
            FieldValue::List(items) => {
                Value::Array(items.iter().map(FieldValue::to_json).collect())
            }
            FieldValue::Object(fields) => {
                let mut map = serde_json::Map::with_capacity(fields.len());
                for (key, value) in fields {
                    map.insert(key.clone(), value.to_json());
                }
                Value::Object(map)
            }
        }
    }
}

fn float_json(v: f64) -> Value {
    serde_json::Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

/// True when the buffer carries this format's frame signature: header top
/// bit set, consistent body length, and a body opening with the zlib magic
/// or a composite tag. Used by the auto-detecting dispatcher.
pub fn looks_like_frame(bytes: &[u8]) -> bool {
    if bytes.len() < 4 || bytes[0] & HEADER_BINARY == 0 {
        return false;
    }
    let body_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    if body_len != bytes.len() - 3 {
        return false;
    }
    matches!(bytes[3], ZLIB_MAGIC | TAG_OBJECT | TAG_LIST)
}

/// Decode one full frame into a typed value tree.
pub fn decode_frame(bytes: &[u8]) -> Result<FieldValue, DecodeError> {
    if bytes.len() < 3 {
        return Err(DecodeError::Truncated);
    }
    if bytes[0] & HEADER_BINARY == 0 {
        return Err(DecodeError::BadHeader(bytes[0]));
    }
    let body_len = u16::from_be_bytes([bytes[1], bytes[2]]) as usize;
    let body = &bytes[3..];
    if body.len() != body_len {
        return Err(DecodeError::LengthMismatch {
            declared: body_len,
            actual: body.len(),
        });
    }

    let inflated;
    let body = if body.first() == Some(&ZLIB_MAGIC) {
        inflated = inflate(body)?;
        &inflated[..]
    } else {
        body
    };

    let mut cursor = Cursor::new(body);
    let value = decode_value(&mut cursor, 0)?;
    if !cursor.is_empty() {
        return Err(DecodeError::TrailingBytes(cursor.remaining()));
    }
    Ok(value)
}

/// Encode one value into a full frame. `compress` deflates the body,
/// producing the canonical compressed frame shape (0x80, len, 0x78, ...).
pub fn encode_frame(value: &FieldValue, compress: bool) -> Vec<u8> {
    let mut body = Vec::new();
    encode_value(value, &mut body);
    if compress {
        use flate2::{write::ZlibEncoder, Compression};
        use std::io::Write;
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        // Writing to a Vec cannot fail
        encoder.write_all(&body).expect("zlib encode");
        body = encoder.finish().expect("zlib finish");
    }
    let mut frame = Vec::with_capacity(3 + body.len());
    frame.push(HEADER_BINARY);
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    frame
}

fn inflate(body: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    let mut decoder = ZlibDecoder::new(body).take(MAX_INFLATED);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Inflate(e.to_string()))?;
    Ok(out)
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

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn f32(&mut self) -> Result<f32, DecodeError> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        let b = self.take(8)?;
        Ok(f64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn text(&mut self) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

fn decode_value(cursor: &mut Cursor, depth: usize) -> Result<FieldValue, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::DepthExceeded);
    }
    let tag = cursor.u8()?;
    let value = match tag {
        TAG_NULL => FieldValue::Null,
        TAG_BOOL => FieldValue::Bool(cursor.u8()? != 0),
        TAG_BYTE => FieldValue::Byte(cursor.i8()?),
        TAG_SHORT => FieldValue::Short(cursor.i16()?),
        TAG_INT => FieldValue::Int(cursor.i32()?),
        TAG_LONG => FieldValue::Long(cursor.i64()?),
        TAG_FLOAT => FieldValue::Float(cursor.f32()?),
        TAG_DOUBLE => FieldValue::Double(cursor.f64()?),
        TAG_TEXT => FieldValue::Text(cursor.text()?),
        TAG_BOOL_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.u8()? != 0);
            }
            FieldValue::BoolArray(items)
        }
        TAG_BYTE_ARRAY => {
            let count = cursor.u16()? as usize;
            let raw = cursor.take(count)?;
            FieldValue::ByteArray(raw.iter().map(|b| *b as i8).collect())
        }
        TAG_SHORT_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.i16()?);
            }
            FieldValue::ShortArray(items)
        }
        TAG_INT_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.i32()?);
            }
            FieldValue::IntArray(items)
        }
        TAG_LONG_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.i64()?);
            }
            FieldValue::LongArray(items)
        }
        TAG_FLOAT_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.f32()?);
            }
            FieldValue::FloatArray(items)
        }
        TAG_DOUBLE_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.f64()?);
            }
            FieldValue::DoubleArray(items)
        }
        TAG_TEXT_ARRAY => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(cursor.text()?);
            }
            FieldValue::TextArray(items)
        }
        TAG_LIST => {
            let count = cursor.u16()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(cursor, depth + 1)?);
            }
            FieldValue::List(items)
        }
        TAG_OBJECT => {
            let count = cursor.u16()? as usize;
            let mut fields = Vec::with_capacity(count);
            for _ in 0..count {
                let key = cursor.text()?;
                let value = decode_value(cursor, depth + 1)?;
                fields.push((key, value));
            }
            FieldValue::Object(fields)
        }
        other => return Err(DecodeError::UnknownTag(other)),
    };
    Ok(value)
}

fn encode_value(value: &FieldValue, out: &mut Vec<u8>) {
    match value {
        FieldValue::Null => out.push(TAG_NULL),
        FieldValue::Bool(b) => {
            out.push(TAG_BOOL);
            out.push(*b as u8);
        }
        FieldValue::Byte(v) => {
            out.push(TAG_BYTE);
            out.push(*v as u8);
        }
        FieldValue::Short(v) => {
            out.push(TAG_SHORT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldValue::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldValue::Long(v) => {
            out.push(TAG_LONG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldValue::Float(v) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldValue::Double(v) => {
            out.push(TAG_DOUBLE);
            out.extend_from_slice(&v.to_be_bytes());
        }
        FieldValue::Text(s) => {
            out.push(TAG_TEXT);
            encode_text(s, out);
        }
        FieldValue::BoolArray(items) => {
            out.push(TAG_BOOL_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            out.extend(items.iter().map(|b| *b as u8));
        }
        FieldValue::ByteArray(items) => {
            out.push(TAG_BYTE_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            out.extend(items.iter().map(|b| *b as u8));
        }
        FieldValue::ShortArray(items) => {
            out.push(TAG_SHORT_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for v in items {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        FieldValue::IntArray(items) => {
            out.push(TAG_INT_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for v in items {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        FieldValue::LongArray(items) => {
            out.push(TAG_LONG_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for v in items {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        FieldValue::FloatArray(items) => {
            out.push(TAG_FLOAT_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for v in items {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        FieldValue::DoubleArray(items) => {
            out.push(TAG_DOUBLE_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for v in items {
                out.extend_from_slice(&v.to_be_bytes());
            }
        }
        FieldValue::TextArray(items) => {
            out.push(TAG_TEXT_ARRAY);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for s in items {
                encode_text(s, out);
            }
        }
        FieldValue::List(items) => {
            out.push(TAG_LIST);
            out.extend_from_slice(&(items.len() as u16).to_be_bytes());
            for item in items {
                encode_value(item, out);
            }
        }
        FieldValue::Object(fields) => {
            out.push(TAG_OBJECT);
            out.extend_from_slice(&(fields.len() as u16).to_be_bytes());
            for (key, value) in fields {
                encode_text(key, out);
                encode_value(value, out);
            }
        }
    }
}

fn encode_text(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u16).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: FieldValue) {
        let plain = encode_frame(&value, false);
        assert_eq!(decode_frame(&plain).unwrap(), value);
        let compressed = encode_frame(&value, true);
        assert_eq!(decode_frame(&compressed).unwrap(), value);
    }

    #[test]
    fn test_roundtrip_primitives() {
        roundtrip(FieldValue::Null);
        roundtrip(FieldValue::Bool(true));
        roundtrip(FieldValue::Byte(-5));
        roundtrip(FieldValue::Short(-1234));
        roundtrip(FieldValue::Int(7_654_321));
        roundtrip(FieldValue::Long(-9_876_543_210));
        roundtrip(FieldValue::Float(1.5));
        roundtrip(FieldValue::Double(2.71828));
        roundtrip(FieldValue::Text("crash".to_string()));
    }

    #[test]
    fn test_roundtrip_primitive_arrays() {
        roundtrip(FieldValue::BoolArray(vec![true, false, true]));
        roundtrip(FieldValue::ByteArray(vec![-1, 0, 127]));
        roundtrip(FieldValue::ShortArray(vec![1, -2, 300]));
        roundtrip(FieldValue::IntArray(vec![100_000, -100_000]));
        roundtrip(FieldValue::LongArray(vec![i64::MIN, 0, i64::MAX]));
        roundtrip(FieldValue::FloatArray(vec![0.5, -0.25]));
        roundtrip(FieldValue::DoubleArray(vec![1.01, 2.02, 3.03]));
        roundtrip(FieldValue::TextArray(vec!["a".into(), "bb".into()]));
    }

    #[test]
    fn test_roundtrip_nested_composites() {
        let value = FieldValue::Object(vec![
            (
                "p".to_string(),
                FieldValue::Object(vec![
                    ("roundId".to_string(), FieldValue::Text("r-77".to_string())),
                    ("maxMultiplier".to_string(), FieldValue::Double(3.07)),
                    (
                        "cashouts".to_string(),
                        FieldValue::List(vec![FieldValue::Object(vec![
                            ("player".to_string(), FieldValue::Text("u1".to_string())),
                            ("bet".to_string(), FieldValue::Double(10.0)),
                        ])]),
                    ),
                ]),
            ),
            ("c".to_string(), FieldValue::Byte(1)),
        ]);
        roundtrip(value);
    }

    #[test]
    fn test_header_top_bit_required() {
        let mut frame = encode_frame(&FieldValue::Null, false);
        frame[0] = 0x01;
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::BadHeader(0x01))
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut frame = encode_frame(&FieldValue::Bool(true), false);
        frame[2] = frame[2].wrapping_add(1);
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        // header + len 1 + bogus tag
        let frame = [0x80, 0x00, 0x01, 0x63];
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::UnknownTag(0x63))
        ));
    }

    #[test]
    fn test_corrupt_zlib_body_rejected() {
        // Body starts with the zlib magic but carries garbage
        let frame = [0x80, 0x00, 0x04, 0x78, 0x01, 0xff, 0xff];
        assert!(matches!(
            decode_frame(&frame),
            Err(DecodeError::Inflate(_))
        ));
    }

    #[test]
    fn test_compressed_frame_signature() {
        let frame = encode_frame(&FieldValue::Object(vec![]), true);
        assert_eq!(frame[0], 0x80);
        assert_eq!(frame[3], 0x78);
        assert!(looks_like_frame(&frame));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        assert!(matches!(decode_frame(&[0x80]), Err(DecodeError::Truncated)));
        assert!(matches!(decode_frame(&[]), Err(DecodeError::Truncated)));
    }
}
