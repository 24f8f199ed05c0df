//! Payload primitives
//!
//! Little-endian encoders and `(buffer, index) -> (value, next_index)`
//! decoders for the fields carried inside command payloads.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{ProtocolError, ProtocolResult};

fn take<'a>(buffer: &'a [u8], index: usize, needed: usize) -> ProtocolResult<&'a [u8]> {
    let end = index.checked_add(needed).filter(|end| *end <= buffer.len());
    match end {
        Some(end) => Ok(&buffer[index..end]),
        None => Err(ProtocolError::Truncated {
            offset: index,
            needed,
            available: buffer.len().saturating_sub(index),
        }),
    }
}

/// Encode a signed 32-bit integer
pub fn encode_int(value: i32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a signed 32-bit integer
pub fn decode_int(buffer: &[u8], index: usize) -> ProtocolResult<(i32, usize)> {
    let bytes = take(buffer, index, 4)?;
    let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((value, index + 4))
}

/// Encode a boolean as a 32-bit integer
pub fn encode_bool(value: bool) -> Vec<u8> {
    encode_int(i32::from(value))
}

/// Decode a boolean encoded as a 32-bit integer
pub fn decode_bool(buffer: &[u8], index: usize) -> ProtocolResult<(bool, usize)> {
    let (value, index) = decode_int(buffer, index)?;
    Ok((value != 0, index))
}

/// Encode a 32-bit float
pub fn encode_float(value: f32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a 32-bit float
pub fn decode_float(buffer: &[u8], index: usize) -> ProtocolResult<(f32, usize)> {
    let bytes = take(buffer, index, 4)?;
    let value = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    Ok((value, index + 4))
}

/// Encode a 64-bit float
pub fn encode_double(value: f64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

/// Decode a 64-bit float
pub fn decode_double(buffer: &[u8], index: usize) -> ProtocolResult<(f64, usize)> {
    let bytes = take(buffer, index, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok((f64::from_le_bytes(raw), index + 8))
}

/// Encode a sequence of doubles without a length prefix
pub fn encode_doubles(values: &[f64]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(values.len() * 8);
    for value in values {
        buffer.extend_from_slice(&value.to_le_bytes());
    }
    buffer
}

/// Decode `count` doubles
pub fn decode_doubles(buffer: &[u8], index: usize, count: usize) -> ProtocolResult<(Vec<f64>, usize)> {
    take(buffer, index, count.saturating_mul(8))?;
    let mut values = Vec::with_capacity(count);
    let mut index = index;
    for _ in 0..count {
        let (value, next) = decode_double(buffer, index)?;
        values.push(value);
        index = next;
    }
    Ok((values, index))
}

/// Encode a UTF-8 string with an i32 byte-length prefix
pub fn encode_string(value: &str) -> Vec<u8> {
    let bytes = value.as_bytes();
    let mut buffer = Vec::with_capacity(4 + bytes.len());
    buffer.extend_from_slice(&(bytes.len() as i32).to_le_bytes());
    buffer.extend_from_slice(bytes);
    buffer
}

/// Decode a length-prefixed UTF-8 string
pub fn decode_string(buffer: &[u8], index: usize) -> ProtocolResult<(String, usize)> {
    let (length, index) = decode_int(buffer, index)?;
    if length < 0 {
        return Err(ProtocolError::NegativeLength(length));
    }
    let length = length as usize;
    let bytes = take(buffer, index, length)?;
    let value = String::from_utf8(bytes.to_vec())?;
    Ok((value, index + length))
}

/// Encode a list of strings with an i32 count prefix
pub fn encode_string_list(values: &[String]) -> Vec<u8> {
    let mut buffer = encode_int(values.len() as i32);
    for value in values {
        buffer.extend(encode_string(value));
    }
    buffer
}

/// Decode a count-prefixed list of strings
pub fn decode_string_list(buffer: &[u8], index: usize) -> ProtocolResult<(Vec<String>, usize)> {
    let (count, mut index) = decode_int(buffer, index)?;
    if count < 0 {
        return Err(ProtocolError::NegativeLength(count));
    }
    // Every entry takes at least its 4-byte length prefix
    let capacity = (count as usize).min(buffer.len().saturating_sub(index) / 4);
    let mut values = Vec::with_capacity(capacity);
    for _ in 0..count {
        let (value, next) = decode_string(buffer, index)?;
        values.push(value);
        index = next;
    }
    Ok((values, index))
}

/// Encode a JSON document as a length-prefixed string
pub fn encode_json<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let text = serde_json::to_string(value)?;
    Ok(encode_string(&text))
}

/// Decode a JSON document encoded with [`encode_json`]
pub fn decode_json<T: DeserializeOwned>(buffer: &[u8], index: usize) -> ProtocolResult<(T, usize)> {
    let (text, index) = decode_string(buffer, index)?;
    let value = serde_json::from_str(&text)?;
    Ok((value, index))
}

/// Encode a binary body with bincode, prefixed by its target path.
///
/// The leading path lets the server read [`crate::Command::target_path`]
/// without knowing the body layout.
pub fn encode_targeted<T: Serialize + ?Sized>(path: &str, body: &T) -> ProtocolResult<Vec<u8>> {
    let mut buffer = encode_string(path);
    buffer.extend(bincode::serialize(body)?);
    Ok(buffer)
}

/// Decode a payload produced by [`encode_targeted`]
pub fn decode_targeted<T: DeserializeOwned>(buffer: &[u8]) -> ProtocolResult<(String, T)> {
    let (path, index) = decode_string(buffer, 0)?;
    let body = bincode::deserialize(&buffer[index..])?;
    Ok((path, body))
}
