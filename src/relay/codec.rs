//! Wire-frame decoding for device connections.
//!
//! Machines send binary MessagePack frames — and batch **multiple** messages
//! into one frame when the radio buffers back up — so the binary path is a
//! streaming multi-decode that yields every message in order. Older firmware
//! sends one JSON object per text frame; that path is kept for compatibility.
//! Everything is normalized to `serde_json::Value` tagged maps before it
//! enters the relay plane.

use std::io::Cursor;

use serde_json::{json, Value};

/// Check a device id against the `BRW-XXXXXXXX` shape (8 hex chars,
/// case-insensitive).
pub fn valid_device_id(id: &str) -> bool {
    let b = id.as_bytes();
    b.len() == 12
        && b[..4].eq_ignore_ascii_case(b"BRW-")
        && b[4..].iter().all(u8::is_ascii_hexdigit)
}

/// Canonical registry form of a device id.
pub fn canonical_device_id(id: &str) -> String {
    id.to_ascii_uppercase()
}

/// Decode a binary MessagePack frame into one or more messages, in order.
///
/// The multi-decode pass reads values until the cursor is exhausted. If it
/// fails outright, a single-message decode is attempted with trailing bytes
/// ignored (the "extra bytes" case a single decoder would reject).
pub fn decode_binary(bytes: &[u8]) -> Result<Vec<Value>, String> {
    match decode_multi(bytes) {
        Ok(messages) => Ok(messages),
        Err(multi_err) => {
            let mut cursor = Cursor::new(bytes);
            match rmpv::decode::read_value(&mut cursor) {
                Ok(value) => Ok(vec![into_message(value)?]),
                Err(_) => Err(multi_err),
            }
        }
    }
}

fn decode_multi(bytes: &[u8]) -> Result<Vec<Value>, String> {
    if bytes.is_empty() {
        return Err("empty binary frame".to_string());
    }
    let mut cursor = Cursor::new(bytes);
    let mut messages = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| format!("MessagePack decode failed at offset {}: {e}", cursor.position()))?;
        messages.push(into_message(value)?);
    }
    Ok(messages)
}

/// Decode a legacy text frame: a single UTF-8 JSON object.
pub fn decode_text(text: &str) -> Result<Value, String> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| format!("JSON decode failed: {e}"))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("message is not a JSON object".to_string())
    }
}

fn into_message(value: rmpv::Value) -> Result<Value, String> {
    let converted = msgpack_to_json(value);
    if converted.is_object() {
        Ok(converted)
    } else {
        Err("message is not a map".to_string())
    }
}

/// Convert a MessagePack value to JSON. Device payloads are maps of scalars;
/// binary blobs become byte arrays and ext values are dropped to null.
fn msgpack_to_json(value: rmpv::Value) -> Value {
    match value {
        rmpv::Value::Nil => Value::Null,
        rmpv::Value::Boolean(b) => json!(b),
        rmpv::Value::Integer(i) => {
            if let Some(n) = i.as_i64() {
                json!(n)
            } else if let Some(n) = i.as_u64() {
                json!(n)
            } else {
                Value::Null
            }
        }
        rmpv::Value::F32(f) => float_to_json(f64::from(f)),
        rmpv::Value::F64(f) => float_to_json(f),
        rmpv::Value::String(s) => {
            Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        rmpv::Value::Binary(bytes) => Value::Array(bytes.into_iter().map(|b| json!(b)).collect()),
        rmpv::Value::Array(items) => {
            Value::Array(items.into_iter().map(msgpack_to_json).collect())
        }
        rmpv::Value::Map(entries) => {
            let mut map = serde_json::Map::with_capacity(entries.len());
            for (key, val) in entries {
                let key = match key {
                    rmpv::Value::String(s) => {
                        String::from_utf8_lossy(s.as_bytes()).into_owned()
                    }
                    other => msgpack_to_json(other).to_string(),
                };
                map.insert(key, msgpack_to_json(val));
            }
            Value::Object(map)
        }
        rmpv::Value::Ext(..) => Value::Null,
    }
}

fn float_to_json(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}
