//! Canonical CBOR encoding for deterministic serialization.
//!
//! This module implements RFC 8949 Core Deterministic Encoding with one
//! deliberate simplification for floats:
//! - Map keys sorted by encoded byte comparison
//! - Integers use smallest valid encoding
//! - Definite lengths only
//! - Floats are always encoded as 64-bit (`0xfb`), with `-0.0` folded to `0.0`
//!   and non-finite values rejected
//!
//! Seals are computed over these bytes, so the same logical content must
//! produce identical bytes on every platform.

use ciborium::value::{Integer, Value};

use crate::error::{CoreError, Result};

/// Convert a JSON value into a CBOR value.
///
/// Unsigned and signed integers stay integers; every other number becomes a
/// float. `80` and `80.0` therefore canonicalize differently.
pub fn json_to_cbor(value: &serde_json::Value) -> Result<Value> {
    Ok(match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::Integer(u.into())
            } else if let Some(i) = n.as_i64() {
                Value::Integer(i.into())
            } else {
                let f = n
                    .as_f64()
                    .ok_or_else(|| CoreError::NonCanonicalValue(n.to_string()))?;
                Value::Float(f)
            }
        }
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Array(items) => Value::Array(
            items
                .iter()
                .map(json_to_cbor)
                .collect::<Result<Vec<_>>>()?,
        ),
        serde_json::Value::Object(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (k, v) in map {
                entries.push((Value::Text(k.clone()), json_to_cbor(v)?));
            }
            Value::Map(entries)
        }
    })
}

/// Encode a JSON value to canonical CBOR bytes.
pub fn canonical_json_bytes(value: &serde_json::Value) -> Result<Vec<u8>> {
    encode_canonical(&json_to_cbor(value)?)
}

/// Encode a CBOR value to canonical bytes.
pub fn encode_canonical(value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_value_to(&mut buf, value)?;
    Ok(buf)
}

/// Recursively encode a CBOR value.
fn encode_value_to(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Integer(i) => encode_integer(buf, *i),
        Value::Bytes(b) => encode_bytes(buf, b),
        Value::Text(s) => encode_text(buf, s),
        Value::Array(arr) => {
            encode_uint(buf, 4, arr.len() as u64);
            for item in arr {
                encode_value_to(buf, item)?;
            }
        }
        Value::Map(entries) => encode_map_canonical(buf, entries)?,
        Value::Bool(b) => buf.push(if *b { 0xf5 } else { 0xf4 }),
        Value::Null => buf.push(0xf6),
        Value::Float(f) => encode_float(buf, *f)?,
        other => {
            return Err(CoreError::NonCanonicalValue(format!(
                "unsupported CBOR value: {:?}",
                other
            )))
        }
    }
    Ok(())
}

/// Encode a CBOR integer (major types 0 and 1).
fn encode_integer(buf: &mut Vec<u8>, i: Integer) {
    let n: i128 = i.into();

    if n >= 0 {
        encode_uint(buf, 0, n as u64);
    } else {
        // CBOR encodes -1 as 0, -2 as 1, etc.
        encode_uint(buf, 1, (-1 - n) as u64);
    }
}

/// Encode an unsigned integer with the given major type.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}

/// Encode a float as a 64-bit CBOR float.
fn encode_float(buf: &mut Vec<u8>, f: f64) -> Result<()> {
    if !f.is_finite() {
        return Err(CoreError::NonCanonicalValue(format!("non-finite float {}", f)));
    }
    let f = if f == 0.0 { 0.0 } else { f };
    buf.push(0xfb);
    buf.extend_from_slice(&f.to_bits().to_be_bytes());
    Ok(())
}

/// Encode a byte string (major type 2).
fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    encode_uint(buf, 2, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

/// Encode a text string (major type 3).
fn encode_text(buf: &mut Vec<u8>, s: &str) {
    encode_uint(buf, 3, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Encode a map canonically (major type 5).
///
/// Keys are sorted by their encoded byte comparison. Duplicate keys are
/// rejected since they would make the encoding ambiguous.
fn encode_map_canonical(buf: &mut Vec<u8>, entries: &[(Value, Value)]) -> Result<()> {
    let mut pairs: Vec<(Vec<u8>, &Value)> = Vec::with_capacity(entries.len());
    for (k, v) in entries {
        let mut key_buf = Vec::new();
        encode_value_to(&mut key_buf, k)?;
        pairs.push((key_buf, v));
    }

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    if pairs.windows(2).any(|w| w[0].0 == w[1].0) {
        return Err(CoreError::NonCanonicalValue("duplicate map key".into()));
    }

    encode_uint(buf, 5, pairs.len() as u64);
    for (key_bytes, value) in pairs {
        buf.extend_from_slice(&key_bytes);
        encode_value_to(buf, value)?;
    }
    Ok(())
}
