//! Hashing System - Canonical Encoding + SHA-256
//!
//! The canonical encoding is the byte-exact input to every fingerprint and
//! signature. Encoding rules:
//! - object keys sorted bytewise, no whitespace
//! - strings JSON-escaped
//! - integers printed as integers
//! - floats rounded to 6 decimals, trailing zeros and `.` stripped, `-0` → `0`
//!
//! So `40`, `40.0` and `40.0000001` all encode as `40`.

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

const FLOAT_DECIMALS: usize = 6;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace, stable numbers)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&v, &mut out)?;
    Ok(out)
}

/// SHA-256 of the canonical encoding
pub fn fingerprint<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

fn write_value(v: &Value, out: &mut String) -> Result<(), serde_json::Error> {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_value(v, out)?;
            }
            out.push('}');
        }
        Value::Array(arr) => {
            out.push('[');
            for (i, v) in arr.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(v, out)?;
            }
            out.push(']');
        }
        Value::Number(n) => out.push_str(&format_number(n)),
        Value::String(s) => out.push_str(&serde_json::to_string(s)?),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
    Ok(())
}

fn format_number(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    // serde_json never produces non-finite numbers
    format_float(n.as_f64().unwrap_or(0.0))
}

pub(crate) fn format_float(f: f64) -> String {
    let s = format!("{:.*}", FLOAT_DECIMALS, f);
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s == "-0" || s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}
