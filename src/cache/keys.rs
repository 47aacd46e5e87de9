//! Key canonicalization and hashing
//!
//! Logically equal inputs must hash identically: object keys are ordered,
//! integral floats collapse to integers, strings are trimmed.

use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;

/// Deterministic normal form of a parameter payload
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.trim().to_string(), v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        Value::Number(n) => Value::Number(normalize_number(n)),
        Value::String(s) => Value::String(s.trim().to_string()),
        other => other.clone(),
    }
}

fn normalize_number(n: &Number) -> Number {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                return Number::from(f as i64);
            }
        }
    }
    n.clone()
}

/// Workflow key payload normalisation.
///
/// - `ticker` / `symbol`: trimmed, upper-cased
/// - `tickers` / `symbols`: each upper-cased, de-duplicated, sorted
/// - `query`: lower-cased, trimmed, inner whitespace collapsed
pub fn normalize_key_payload(payload: &Value) -> Value {
    let Value::Object(map) = payload else {
        return canonicalize(payload);
    };

    let mut out = Map::new();
    for (key, value) in map {
        let normalized = match (key.as_str(), value) {
            ("ticker" | "symbol", Value::String(s)) => Value::String(normalize_symbol(s)),
            ("tickers" | "symbols", Value::Array(items)) => {
                let mut symbols: Vec<String> = items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(normalize_symbol)
                    .filter(|s| !s.is_empty())
                    .collect();
                symbols.sort();
                symbols.dedup();
                Value::Array(symbols.into_iter().map(Value::String).collect())
            }
            ("query", Value::String(s)) => Value::String(normalize_text(s)),
            _ => value.clone(),
        };
        out.insert(key.clone(), normalized);
    }

    canonicalize(&Value::Object(out))
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().trim_start_matches('$').to_uppercase()
}

pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// SHA-256 hex of the canonical JSON form
pub fn hash_value(value: &Value) -> String {
    let mut hasher = Sha256::new();

    // Stream JSON directly into hasher (no intermediate String)
    if serde_json::to_writer(&mut HashWriter(&mut hasher), &canonicalize(value)).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Composite key hash for `(tool_name, parameters)`
pub fn tool_key_hash(tool_name: &str, parameters: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.trim().as_bytes());
    hasher.update(b"|");

    if serde_json::to_writer(&mut HashWriter(&mut hasher), &canonicalize(parameters)).is_err() {
        return String::new();
    }

    hex::encode(hasher.finalize())
}

/// Content hash of a request text
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.trim().as_bytes()))
}

/// Adapter to allow writing into Sha256 via std::io::Write
struct HashWriter<'a, H: Digest>(&'a mut H);

impl<'a, H: Digest> Write for HashWriter<'a, H> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
