//! Row encoders turning processor output into the wire bytes the bulk
//! insert interface accepts.
//!
//! Ordinary inserts become one newline-terminated JSON object per row;
//! aggregate inserts become one tab-separated tuple per row, following the
//! storage's writable-column order.

use anyhow::{Context, Result};
use serde_json::Value;

/// Encodes a row as a newline-terminated JSON object.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRowEncoder;

impl JsonRowEncoder {
    pub fn encode(&self, row: &Value) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(row)?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// Encodes a row as a tab-separated tuple over a fixed column order.
///
/// Missing columns encode as NULL. Nested values are serialized to JSON
/// strings before escaping.
#[derive(Debug, Clone)]
pub struct ValuesRowEncoder {
    columns: Vec<String>,
}

impl ValuesRowEncoder {
    pub fn new(columns: &[String]) -> Self {
        ValuesRowEncoder {
            columns: columns.to_vec(),
        }
    }

    pub fn encode(&self, row: &Value) -> Result<Vec<u8>> {
        let object = row
            .as_object()
            .context("aggregate insert row must be a JSON object")?;

        let mut out = Vec::new();
        for (index, column) in self.columns.iter().enumerate() {
            if index > 0 {
                out.push(b'\t');
            }
            encode_value(object.get(column).unwrap_or(&Value::Null), &mut out)?;
        }
        out.push(b'\n');
        Ok(out)
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => out.extend_from_slice(b"\\N"),
        Value::Bool(b) => out.push(if *b { b'1' } else { b'0' }),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => escape_into(s, out),
        nested => escape_into(&serde_json::to_string(nested)?, out),
    }
    Ok(())
}

// Tab-separated escaping: the delimiters themselves and the backslash.
fn escape_into(s: &str, out: &mut Vec<u8>) {
    for byte in s.bytes() {
        match byte {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'\t' => out.extend_from_slice(b"\\t"),
            b'\n' => out.extend_from_slice(b"\\n"),
            b'\r' => out.extend_from_slice(b"\\r"),
            other => out.push(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_rows_are_newline_terminated() {
        let encoded = JsonRowEncoder.encode(&json!({"a": 1})).unwrap();
        assert_eq!(encoded, b"{\"a\":1}\n");
    }

    #[test]
    fn values_rows_follow_column_order() {
        let encoder = ValuesRowEncoder::new(&[
            "b".to_string(),
            "a".to_string(),
            "missing".to_string(),
        ]);
        let encoded = encoder
            .encode(&json!({"a": 1, "b": "two", "ignored": true}))
            .unwrap();
        assert_eq!(encoded, b"two\t1\t\\N\n");
    }

    #[test]
    fn values_rows_escape_delimiters() {
        let encoder = ValuesRowEncoder::new(&["s".to_string()]);
        let encoded = encoder.encode(&json!({"s": "a\tb\nc\\d"})).unwrap();
        assert_eq!(encoded, b"a\\tb\\nc\\\\d\n");
    }

    #[test]
    fn values_rows_serialize_nested_values() {
        let encoder = ValuesRowEncoder::new(&["tags".to_string(), "ok".to_string()]);
        let encoded = encoder
            .encode(&json!({"tags": ["x", "y"], "ok": true}))
            .unwrap();
        assert_eq!(encoded, b"[\"x\",\"y\"]\t1\n");
    }

    #[test]
    fn values_rows_reject_non_objects() {
        let encoder = ValuesRowEncoder::new(&["a".to_string()]);
        assert!(encoder.encode(&json!([1, 2])).is_err());
    }
}
