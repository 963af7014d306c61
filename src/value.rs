//! The reply value tree. Deliberately small: the tokenizer is an external
//! collaborator per spec §1, so this only needs to model what it hands back.

use crate::error::ReplyError;
use std::collections::HashMap;

/// A parsed RESP reply. RESP3 adds a handful of variants (`Push`, `Double`,
/// `Boolean`, `Map`) that collapse cleanly onto the RESP2 `Array`-shaped
/// handling spec §4.5/§4.6 describe; see `SPEC_FULL.md` §4.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Okay,
    SimpleString(String),
    Int(i64),
    BulkString(Vec<u8>),
    Array(Vec<Value>),
    /// RESP3 out-of-band push frame (`>`). Routed through the same pub/sub
    /// overlay as a RESP2 array push (spec §4.5).
    Push(Vec<Value>),
    /// RESP3 map (`%`). Not produced over RESP2.
    Map(Vec<(Value, Value)>),
    Double(f64),
    Boolean(bool),
    /// A `-` reply nested inside an `Array`/`Push` (e.g. one failed command
    /// inside a transaction result). Top-level errors are instead surfaced
    /// as `Err(ReplyError)` directly — see `Frame`.
    ServerError(Box<ReplyError>),
}

impl Value {
    /// Promotes a top-level `ServerError` into `Err`, leaving everything
    /// else untouched. Mirrors the teacher's `Value::extract_error` used to
    /// collapse a single-command reply that turned out to be an error.
    pub fn extract_error(self) -> Result<Value, ReplyError> {
        match self {
            Value::ServerError(err) => Err(*err),
            other => Ok(other),
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) | Value::Push(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) | Value::Push(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_bulk_string(&self) -> Option<&[u8]> {
        match self {
            Value::BulkString(bytes) => Some(bytes),
            Value::SimpleString(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::SimpleString(s) => Some(s.as_str()),
            Value::BulkString(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::BulkString(bytes) => std::str::from_utf8(bytes).ok()?.parse().ok(),
            Value::SimpleString(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Converts bulk strings anywhere in the tree to their UTF-8 text form.
    /// Used by the dispatcher when `detect_buffers` is on and the
    /// originating command carried no binary argument segments (spec §4.6).
    pub fn detect_buffers_to_text(self) -> Value {
        match self {
            Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::detect_buffers_to_text).collect())
            }
            Value::Push(items) => {
                Value::Push(items.into_iter().map(Value::detect_buffers_to_text).collect())
            }
            other => other,
        }
    }

    /// Flattens an even-length array reply into a key→value map, as
    /// `HGETALL` replies require (spec §4.6). Returns the original value
    /// unchanged if it is not an even-length array.
    pub fn hgetall_to_map(self) -> Value {
        match self {
            Value::Array(items) if items.len() % 2 == 0 => {
                let mut pairs = Vec::with_capacity(items.len() / 2);
                let mut iter = items.into_iter();
                while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
                    pairs.push((k, v));
                }
                Value::Map(pairs)
            }
            other => other,
        }
    }

    /// Renders the map-shaped `Value::Map` into a `HashMap<String, String>`,
    /// used by callers who want `INFO`-style string maps without threading
    /// `Value` through their own code.
    pub fn into_string_map(self) -> Option<HashMap<String, String>> {
        let pairs = match self {
            Value::Map(pairs) => pairs,
            Value::Array(items) if items.len() % 2 == 0 => {
                if let Value::Map(pairs) = Value::Array(items).hgetall_to_map() {
                    pairs
                } else {
                    return None;
                }
            }
            _ => return None,
        };
        let mut map = HashMap::with_capacity(pairs.len());
        for (k, v) in pairs {
            map.insert(k.as_str()?.to_string(), v.as_str().unwrap_or_default().to_string());
        }
        Some(map)
    }
}

/// What the reply parser yields for a single frame: either a value or a
/// `-`-prefixed server error (spec §4.6).
pub type Frame = Result<Value, ReplyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_even_length_array() {
        let v = Value::Array(vec![
            Value::BulkString(b"a".to_vec()),
            Value::BulkString(b"1".to_vec()),
            Value::BulkString(b"b".to_vec()),
            Value::BulkString(b"2".to_vec()),
        ]);
        let map = v.hgetall_to_map().into_string_map().unwrap();
        assert_eq!(map.get("a").map(String::as_str), Some("1"));
        assert_eq!(map.get("b").map(String::as_str), Some("2"));
    }

    #[test]
    fn odd_length_array_is_untouched() {
        let v = Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        let out = v.clone().hgetall_to_map();
        assert_eq!(out, v);
    }
}
