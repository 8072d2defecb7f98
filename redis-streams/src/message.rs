use std::collections::HashMap;
use std::fmt;

use crate::StreamError;

/// Field values of a single stream entry. Field names are unique.
pub type Values = HashMap<String, StreamValue>;

/// A loosely typed scalar held in a stream entry field.
///
/// Redis stores every field as a byte string, so values are not re-typed on the way
/// back: writing `Int(5)` reads back as `String("5")`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Bytes(Vec<u8>),
}

impl StreamValue {
    /// Bytes sent to the store for this value.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        match self {
            StreamValue::String(s) => s.as_bytes().to_vec(),
            StreamValue::Int(i) => i.to_string().into_bytes(),
            StreamValue::Float(f) => f.to_string().into_bytes(),
            StreamValue::Bool(true) => b"1".to_vec(),
            StreamValue::Bool(false) => b"0".to_vec(),
            StreamValue::Bytes(b) => b.clone(),
        }
    }

    /// Value for bytes read back from the store: UTF-8 passes through as a string,
    /// anything else stays binary.
    pub fn from_wire_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(s) => StreamValue::String(s),
            Err(e) => StreamValue::Bytes(e.into_bytes()),
        }
    }

    /// Normalize a reply value into a field value, keeping whatever type the server
    /// reported.
    pub fn from_redis_value(value: redis::Value) -> Result<Self, StreamError> {
        match value {
            redis::Value::BulkString(bytes) => Ok(Self::from_wire_bytes(bytes)),
            redis::Value::SimpleString(s) => Ok(StreamValue::String(s)),
            redis::Value::Okay => Ok(StreamValue::String("OK".to_string())),
            redis::Value::Int(i) => Ok(StreamValue::Int(i)),
            redis::Value::Double(f) => Ok(StreamValue::Float(f)),
            redis::Value::Boolean(b) => Ok(StreamValue::Bool(b)),
            other => Err(StreamError::ParseError(format!(
                "unsupported field value: {other:?}"
            ))),
        }
    }
}

impl fmt::Display for StreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamValue::String(s) => write!(f, "{s}"),
            StreamValue::Int(i) => write!(f, "{i}"),
            StreamValue::Float(v) => write!(f, "{v}"),
            StreamValue::Bool(b) => write!(f, "{b}"),
            StreamValue::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<&str> for StreamValue {
    fn from(value: &str) -> Self {
        StreamValue::String(value.to_owned())
    }
}

impl From<String> for StreamValue {
    fn from(value: String) -> Self {
        StreamValue::String(value)
    }
}

impl From<i64> for StreamValue {
    fn from(value: i64) -> Self {
        StreamValue::Int(value)
    }
}

impl From<f64> for StreamValue {
    fn from(value: f64) -> Self {
        StreamValue::Float(value)
    }
}

impl From<bool> for StreamValue {
    fn from(value: bool) -> Self {
        StreamValue::Bool(value)
    }
}

impl From<Vec<u8>> for StreamValue {
    fn from(value: Vec<u8>) -> Self {
        StreamValue::Bytes(value)
    }
}

/// One entry as returned by a group read.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub values: Values,
}

/// The entries a group read returned for one stream, in ID order.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntries {
    pub stream: String,
    pub entries: Vec<StreamEntry>,
}

/// A record delivered to a consumer. `(stream, id)` is the unit of acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub stream: String,
    pub id: String,
    pub values: Values,
}

impl Message {
    pub fn new(stream: impl Into<String>, entry: StreamEntry) -> Self {
        Self {
            stream: stream.into(),
            id: entry.id,
            values: entry.values,
        }
    }

    pub fn get(&self, field: &str) -> Option<&StreamValue> {
        self.values.get(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_bytes_for_each_variant() {
        assert_eq!(StreamValue::from("value").to_wire_bytes(), b"value");
        assert_eq!(StreamValue::Int(-42).to_wire_bytes(), b"-42");
        assert_eq!(StreamValue::Float(1.5).to_wire_bytes(), b"1.5");
        assert_eq!(StreamValue::Bool(true).to_wire_bytes(), b"1");
        assert_eq!(StreamValue::Bool(false).to_wire_bytes(), b"0");
        assert_eq!(
            StreamValue::Bytes(vec![0xff, 0x00]).to_wire_bytes(),
            vec![0xff, 0x00]
        );
    }

    #[test]
    fn test_from_wire_bytes_keeps_utf8_as_string() {
        assert_eq!(
            StreamValue::from_wire_bytes(b"value".to_vec()),
            StreamValue::String("value".to_string())
        );
        // numbers are not re-typed
        assert_eq!(
            StreamValue::from_wire_bytes(b"42".to_vec()),
            StreamValue::String("42".to_string())
        );
    }

    #[test]
    fn test_from_wire_bytes_keeps_invalid_utf8_as_bytes() {
        assert_eq!(
            StreamValue::from_wire_bytes(vec![0xc3, 0x28]),
            StreamValue::Bytes(vec![0xc3, 0x28])
        );
    }

    #[test]
    fn test_from_redis_value_preserves_reported_types() {
        assert_eq!(
            StreamValue::from_redis_value(redis::Value::BulkString(b"value".to_vec())).unwrap(),
            StreamValue::String("value".to_string())
        );
        assert_eq!(
            StreamValue::from_redis_value(redis::Value::Int(7)).unwrap(),
            StreamValue::Int(7)
        );
        assert_eq!(
            StreamValue::from_redis_value(redis::Value::Boolean(true)).unwrap(),
            StreamValue::Bool(true)
        );
        assert_eq!(
            StreamValue::from_redis_value(redis::Value::Double(0.25)).unwrap(),
            StreamValue::Float(0.25)
        );
    }

    #[test]
    fn test_from_redis_value_rejects_nested_values() {
        let result = StreamValue::from_redis_value(redis::Value::Array(vec![]));
        assert!(matches!(result, Err(StreamError::ParseError(_))));

        let result = StreamValue::from_redis_value(redis::Value::Nil);
        assert!(matches!(result, Err(StreamError::ParseError(_))));
    }

    #[test]
    fn test_message_from_entry() {
        let entry = StreamEntry {
            id: "1-0".to_string(),
            values: HashMap::from([("key".to_string(), StreamValue::from("value"))]),
        };
        let msg = Message::new("stream-1", entry);

        assert_eq!(msg.stream, "stream-1");
        assert_eq!(msg.id, "1-0");
        assert_eq!(msg.get("key"), Some(&StreamValue::from("value")));
        assert_eq!(msg.get("missing"), None);
    }
}
