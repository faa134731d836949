//! The tagged value every decoded wire message becomes.
//!
//! Mirrors the five RESP kinds: simple string, error, integer, bulk
//! string, array. Null bulk and null array are distinct states, not absent
//! values wrapped in `Option` at this layer — callers ask `is_null()`.

use crate::error::RedisError;
use bytes::Bytes;
use std::fmt;

/// A single decoded (or about-to-be-encoded) RESP value.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn is_simple_string(&self) -> bool {
        matches!(self, Reply::SimpleString(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, Reply::Integer(_))
    }

    pub fn is_bulk_string(&self) -> bool {
        matches!(self, Reply::BulkString(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Reply::Array(_))
    }

    /// True for a null bulk string (`$-1\r\n`) or null array (`*-1\r\n`).
    pub fn is_null(&self) -> bool {
        matches!(self, Reply::BulkString(None) | Reply::Array(None))
    }

    /// View as a UTF-8 string. Accepts simple strings and non-null bulk
    /// strings; everything else is a [`RedisError::Type`].
    pub fn as_string(&self) -> crate::Result<String> {
        match self {
            Reply::SimpleString(s) => Ok(s.clone()),
            Reply::BulkString(Some(b)) => String::from_utf8(b.to_vec())
                .map_err(|_| RedisError::Protocol("invalid utf-8 in bulk string".into())),
            other => Err(RedisError::Type {
                expected: "string",
                found: other.kind_name(),
            }),
        }
    }

    pub fn as_integer(&self) -> crate::Result<i64> {
        match self {
            Reply::Integer(n) => Ok(*n),
            other => Err(RedisError::Type {
                expected: "integer",
                found: other.kind_name(),
            }),
        }
    }

    pub fn as_array(&self) -> crate::Result<&[Reply]> {
        match self {
            Reply::Array(Some(items)) => Ok(items),
            other => Err(RedisError::Type {
                expected: "array",
                found: other.kind_name(),
            }),
        }
    }

    /// View as raw bytes, for payloads that are not necessarily UTF-8 (pub/sub
    /// messages, stream field values).
    pub fn as_bytes(&self) -> crate::Result<Bytes> {
        match self {
            Reply::BulkString(Some(b)) => Ok(b.clone()),
            Reply::SimpleString(s) => Ok(Bytes::from(s.clone().into_bytes())),
            other => Err(RedisError::Type {
                expected: "bulk string",
                found: other.kind_name(),
            }),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Reply::SimpleString(_) => "simple string",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::BulkString(Some(_)) => "bulk string",
            Reply::BulkString(None) => "null bulk string",
            Reply::Array(Some(_)) => "array",
            Reply::Array(None) => "null array",
        }
    }

    /// A synthetic reply used when auto-reconnect has exhausted its budget.
    pub(crate) fn network_error() -> Reply {
        Reply::Error("network error".to_string())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::SimpleString(s) => s.fmt(f),
            Reply::Error(msg) => write!(f, "(error) {}", msg),
            Reply::Integer(n) => n.fmt(f),
            Reply::BulkString(Some(b)) => match std::str::from_utf8(b) {
                Ok(s) => s.fmt(f),
                Err(_) => write!(f, "{:?}", b),
            },
            Reply::BulkString(None) => "(nil)".fmt(f),
            Reply::Array(Some(items)) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    item.fmt(f)?;
                }
                Ok(())
            }
            Reply::Array(None) => "(nil)".fmt(f),
        }
    }
}
