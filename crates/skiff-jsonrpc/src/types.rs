use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A uniquely identifying ID for a JSON-RPC request.
/// Can be a string or a number, but never null; a request without an ID is a
/// notification and is represented as `Option<RequestId>::None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl RequestId {
    /// Interpret a wire-level `id` value. JSON `null` is folded into "absent",
    /// matching the v1 convention of sending `"id": null` on notifications.
    /// Anything that is not an integer, a string, or null is rejected.
    pub fn from_wire(v: &Value) -> Result<Option<RequestId>, &'static str> {
        match v {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(RequestId::String(s.clone()))),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Some(RequestId::Number(i))),
                None => Err("request id must be an integer or a string"),
            },
            _ => Err("request id must be an integer or a string"),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RequestId::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            RequestId::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}
