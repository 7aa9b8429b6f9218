//! Payload carried by an envelope.
//!
//! Handlers choose their own encoding. Raw bytes are left alone until a
//! handler asks for a typed view; structured values travel as
//! `serde_json::Value`. Conversions go through serde explicitly, there is no
//! runtime type inspection.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FlowError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Bytes(Vec<u8>),
    Json(Value),
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Bytes(Vec::new())
    }
}

impl Payload {
    /// Encode a typed value as a structured payload.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self, FlowError> {
        Ok(Payload::Json(serde_json::to_value(value)?))
    }

    /// Decode into `T`. Bytes are parsed as JSON.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FlowError> {
        match self {
            Payload::Bytes(bytes) => Ok(serde_json::from_slice(bytes)?),
            Payload::Json(value) => Ok(T::deserialize(value)?),
        }
    }

    /// Render as text: bytes as UTF-8, JSON strings unquoted, other JSON
    /// compactly serialized.
    pub fn to_text(&self) -> Result<String, FlowError> {
        match self {
            Payload::Bytes(bytes) => String::from_utf8(bytes.clone())
                .map_err(|e| FlowError::Payload(format!("payload is not utf-8: {e}"))),
            Payload::Json(Value::String(s)) => Ok(s.clone()),
            Payload::Json(value) => Ok(value.to_string()),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FlowError> {
        match self {
            Payload::Bytes(bytes) => Ok(bytes.clone()),
            Payload::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Interpret as an ordered collection of elements (loop input).
    ///
    /// Returns `None` when the payload is not a JSON array.
    pub fn as_collection(&self) -> Option<Vec<Value>> {
        match self {
            Payload::Json(Value::Array(items)) => Some(items.clone()),
            Payload::Json(_) => None,
            Payload::Bytes(bytes) => match serde_json::from_slice::<Value>(bytes) {
                Ok(Value::Array(items)) => Some(items),
                _ => None,
            },
        }
    }

    /// Structured view used when merging loop results. Bytes holding a JSON
    /// object or array are lifted; everything else, including text such as
    /// `123` or `true`, stays a JSON string (lossy for invalid UTF-8).
    pub(crate) fn into_value(self) -> Value {
        match self {
            Payload::Json(value) => value,
            Payload::Bytes(bytes) => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
                _ => Value::String(String::from_utf8_lossy(&bytes).into_owned()),
            },
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Bytes(s.as_bytes().to_vec())
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Bytes(s.into_bytes())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}
