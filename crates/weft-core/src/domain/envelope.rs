//! Envelope - the value threaded through every vertex of a flow.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::ids::RequestId;
use super::payload::Payload;
use crate::error::FlowError;

/// Payload plus routing metadata.
///
/// Handlers receive an envelope by value and return the one that should travel
/// on. `status` is the only routing input: a branch vertex looks it up in its
/// condition table. `current_vertex` is overwritten by the engine on entry to
/// each vertex.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: Option<RequestId>,
    pub payload: Payload,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub current_vertex: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl Envelope {
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self {
            request_id: Some(RequestId::generate()),
            payload: payload.into(),
            ..Self::default()
        }
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Payload>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Record a failure reason without aborting the flow. Downstream handlers
    /// may inspect it or turn it into an error with `into_failure`.
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    /// Typed view of the payload.
    pub fn convert_to<T: DeserializeOwned>(&self) -> Result<T, FlowError> {
        self.payload.decode()
    }

    pub fn to_text(&self) -> Result<String, FlowError> {
        self.payload.to_text()
    }

    /// `Err` carrying the recorded failure, or the envelope itself.
    pub fn into_failure(self) -> Result<Self, FlowError> {
        match self.failure {
            Some(reason) => Err(FlowError::Handler(reason)),
            None => Ok(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_envelope_has_request_id_and_empty_status() {
        let env = Envelope::new("hello");
        assert!(env.request_id.is_some());
        assert_eq!(env.status(), "");
        assert_eq!(env.to_text().unwrap(), "hello");
    }

    #[test]
    fn convert_to_typed_value() {
        let env = Envelope::new(json!({"count": 3}));
        let v: serde_json::Map<String, serde_json::Value> = env.convert_to().unwrap();
        assert_eq!(v["count"], 3);
    }

    #[test]
    fn recorded_failure_becomes_an_error() {
        let env = Envelope::new("x").with_failure("Invalid Credentials");
        let err = env.into_failure().unwrap_err();
        assert_eq!(err.to_string(), "Invalid Credentials");

        assert!(Envelope::new("x").into_failure().is_ok());
    }

    #[test]
    fn envelope_json_shape() {
        let env = Envelope::default().with_status("pass");
        let v = serde_json::to_value(&env).unwrap();
        assert_eq!(v["status"], "pass");
        assert_eq!(v["payload"]["kind"], "bytes");
        assert!(v.get("failure").is_none());
    }
}
