// Envelope: one message on a relay connection, in either direction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WireError;
use crate::payload::Payload;

/// A request, a response, or a push.
///
/// Responses echo the request's `rid`. Pushes set `push` and reuse `rid`
/// for the payload kind and `method` for the payload operation; they do
/// not correlate with any request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rid: String,
    /// UTC milliseconds.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub push: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl Envelope {
    pub fn request(
        rid: impl Into<String>,
        method: impl Into<String>,
        uri: impl Into<String>,
        data: Option<Value>,
    ) -> Self {
        Self {
            rid: rid.into(),
            timestamp: now_millis(),
            method: method.into().to_ascii_uppercase(),
            uri: uri.into(),
            push: false,
            data,
            error: None,
        }
    }

    pub fn push_from(payload: &Payload) -> Self {
        let data = match payload.data() {
            Value::Null => None,
            other => Some(other.clone()),
        };
        Self {
            rid: payload.kind().to_string(),
            timestamp: now_millis(),
            method: payload.op().as_str().to_string(),
            uri: payload.uri().to_string(),
            push: true,
            data,
            error: None,
        }
    }

    /// Turn a request into its success response. A `null` body is sent
    /// without a `data` field, same as a push with no data.
    pub fn into_success(mut self, data: Value) -> Self {
        self.timestamp = now_millis();
        self.push = false;
        self.data = match data {
            Value::Null => None,
            other => Some(other),
        };
        self.error = None;
        self
    }

    /// Turn a request into its error response.
    pub fn into_error(mut self, error: &WireError) -> Self {
        self.timestamp = now_millis();
        self.push = false;
        self.data = None;
        self.error = Some(error.to_value());
        self
    }

    /// The error carried by a response, if any. A malformed error body is
    /// reported as-is in the message of an `Internal` error.
    pub fn wire_error(&self) -> Option<WireError> {
        let raw = self.error.as_ref()?;
        Some(serde_json::from_value::<WireError>(raw.clone()).unwrap_or_else(|_| {
            WireError::new(crate::error::ErrorCode::Internal, raw.to_string())
        }))
    }
}

pub fn encode_envelope(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

pub fn decode_envelope(raw: &str) -> Result<Envelope, serde_json::Error> {
    serde_json::from_str(raw)
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{decode_envelope, encode_envelope, Envelope};
    use crate::error::{ErrorCode, WireError};
    use crate::payload::{Op, Payload};

    #[test]
    fn request_uppercases_method() {
        let envelope = Envelope::request("r1", "post", "/v1/publish", Some(json!({ "a": 1 })));
        assert_eq!(envelope.method, "POST");
        assert!(!envelope.push);
        assert!(envelope.timestamp > 0);
    }

    #[test]
    fn success_response_echoes_rid_and_clears_error() {
        let mut request = Envelope::request("r7", "GET", "/ping", None);
        request.error = Some(json!("stale"));
        request.timestamp = 1;

        let response = request.into_success(json!("pong"));

        assert_eq!(response.rid, "r7");
        assert_eq!(response.method, "GET");
        assert_eq!(response.uri, "/ping");
        assert_eq!(response.data, Some(json!("pong")));
        assert_eq!(response.error, None);
        assert!(response.timestamp > 1);
    }

    #[test]
    fn error_response_clears_data() {
        let request = Envelope::request("r8", "POST", "/v1/publish", Some(json!({ "x": 1 })));
        let response = request.into_error(&WireError::from(ErrorCode::InvalidInput));

        assert_eq!(response.rid, "r8");
        assert_eq!(response.data, None);
        assert_eq!(response.error, Some(json!({ "code": 0, "message": "Invalid input" })));
        assert_eq!(response.wire_error(), Some(WireError::from(ErrorCode::InvalidInput)));
    }

    #[test]
    fn push_envelope_copies_payload_fields() {
        let payload = Payload::new("comment", Op::Upsert, "thread:9", json!({ "id": 1 }))
            .expect("payload should build");
        let envelope = Envelope::push_from(&payload);

        assert!(envelope.push);
        assert_eq!(envelope.rid, "comment");
        assert_eq!(envelope.method, "UPSERT");
        assert_eq!(envelope.uri, "thread:9");
        assert_eq!(envelope.data, Some(json!({ "id": 1 })));
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() {
        let envelope = decode_envelope(r#"{"method":"GET","uri":"/ping"}"#)
            .expect("minimal envelope should decode");
        assert_eq!(envelope.rid, "");
        assert_eq!(envelope.timestamp, 0);
        assert!(!envelope.push);
        assert!(envelope.data.is_none());
    }

    #[test]
    fn malformed_error_body_surfaces_as_internal() {
        let mut envelope = Envelope::request("r9", "GET", "/ping", None);
        envelope.error = Some(json!("boom"));
        let error = envelope.wire_error().expect("error should be present");
        assert_eq!(error.error_code(), Some(ErrorCode::Internal));
        assert_eq!(error.message, "\"boom\"");
    }

    #[test]
    fn null_success_body_is_omitted_and_decodes_back_equal() {
        let mut request = Envelope::request("r3", "POST", "/v1/subscriptions", None);
        request.data = Some(json!({ "uri": "t" }));
        let response = request.into_success(serde_json::Value::Null);
        assert_eq!(response.data, None);

        let encoded = encode_envelope(&response).expect("envelope should encode");
        assert!(!encoded.contains("\"data\""), "null body should not be encoded: {encoded}");
        assert_eq!(decode_envelope(&encoded).expect("envelope should decode"), response);
    }

    #[test]
    fn encode_then_decode_preserves_response() {
        let response = Envelope::request("r2", "GET", "/ping", None).into_success(json!("pong"));
        let encoded = encode_envelope(&response).expect("envelope should encode");
        let decoded = decode_envelope(&encoded).expect("envelope should decode");
        assert_eq!(decoded, response);
    }
}
