use courier_common::error::{ErrorCode, WireError};
use courier_common::payload::{Op, Payload};
use courier_common::protocol::{decode_envelope, encode_envelope, Envelope};
use serde_json::{json, Value};

fn keys(value: &Value) -> Vec<&str> {
    let mut keys: Vec<&str> = value
        .as_object()
        .expect("envelope should serialize to an object")
        .keys()
        .map(String::as_str)
        .collect();
    keys.sort_unstable();
    keys
}

#[test]
fn request_envelope_wire_shape() {
    let request = Envelope::request("r1", "POST", "/v1/publish", Some(json!({ "kind": "k" })));
    let value = serde_json::to_value(&request).expect("request should serialize");

    assert_eq!(keys(&value), ["data", "method", "push", "rid", "timestamp", "uri"]);
    assert_eq!(value["push"], false);
    assert!(value["timestamp"].is_i64());
}

#[test]
fn optional_fields_are_omitted_when_absent() {
    let mut envelope = Envelope::request("", "GET", "/ping", None);
    envelope.timestamp = 1_700_000_000_000;
    let value = serde_json::to_value(&envelope).expect("envelope should serialize");

    assert_eq!(keys(&value), ["method", "push", "timestamp", "uri"]);
}

#[test]
fn error_response_wire_shape() {
    let response = Envelope::request("r2", "GET", "/nope", None)
        .into_error(&WireError::from(ErrorCode::InvalidMethod));
    let value = serde_json::to_value(&response).expect("response should serialize");

    assert_eq!(keys(&value), ["error", "method", "push", "rid", "timestamp", "uri"]);
    assert_eq!(value["error"], json!({ "code": 2, "message": "Invalid method" }));
}

#[test]
fn push_envelope_wire_shape() {
    let payload = Payload::new("comment", Op::Remove, "thread:5", json!({ "id": 5 }))
        .expect("payload should build");
    let value =
        serde_json::to_value(Envelope::push_from(&payload)).expect("push should serialize");

    assert_eq!(value["rid"], "comment");
    assert_eq!(value["method"], "REMOVE");
    assert_eq!(value["uri"], "thread:5");
    assert_eq!(value["push"], true);
    assert_eq!(value["data"], json!({ "id": 5 }));
    assert!(value.get("error").is_none());
}

#[test]
fn error_registry_is_stable() {
    let expected = [
        (0, "Invalid input"),
        (1, "Invalid access token"),
        (2, "Invalid method"),
        (3, "Invalid session"),
        (4, "Invalid operation"),
        (5, "Insufficient permission"),
        (6, "JSON decode error"),
        (7, "XML decode error"),
        (8, "Object not found"),
        (9, "Internal error"),
        (10, "File I/O error"),
        (11, "Network access error"),
        (12, "Database access error"),
        (13, "Invalid object"),
        (14, "Operation timed out"),
        (15, "Resource limit exceeded"),
        (16, "Rate limit exceeded"),
    ];

    assert_eq!(ErrorCode::ALL.len(), expected.len());
    for (code, message) in expected {
        let registered = ErrorCode::from_code(code).expect("code should be registered");
        assert_eq!(registered.default_message(), message);
    }
}

#[test]
fn server_success_decodes_on_client_with_its_data() {
    let data = json!({ "users": ["100", "200"], "count": 2 });
    let request = Envelope::request("r-round", "GET", "/v1/users", None);
    let wire = encode_envelope(&request.into_success(data.clone()))
        .expect("success envelope should encode");

    let decoded = decode_envelope(&wire).expect("client should decode success envelope");
    assert_eq!(decoded.rid, "r-round");
    assert_eq!(decoded.data, Some(data));
    assert!(decoded.error.is_none());
    assert!(decoded.wire_error().is_none());
}
