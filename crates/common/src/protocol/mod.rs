// Envelope protocol spoken over a relay WebSocket connection.

pub mod envelope;

pub use envelope::{decode_envelope, encode_envelope, now_millis, Envelope};

/// Identity headers sent on the WebSocket upgrade request.
pub const USER_ID_HEADER: &str = "x-user-id";
pub const SESSION_ID_HEADER: &str = "x-session-id";
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";
