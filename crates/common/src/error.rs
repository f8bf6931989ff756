// Numeric error registry carried in the `error` field of response envelopes.
//
// Codes are positional and stable: new codes are appended, never inserted.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    InvalidInput = 0,
    InvalidToken = 1,
    InvalidMethod = 2,
    InvalidSession = 3,
    InvalidOp = 4,
    InvalidPerm = 5,
    JsonDecode = 6,
    XmlDecode = 7,
    NotFound = 8,
    Internal = 9,
    FileAccess = 10,
    NetAccess = 11,
    DbAccess = 12,
    InvalidObject = 13,
    Timeout = 14,
    ResourceLimit = 15,
    RateLimit = 16,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 17] = [
        Self::InvalidInput,
        Self::InvalidToken,
        Self::InvalidMethod,
        Self::InvalidSession,
        Self::InvalidOp,
        Self::InvalidPerm,
        Self::JsonDecode,
        Self::XmlDecode,
        Self::NotFound,
        Self::Internal,
        Self::FileAccess,
        Self::NetAccess,
        Self::DbAccess,
        Self::InvalidObject,
        Self::Timeout,
        Self::ResourceLimit,
        Self::RateLimit,
    ];

    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub const fn default_message(self) -> &'static str {
        match self {
            Self::InvalidInput => "Invalid input",
            Self::InvalidToken => "Invalid access token",
            Self::InvalidMethod => "Invalid method",
            Self::InvalidSession => "Invalid session",
            Self::InvalidOp => "Invalid operation",
            Self::InvalidPerm => "Insufficient permission",
            Self::JsonDecode => "JSON decode error",
            Self::XmlDecode => "XML decode error",
            Self::NotFound => "Object not found",
            Self::Internal => "Internal error",
            Self::FileAccess => "File I/O error",
            Self::NetAccess => "Network access error",
            Self::DbAccess => "Database access error",
            Self::InvalidObject => "Invalid object",
            Self::Timeout => "Operation timed out",
            Self::ResourceLimit => "Resource limit exceeded",
            Self::RateLimit => "Rate limit exceeded",
        }
    }
}

/// Error body as it appears on the wire: `{"code": 8, "message": "Object not found"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

impl WireError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code: code.code(), message: message.into() }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code, "message": self.message })
    }
}

impl From<ErrorCode> for WireError {
    fn from(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }
}
