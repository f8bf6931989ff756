use axum::{
    extract::rejection::JsonRejection,
    http::{header::HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use courier_common::error::{ErrorCode, WireError};
use courier_common::payload::PayloadError;
use courier_push::PushError;
use tracing::error;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub const fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidToken => StatusCode::UNAUTHORIZED,
        ErrorCode::InvalidMethod => StatusCode::NOT_FOUND,
        ErrorCode::InvalidSession => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidOp => StatusCode::BAD_REQUEST,
        ErrorCode::InvalidPerm => StatusCode::FORBIDDEN,
        ErrorCode::JsonDecode => StatusCode::BAD_REQUEST,
        ErrorCode::XmlDecode => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::FileAccess => StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::NetAccess => StatusCode::BAD_GATEWAY,
        ErrorCode::DbAccess => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCode::InvalidObject => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorCode::ResourceLimit => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::RateLimit => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// Registry code for a response that carries no error body of its own.
pub fn default_code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ErrorCode::InvalidInput,
        StatusCode::UNSUPPORTED_MEDIA_TYPE => ErrorCode::JsonDecode,
        StatusCode::UNAUTHORIZED => ErrorCode::InvalidToken,
        StatusCode::FORBIDDEN => ErrorCode::InvalidPerm,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED => ErrorCode::InvalidMethod,
        StatusCode::PAYLOAD_TOO_LARGE => ErrorCode::ResourceLimit,
        StatusCode::TOO_MANY_REQUESTS => ErrorCode::RateLimit,
        StatusCode::GATEWAY_TIMEOUT | StatusCode::REQUEST_TIMEOUT => ErrorCode::Timeout,
        StatusCode::BAD_GATEWAY => ErrorCode::NetAccess,
        _ => ErrorCode::Internal,
    }
}

/// Error returned by dispatch handlers. The response body is exactly the
/// [`WireError`] so the WebSocket path can lift it into an envelope.
#[derive(Debug, Clone)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }

    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn wire(&self) -> WireError {
        WireError::new(self.code, self.message.clone())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (status_for(self.code), Json(self.wire())).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(ErrorCode::JsonDecode, rejection.body_text())
    }
}

impl From<PayloadError> for ApiError {
    fn from(error: PayloadError) -> Self {
        let code = match error {
            PayloadError::UnknownOp(_) => ErrorCode::InvalidOp,
            PayloadError::Encode(_) => ErrorCode::JsonDecode,
            PayloadError::EmptyKind | PayloadError::NotAPush => ErrorCode::InvalidInput,
        };
        Self::new(code, error.to_string())
    }
}

impl From<PushError> for ApiError {
    fn from(error: PushError) -> Self {
        match error {
            PushError::Payload(error) => error.into(),
            other => {
                error!(error = %other, "push engine failure");
                Self::from_code(ErrorCode::Internal)
            }
        }
    }
}

pub fn request_id_from_headers_or_generate(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.trim().is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

pub fn attach_request_id_header(response: &mut Response, request_id: &str) {
    if let Ok(header) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header);
    }
}
