// CORS layer for the relay's REST surface.
//
// `COURIER_RELAY_CORS_ORIGINS` selects the allowed origins (comma-separated,
// or `*`). Unset means the request origin is mirrored back.

use axum::http::{HeaderName, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::error::REQUEST_ID_HEADER;
use crate::routes::{ACCESS_TOKEN_HEADER, SESSION_ID_HEADER, USER_ID_HEADER};

/// Build a [`CorsLayer`] from the configured origin list.
///
/// - `Some("*")` allows any origin without credentials.
/// - `Some(list)` allows exactly those origins.
/// - `None` mirrors the request origin.
///
/// Identity headers and `x-request-id` are allowed; `x-request-id` is exposed.
pub fn cors_layer(origins: Option<&str>) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            HeaderName::from_static(USER_ID_HEADER),
            HeaderName::from_static(SESSION_ID_HEADER),
            HeaderName::from_static(ACCESS_TOKEN_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static("x-app-version"),
        ])
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
        .max_age(std::time::Duration::from_secs(3600));

    match origins {
        Some("*") => base.allow_origin(AllowOrigin::any()),
        Some(origins) => base.allow_origin(parse_origins(origins)).allow_credentials(true),
        None => base.allow_origin(AllowOrigin::mirror_request()).allow_credentials(true),
    }
}

fn parse_origins(comma_separated: &str) -> Vec<HeaderValue> {
    comma_separated
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| HeaderValue::from_str(s).ok())
        .collect()
}
