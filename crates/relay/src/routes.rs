// Dispatch table shared by REST callers and the WebSocket request loop.
//
// WebSocket envelopes are replayed through this router as ordinary HTTP
// requests, with the connection identity injected as headers.

use std::sync::Arc;

use axum::{
    extract::{FromRequest, FromRequestParts, Path, Request, State},
    http::request::Parts,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use courier_common::config::ConnectionConfig;
use courier_common::error::ErrorCode;
use courier_common::payload::{Op, Payload};
use courier_push::{PushEngine, SessionKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ApiError;

pub use courier_common::protocol::{ACCESS_TOKEN_HEADER, SESSION_ID_HEADER, USER_ID_HEADER};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<PushEngine>,
    pub connection: ConnectionConfig,
}

impl AppState {
    pub fn new(engine: Arc<PushEngine>, connection: ConnectionConfig) -> Self {
        Self { engine, connection }
    }
}

/// Caller identity carried in headers. Authentication happens upstream;
/// the token is only passed through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub session_id: String,
    pub access_token: Option<String>,
}

impl Identity {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(self.user_id.clone(), self.session_id.clone())
    }
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        };

        let (Some(user_id), Some(session_id)) = (header(USER_ID_HEADER), header(SESSION_ID_HEADER))
        else {
            return Err(ApiError::new(
                ErrorCode::InvalidSession,
                "x-user-id and x-session-id headers are required",
            ));
        };

        Ok(Identity { user_id, session_id, access_token: header(ACCESS_TOKEN_HEADER) })
    }
}

/// JSON body extractor whose rejection is an [`ApiError`].
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(request: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(request, state).await?;
        Ok(Self(value))
    }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionRequest {
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionResponse {
    pub uri: String,
    pub subscribed: bool,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionList {
    pub uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub kind: String,
    pub op: Op,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub data: Value,
}

impl PushRequest {
    fn into_payload(self) -> Result<Payload, ApiError> {
        Ok(Payload::new(self.kind, self.op, self.uri, self.data)?)
    }
}

#[derive(Debug, Serialize)]
pub struct PublishResponse {
    pub kind: String,
    pub uri: String,
}

#[derive(Debug, Serialize)]
pub struct DeliveryResponse {
    pub delivered: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/v1/subscriptions", get(list_subscriptions).post(subscribe))
        .route("/v1/subscriptions/remove", post(unsubscribe))
        .route("/v1/publish", post(publish))
        .route("/v1/users/{user_id}/push", post(push_to_user))
        .fallback(unknown_route)
        .with_state(state)
}

async fn ping() -> Json<&'static str> {
    Json("pong")
}

async fn unknown_route() -> Response {
    ApiError::from_code(ErrorCode::InvalidMethod).into_response()
}

async fn subscribe(
    State(state): State<AppState>,
    identity: Identity,
    ApiJson(request): ApiJson<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    if request.uri.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidInput, "uri must not be empty"));
    }
    state.engine.subscribe(&request.uri, &identity.user_id, &identity.session_id, true).await?;
    Ok(Json(SubscriptionResponse { uri: request.uri, subscribed: true }))
}

async fn unsubscribe(
    State(state): State<AppState>,
    identity: Identity,
    ApiJson(request): ApiJson<SubscriptionRequest>,
) -> Result<Json<SubscriptionResponse>, ApiError> {
    state.engine.unsubscribe(&request.uri, &identity.user_id, &identity.session_id, true).await?;
    Ok(Json(SubscriptionResponse { uri: request.uri, subscribed: false }))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    identity: Identity,
) -> Json<SubscriptionList> {
    let uris = state.engine.topics().subscriptions(&identity.key()).await;
    Json(SubscriptionList { uris })
}

async fn publish(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<PushRequest>,
) -> Result<Json<PublishResponse>, ApiError> {
    let payload = request.into_payload()?;
    let response =
        PublishResponse { kind: payload.kind().to_string(), uri: payload.uri().to_string() };
    state.engine.publish_payload(Arc::new(payload)).await;
    Ok(Json(response))
}

async fn push_to_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    ApiJson(request): ApiJson<PushRequest>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let payload = request.into_payload()?;
    let delivered = state.engine.push_to_user(&user_id, &payload).await?;
    Ok(Json(DeliveryResponse { delivered }))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Method, Request, StatusCode},
        Router,
    };
    use courier_common::config::ConnectionConfig;
    use courier_common::error::{ErrorCode, WireError};
    use courier_push::{PushConfig, PushEngine};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, AppState};

    fn test_app() -> (Router, Arc<PushEngine>) {
        let engine =
            Arc::new(PushEngine::start(PushConfig::default(), None).expect("engine should start"));
        (router(AppState::new(Arc::clone(&engine), ConnectionConfig::default())), engine)
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("x-user-id", "100")
            .header("x-session-id", "a")
            .body(Body::from(body.to_string()))
            .expect("request should build")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response body should be readable");
        serde_json::from_slice(&bytes).expect("response body should be valid json")
    }

    #[tokio::test]
    async fn ping_returns_pong() {
        let (app, _engine) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/ping").body(Body::empty()).expect("request"))
            .await
            .expect("ping should respond");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!("pong"));
    }

    #[tokio::test]
    async fn unknown_route_is_invalid_method() {
        let (app, _engine) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).expect("request"))
            .await
            .expect("request should respond");

        let error: WireError =
            serde_json::from_value(body_json(response).await).expect("wire error body");
        assert_eq!(error.error_code(), Some(ErrorCode::InvalidMethod));
    }

    #[tokio::test]
    async fn subscribe_requires_identity_headers() {
        let (app, _engine) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/subscriptions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"uri":"t"}"#))
                    .expect("request should build"),
            )
            .await
            .expect("request should respond");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: WireError =
            serde_json::from_value(body_json(response).await).expect("wire error body");
        assert_eq!(error.error_code(), Some(ErrorCode::InvalidSession));
    }

    #[tokio::test]
    async fn subscribe_then_list_reports_topic() {
        let (app, engine) = test_app();
        let _outbox = engine.open_session("100", "a", true).await.expect("open should succeed");

        let response = app
            .clone()
            .oneshot(json_request(Method::POST, "/v1/subscriptions", json!({ "uri": "doc:1" })))
            .await
            .expect("subscribe should respond");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({ "uri": "doc:1", "subscribed": true }));

        let response = app
            .oneshot(json_request(Method::GET, "/v1/subscriptions", Value::Null))
            .await
            .expect("list should respond");
        assert_eq!(body_json(response).await, json!({ "uris": ["doc:1"] }));
    }

    #[tokio::test]
    async fn publish_reaches_subscribed_session() {
        let (app, engine) = test_app();
        let mut outbox = engine.open_session("100", "a", true).await.expect("open should succeed");
        engine.subscribe("doc:1", "100", "a", true).await.expect("subscribe should succeed");

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/v1/publish",
                json!({ "kind": "doc", "op": "UPSERT", "uri": "doc:1", "data": { "title": "x" } }),
            ))
            .await
            .expect("publish should respond");
        assert_eq!(response.status(), StatusCode::OK);

        let payload = outbox.recv().await.expect("payload should arrive");
        assert_eq!(payload.kind(), "doc");
        assert_eq!(payload.data()["title"], "x");
    }

    #[tokio::test]
    async fn push_to_user_reports_delivery_count() {
        let (app, engine) = test_app();
        let _phone = engine.open_session("200", "phone", true).await.expect("open should succeed");
        let _laptop =
            engine.open_session("200", "laptop", true).await.expect("open should succeed");

        let response = app
            .oneshot(json_request(
                Method::POST,
                "/v1/users/200/push",
                json!({ "kind": "notice", "op": "UPSERT", "data": 1 }),
            ))
            .await
            .expect("push should respond");

        assert_eq!(body_json(response).await, json!({ "delivered": 2 }));
    }

    #[tokio::test]
    async fn malformed_body_is_json_decode() {
        let (app, _engine) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/v1/publish")
                    .header("content-type", "application/json")
                    .body(Body::from("{not json"))
                    .expect("request should build"),
            )
            .await
            .expect("request should respond");

        let error: WireError =
            serde_json::from_value(body_json(response).await).expect("wire error body");
        assert_eq!(error.error_code(), Some(ErrorCode::JsonDecode));
    }

    #[tokio::test]
    async fn empty_kind_is_invalid_input() {
        let (app, _engine) = test_app();
        let response = app
            .oneshot(json_request(
                Method::POST,
                "/v1/publish",
                json!({ "kind": "", "op": "REMOVE", "uri": "doc:1" }),
            ))
            .await
            .expect("request should respond");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error: WireError =
            serde_json::from_value(body_json(response).await).expect("wire error body");
        assert_eq!(error.error_code(), Some(ErrorCode::InvalidInput));
    }
}
