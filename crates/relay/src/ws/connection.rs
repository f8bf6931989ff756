// One relay connection: a synchronous request loop and an asynchronous push
// loop sharing the socket. Either loop ending tears the whole connection down.

use std::time::{Duration, Instant};

use axum::{
    body::{to_bytes, Body},
    extract::ws::{Message, WebSocket},
    http::{header::CONTENT_TYPE, HeaderValue, Method, Request, Uri},
    Router,
};
use courier_common::config::ConnectionConfig;
use courier_common::error::{ErrorCode, WireError};
use courier_common::protocol::{decode_envelope, encode_envelope, Envelope};
use courier_push::{Outbox, SessionKey};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tower::ServiceExt;
use tracing::{debug, info, warn};

use crate::error::{default_code_for_status, REQUEST_ID_HEADER};
use crate::routes::{AppState, Identity, ACCESS_TOKEN_HEADER, SESSION_ID_HEADER, USER_ID_HEADER};

/// Why a connection ended.
#[derive(Debug, Error)]
pub enum Disconnect {
    #[error("peer closed the connection")]
    Closed,
    #[error("no frame received within {0:?}")]
    ReadTimeout(Duration),
    #[error("read failed: {0}")]
    Read(#[source] axum::Error),
    #[error("write failed: {0}")]
    Write(#[source] axum::Error),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("session outbox closed")]
    OutboxClosed,
}

impl Disconnect {
    fn is_orderly(&self) -> bool {
        matches!(self, Self::Closed | Self::OutboxClosed)
    }
}

pub(super) async fn serve(socket: WebSocket, identity: Identity, app: AppState, dispatch: Router) {
    let key = identity.key();
    let mut outbox =
        match app.engine.open_session(&identity.user_id, &identity.session_id, true).await {
            Ok(outbox) => outbox,
            Err(error) => {
                warn!(
                    session = %key,
                    error = %error,
                    "failed to open session, dropping connection"
                );
                return;
            }
        };
    info!(session = %key, "connection opened");

    let (sink, stream) = socket.split();
    let writer = Writer { sink: Mutex::new(sink), write_timeout: app.connection.write_timeout };
    let requests =
        RequestLoop { identity: &identity, dispatch, config: app.connection, writer: &writer };

    let reason = tokio::select! {
        reason = requests.run(stream) => reason,
        reason = push_loop(&key, &mut outbox, &writer, app.connection.ping_interval) => reason,
    };

    app.engine.close_session(outbox);
    writer.close().await;

    if reason.is_orderly() {
        info!(session = %key, reason = %reason, "connection closed");
    } else {
        warn!(session = %key, reason = %reason, "connection dropped");
    }
}

struct Writer {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    write_timeout: Duration,
}

impl Writer {
    async fn send(&self, message: Message) -> Result<(), Disconnect> {
        let mut sink = self.sink.lock().await;
        match timeout(self.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(Disconnect::Write(error)),
            Err(_) => Err(Disconnect::WriteTimeout(self.write_timeout)),
        }
    }

    async fn send_envelope(&self, envelope: &Envelope) -> Result<(), Disconnect> {
        let encoded = encode_envelope(envelope).map_err(Disconnect::Encode)?;
        self.send(Message::Text(encoded.into())).await
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = timeout(self.write_timeout, sink.close()).await;
    }
}

struct RequestLoop<'a> {
    identity: &'a Identity,
    dispatch: Router,
    config: ConnectionConfig,
    writer: &'a Writer,
}

impl RequestLoop<'_> {
    async fn run(&self, mut stream: SplitStream<WebSocket>) -> Disconnect {
        loop {
            // Any inbound frame, pongs included, restarts the liveness window.
            let frame = match timeout(self.config.ping_timeout, stream.next()).await {
                Err(_) => return Disconnect::ReadTimeout(self.config.ping_timeout),
                Ok(None) => return Disconnect::Closed,
                Ok(Some(Err(error))) => return Disconnect::Read(error),
                Ok(Some(Ok(frame))) => frame,
            };

            let response = match frame {
                Message::Text(text) => self.handle(text.as_str()).await,
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.handle(text).await,
                    Err(error) => decode_failure(String::new(), error.to_string()),
                },
                Message::Ping(payload) => {
                    if let Err(reason) = self.writer.send(Message::Pong(payload)).await {
                        return reason;
                    }
                    continue;
                }
                Message::Pong(_) => continue,
                Message::Close(_) => return Disconnect::Closed,
            };

            if let Err(reason) = self.writer.send_envelope(&response).await {
                return reason;
            }
        }
    }

    async fn handle(&self, raw: &str) -> Envelope {
        let request = match decode_envelope(raw) {
            Ok(request) => request,
            Err(error) => return decode_failure(salvage_rid(raw), error.to_string()),
        };

        let started_at = Instant::now();
        let outcome = self.dispatch(&request).await;
        debug!(
            session = %self.identity.key(),
            rid = %request.rid,
            method = %request.method,
            uri = %request.uri,
            ok = outcome.is_ok(),
            latency_ms = started_at.elapsed().as_millis() as u64,
            "request dispatched"
        );

        match outcome {
            Ok(data) => request.into_success(data),
            Err(error) => request.into_error(&error),
        }
    }

    /// Replay one envelope through the dispatch table as an HTTP request.
    async fn dispatch(&self, envelope: &Envelope) -> Result<Value, WireError> {
        let method = Method::from_bytes(envelope.method.as_bytes()).map_err(|_| {
            WireError::new(
                ErrorCode::InvalidMethod,
                format!("invalid method `{}`", envelope.method),
            )
        })?;
        let uri = parse_route(&envelope.uri)?;

        let body = match &envelope.data {
            Some(data) => Body::from(
                serde_json::to_vec(data)
                    .map_err(|error| WireError::new(ErrorCode::JsonDecode, error.to_string()))?,
            ),
            None => Body::empty(),
        };

        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(USER_ID_HEADER, self.identity.user_id.as_str())
            .header(SESSION_ID_HEADER, self.identity.session_id.as_str());
        if let Some(token) = &self.identity.access_token {
            builder = builder.header(ACCESS_TOKEN_HEADER, token.as_str());
        }
        if let Ok(rid) = HeaderValue::from_str(&envelope.rid) {
            if !envelope.rid.is_empty() {
                builder = builder.header(REQUEST_ID_HEADER, rid);
            }
        }
        let request = builder
            .body(body)
            .map_err(|error| WireError::new(ErrorCode::InvalidInput, error.to_string()))?;

        let response = match self.dispatch.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        };

        let status = response.status();
        let bytes = to_bytes(response.into_body(), self.config.max_message_bytes)
            .await
            .map_err(|error| WireError::new(ErrorCode::ResourceLimit, error.to_string()))?;

        if status.is_success() {
            return Ok(body_value(&bytes));
        }
        Err(serde_json::from_slice::<WireError>(&bytes).unwrap_or_else(|_| {
            let code = default_code_for_status(status);
            let message = if bytes.is_empty() {
                code.default_message().to_string()
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            };
            WireError::new(code, message)
        }))
    }
}

async fn push_loop(
    key: &SessionKey,
    outbox: &mut Outbox,
    writer: &Writer,
    ping_interval: Duration,
) -> Disconnect {
    let mut ping = tokio::time::interval(ping_interval);
    ping.reset(); // skip immediate first tick

    loop {
        tokio::select! {
            maybe_payload = outbox.recv() => {
                let Some(payload) = maybe_payload else {
                    return Disconnect::OutboxClosed;
                };
                if let Err(reason) = writer.send_envelope(&Envelope::push_from(&payload)).await {
                    return reason;
                }
            }
            _ = ping.tick() => {
                if let Err(reason) = writer.send(Message::Ping(vec![].into())).await {
                    return reason;
                }
                debug!(session = %key, "sent ping");
            }
        }
    }
}

fn parse_route(raw: &str) -> Result<Uri, WireError> {
    let invalid = || WireError::new(ErrorCode::InvalidMethod, format!("invalid uri `{raw}`"));
    if !raw.starts_with('/') {
        return Err(invalid());
    }
    raw.parse::<Uri>().map_err(|_| invalid())
}

fn decode_failure(rid: String, message: String) -> Envelope {
    Envelope { rid, ..Envelope::default() }
        .into_error(&WireError::new(ErrorCode::JsonDecode, message))
}

/// Best-effort `rid` from a frame that is JSON but not a valid envelope.
fn salvage_rid(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|value| value.get("rid").and_then(Value::as_str).map(ToOwned::to_owned))
        .unwrap_or_default()
}

fn body_value(bytes: &[u8]) -> Value {
    if bytes.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
