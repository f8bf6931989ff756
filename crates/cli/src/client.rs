// Client side of the relay connection protocol.
//
// A read task owns the inbound half of the socket. Responses go to the one
// in-flight `rest_exec` call; pushes go to the channel handed out by
// `take_pushes`. Only one request is outstanding per connection.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use courier_common::config::ConnectionConfig;
use courier_common::error::{ErrorCode, WireError};
use courier_common::protocol::{
    decode_envelope, encode_envelope, Envelope, ACCESS_TOKEN_HEADER, SESSION_ID_HEADER,
    USER_ID_HEADER,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::exit_code::ExitCode;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DEFAULT_PUSH_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid host `{0}`")]
    InvalidHost(String),
    #[error("invalid credentials, expected <user-id>:<session-id>:<access-token>")]
    InvalidCredentials,
    #[error("failed to connect: {0}")]
    Connect(#[source] tungstenite::Error),
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode response data: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("write failed: {0}")]
    Write(#[source] tungstenite::Error),
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),
    #[error("read failed: {0}")]
    Read(#[source] tungstenite::Error),
    #[error("server silent for {0:?}")]
    ReadTimeout(Duration),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("connection closed")]
    Disconnected,
    #[error("response rid `{received}` does not match request rid `{expected}`")]
    NotFound { expected: String, received: String },
    #[error("server error: {0}")]
    Server(WireError),
}

impl ClientError {
    /// Registry code for this failure. Server errors keep the server's code.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidHost(_) | Self::InvalidCredentials | Self::Encode(_) => {
                ErrorCode::InvalidInput
            }
            Self::Decode(_) => ErrorCode::JsonDecode,
            Self::Connect(_)
            | Self::Write(_)
            | Self::WriteTimeout(_)
            | Self::Read(_)
            | Self::ReadTimeout(_)
            | Self::Disconnected => ErrorCode::NetAccess,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Server(error) => error.error_code().unwrap_or(ErrorCode::Internal),
        }
    }
}

/// Called once when the read task ends abnormally.
pub type ConnErrorHandler = Arc<dyn Fn(&ClientError) + Send + Sync>;

pub fn nop_on_conn_error() -> ConnErrorHandler {
    Arc::new(|error| debug!(error = %error, "connection error ignored"))
}

pub fn exit_on_conn_error() -> ConnErrorHandler {
    Arc::new(|error| {
        error!(error = %error, "connection lost, exiting");
        ExitCode::Network.exit();
    })
}

/// `<user-id>:<session-id>:<access-token>`. The token may itself contain `:`.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user_id: String,
    pub session_id: String,
    pub access_token: String,
}

impl FromStr for Credentials {
    type Err = ClientError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user_id), Some(session_id), Some(access_token))
                if !user_id.is_empty() && !session_id.is_empty() =>
            {
                Ok(Self {
                    user_id: user_id.to_string(),
                    session_id: session_id.to_string(),
                    access_token: access_token.to_string(),
                })
            }
            _ => Err(ClientError::InvalidCredentials),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user_id", &self.user_id)
            .field("session_id", &self.session_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// `host[:port]`, without scheme.
    pub host: String,
    pub secure: bool,
    pub credentials: Credentials,
    /// Stop reading after the first response.
    pub once: bool,
    pub connection: ConnectionConfig,
    pub push_buffer: usize,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            secure: true,
            credentials,
            once: false,
            connection: ConnectionConfig::default(),
            push_buffer: DEFAULT_PUSH_BUFFER,
        }
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }

    pub fn with_connection(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn websocket_url(&self) -> Result<Url, ClientError> {
        let host = self.host.trim();
        if host.is_empty() || host.contains("://") || host.contains('/') {
            return Err(ClientError::InvalidHost(self.host.clone()));
        }
        let scheme = if self.secure { "wss" } else { "ws" };
        Url::parse(&format!("{scheme}://{host}/ws"))
            .map_err(|_| ClientError::InvalidHost(self.host.clone()))
    }
}

pub struct Client {
    writer: Arc<Writer>,
    shared: Arc<Shared>,
    in_flight: Mutex<()>,
    response_timeout: Duration,
    reader: JoinHandle<()>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("response_timeout", &self.response_timeout)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Dial `ws(s)://host/ws` with the identity headers and start reading.
    pub async fn connect(
        options: ClientOptions,
        on_conn_error: ConnErrorHandler,
    ) -> Result<Self, ClientError> {
        let url = options.websocket_url()?;
        let mut request = url.as_str().into_client_request().map_err(ClientError::Connect)?;
        let headers = request.headers_mut();
        headers.insert(USER_ID_HEADER, header_value(&options.credentials.user_id)?);
        headers.insert(SESSION_ID_HEADER, header_value(&options.credentials.session_id)?);
        if !options.credentials.access_token.is_empty() {
            headers.insert(ACCESS_TOKEN_HEADER, header_value(&options.credentials.access_token)?);
        }

        let (socket, _) = connect_async(request).await.map_err(ClientError::Connect)?;
        info!(url = %url, "connected");

        let (sink, stream) = socket.split();
        let writer = Arc::new(Writer {
            sink: Mutex::new(sink),
            write_timeout: options.connection.write_timeout,
        });
        let shared = Arc::new(Shared::new(options.push_buffer));
        let reader = tokio::spawn(
            ReadLoop {
                writer: Arc::clone(&writer),
                shared: Arc::clone(&shared),
                ping_timeout: options.connection.ping_timeout,
                once: options.once,
            }
            .run(stream, on_conn_error),
        );

        Ok(Self {
            writer,
            shared,
            in_flight: Mutex::new(()),
            response_timeout: options.connection.response_timeout,
            reader,
        })
    }

    /// Send one request and wait for its response.
    ///
    /// On timeout the request is not cancelled; a late response is dropped.
    /// Returns the response `data`, which is `None` when the server sent none.
    pub async fn rest_exec(
        &self,
        rid: &str,
        method: &str,
        uri: &str,
        data: Option<Value>,
    ) -> Result<Option<Value>, ClientError> {
        let _in_flight = self.in_flight.lock().await;

        let request = Envelope::request(rid, method, uri, data);
        let encoded = encode_envelope(&request).map_err(ClientError::Encode)?;
        let pending = self.shared.expect_response()?;

        debug!(rid = %request.rid, method = %request.method, uri = %request.uri, "sending request");
        self.writer.send(Message::Text(encoded.into())).await?;

        let response = match timeout(self.response_timeout, pending).await {
            Err(_) => {
                warn!(rid = %request.rid, timeout = ?self.response_timeout, "response timed out");
                return Err(ClientError::Timeout(self.response_timeout));
            }
            Ok(Err(_)) => return Err(ClientError::Disconnected),
            Ok(Ok(response)) => response,
        };

        if response.rid != request.rid {
            return Err(ClientError::NotFound { expected: request.rid, received: response.rid });
        }
        if let Some(error) = response.wire_error() {
            return Err(ClientError::Server(error));
        }
        Ok(response.data)
    }

    /// Typed wrapper over [`Client::rest_exec`]. A missing `data` decodes from `null`.
    pub async fn call<Req, Resp>(
        &self,
        rid: &str,
        method: &str,
        uri: &str,
        data: &Req,
    ) -> Result<Resp, ClientError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_value(data).map_err(ClientError::Encode)?;
        let response = self.rest_exec(rid, method, uri, Some(data)).await?;
        serde_json::from_value(response.unwrap_or(Value::Null)).map_err(ClientError::Decode)
    }

    /// Start receiving pushes. Replaces any previously taken receiver.
    /// The receiver ends when the connection does.
    pub fn take_pushes(&self) -> mpsc::Receiver<Envelope> {
        self.shared.take_pushes()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }

    /// Send a close frame. The read task ends once the server acknowledges.
    pub async fn close(&self) {
        self.writer.close().await;
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn header_value(value: &str) -> Result<HeaderValue, ClientError> {
    HeaderValue::from_str(value).map_err(|_| ClientError::InvalidCredentials)
}

struct Writer {
    sink: Mutex<SplitSink<WsStream, Message>>,
    write_timeout: Duration,
}

impl Writer {
    async fn send(&self, message: Message) -> Result<(), ClientError> {
        let mut sink = self.sink.lock().await;
        match timeout(self.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ClientError::Write(error)),
            Err(_) => Err(ClientError::WriteTimeout(self.write_timeout)),
        }
    }

    async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = timeout(self.write_timeout, sink.close()).await;
    }
}

struct Shared {
    state: StdMutex<SharedState>,
    push_capacity: usize,
}

#[derive(Default)]
struct SharedState {
    closed: bool,
    pending: Option<oneshot::Sender<Envelope>>,
    pushes: Option<mpsc::Sender<Envelope>>,
}

impl Shared {
    fn new(push_capacity: usize) -> Self {
        Self { state: StdMutex::default(), push_capacity: push_capacity.max(1) }
    }

    fn state(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expect_response(&self) -> Result<oneshot::Receiver<Envelope>, ClientError> {
        let mut state = self.state();
        if state.closed {
            return Err(ClientError::Disconnected);
        }
        let (tx, rx) = oneshot::channel();
        state.pending = Some(tx);
        Ok(rx)
    }

    fn complete(&self, response: Envelope) {
        let pending = self.state().pending.take();
        match pending {
            Some(waiter) => {
                if let Err(response) = waiter.send(response) {
                    debug!(rid = %response.rid, "dropping late response");
                }
            }
            None => debug!(rid = %response.rid, "dropping unsolicited response"),
        }
    }

    fn forward_push(&self, push: Envelope) {
        info!(kind = %push.rid, op = %push.method, uri = %push.uri, "push received");
        let Some(pushes) = self.state().pushes.clone() else {
            return;
        };
        match pushes.try_send(push) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(push)) => {
                warn!(kind = %push.rid, uri = %push.uri, "push channel full, dropping push");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn take_pushes(&self) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.push_capacity);
        let mut state = self.state();
        if !state.closed {
            state.pushes = Some(tx);
        }
        rx
    }

    /// Fail the in-flight call and end the push stream.
    fn close(&self) {
        let mut state = self.state();
        state.closed = true;
        state.pending = None;
        state.pushes = None;
    }
}

struct ReadLoop {
    writer: Arc<Writer>,
    shared: Arc<Shared>,
    ping_timeout: Duration,
    once: bool,
}

impl ReadLoop {
    async fn run(self, stream: SplitStream<WsStream>, on_conn_error: ConnErrorHandler) {
        let outcome = self.read(stream).await;
        self.shared.close();
        self.writer.close().await;

        match outcome {
            Ok(()) => debug!("read loop finished"),
            Err(error) => {
                warn!(error = %error, "read loop failed");
                on_conn_error(&error);
            }
        }
    }

    async fn read(&self, mut stream: SplitStream<WsStream>) -> Result<(), ClientError> {
        loop {
            let frame = match timeout(self.ping_timeout, stream.next()).await {
                Err(_) => return Err(ClientError::ReadTimeout(self.ping_timeout)),
                Ok(None) => return Ok(()),
                Ok(Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))) => return Ok(()),
                Ok(Some(Err(error))) => return Err(ClientError::Read(error)),
                Ok(Some(Ok(frame))) => frame,
            };

            let decoded = match frame {
                Message::Text(text) => decode_envelope(text.as_str()),
                Message::Binary(bytes) => serde_json::from_slice::<Envelope>(&bytes),
                Message::Ping(payload) => {
                    self.writer.send(Message::Pong(payload)).await?;
                    continue;
                }
                Message::Pong(_) | Message::Frame(_) => continue,
                Message::Close(_) => return Ok(()),
            };
            let envelope = match decoded {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(error = %error, "dropping undecodable frame");
                    continue;
                }
            };

            if envelope.push {
                self.shared.forward_push(envelope);
                continue;
            }
            self.shared.complete(envelope);
            if self.once {
                return Ok(());
            }
        }
    }
}
