// Broker adapter: optional bridge from local publishes to an external
// publish/subscribe transport, and from inbound broker traffic back into
// local topic delivery.

mod memory;

pub use memory::MemoryBroker;

use std::fmt;
use std::sync::Arc;

use courier_common::payload::{Payload, PayloadError};
use courier_common::protocol::Envelope;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::topic::TopicRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerConnection {
    Connected,
    Disconnected,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport is disconnected")]
    Disconnected,
    #[error("failed to encode broker frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode broker frame: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("broker subject must not be empty")]
    InvalidSubject,
    #[error("broker frame is not a push: {0}")]
    InvalidFrame(#[from] PayloadError),
}

/// Raw frames received for one subject.
pub type BrokerSubscription = mpsc::UnboundedReceiver<Vec<u8>>;

/// An external publish/subscribe transport. Delivery is at-most-once; the
/// transport owns reconnection and the adapter never retries or buffers.
pub trait BrokerTransport: Send + Sync + 'static {
    fn publish(&self, subject: &str, frame: Vec<u8>) -> Result<(), BrokerError>;

    fn subscribe(&self, subject: &str) -> Result<BrokerSubscription, BrokerError>;

    fn connection_state(&self) -> watch::Receiver<BrokerConnection>;
}

/// What travels over the broker: a push envelope tagged with the engine
/// that published it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerFrame {
    pub origin: String,
    #[serde(flatten)]
    pub envelope: Envelope,
}

impl BrokerFrame {
    pub fn new(origin: &str, payload: &Payload) -> Self {
        Self { origin: origin.to_string(), envelope: Envelope::push_from(payload) }
    }

    pub fn encode(&self) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(self).map_err(BrokerError::Encode)
    }

    pub fn decode(raw: &[u8]) -> Result<Self, BrokerError> {
        serde_json::from_slice(raw).map_err(BrokerError::Decode)
    }

    pub fn payload(&self) -> Result<Payload, BrokerError> {
        Ok(Payload::from_push_envelope(&self.envelope)?)
    }
}

/// Routes publishes locally, to the transport, or both, depending on the
/// two independent [`BrokerConfig`] switches.
#[derive(Clone)]
pub struct BrokerAdapter {
    transport: Option<Arc<dyn BrokerTransport>>,
    origin: Arc<str>,
    local_fanout: bool,
    topics: TopicRegistry,
}

impl fmt::Debug for BrokerAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerAdapter")
            .field("enabled", &self.transport.is_some())
            .field("origin", &self.origin)
            .field("local_fanout", &self.local_fanout)
            .finish()
    }
}

impl BrokerAdapter {
    /// A `None` transport means the broker is disabled and every publish is
    /// delivered locally.
    pub fn new(
        config: &BrokerConfig,
        transport: Option<Arc<dyn BrokerTransport>>,
        topics: TopicRegistry,
    ) -> Self {
        let transport = if config.enabled { transport } else { None };
        Self {
            transport,
            origin: Arc::from(Uuid::new_v4().to_string()),
            local_fanout: config.local_fanout,
            topics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.transport.is_some()
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Publish one payload. Transport failures are logged and the payload is
    /// dropped for remote recipients.
    pub async fn publish(&self, payload: Arc<Payload>) {
        let Some(transport) = &self.transport else {
            self.deliver_local(payload).await;
            return;
        };

        if self.local_fanout {
            self.deliver_local(Arc::clone(&payload)).await;
        }

        let frame = BrokerFrame::new(&self.origin, &payload);
        let result = frame.encode().and_then(|bytes| transport.publish(payload.kind(), bytes));
        if let Err(error) = result {
            warn!(
                kind = %payload.kind(),
                uri = %payload.uri(),
                error = %error,
                "broker publish dropped"
            );
        }
    }

    /// Re-inject inbound traffic for every subject into local delivery.
    /// One task per subject; each stops on shutdown or when its
    /// subscription ends.
    pub fn subscribe_subjects(
        &self,
        subjects: &[String],
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>, BrokerError> {
        let Some(transport) = &self.transport else {
            debug!("broker disabled, inbound subjects ignored");
            return Ok(Vec::new());
        };

        let mut tasks = Vec::with_capacity(subjects.len());
        for subject in subjects {
            if subject.is_empty() {
                return Err(BrokerError::InvalidSubject);
            }
            let subscription = transport.subscribe(subject)?;
            let inbound = Inbound {
                subject: subject.clone(),
                origin: Arc::clone(&self.origin),
                skip_own: self.local_fanout,
                topics: self.topics.clone(),
            };
            tasks.push(tokio::spawn(inbound.run(subscription, shutdown.subscribe())));
            info!(subject = %subject, "broker subject subscribed");
        }
        Ok(tasks)
    }

    /// Log transport connectivity transitions until shutdown.
    pub fn watch_connection(&self, shutdown: &broadcast::Sender<()>) -> Option<JoinHandle<()>> {
        let transport = self.transport.as_ref()?;
        let mut state = transport.connection_state();
        let mut shutdown = shutdown.subscribe();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.recv() => break,

                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        match *state.borrow_and_update() {
                            BrokerConnection::Connected => info!("broker reconnected"),
                            BrokerConnection::Disconnected => {
                                warn!("broker disconnected, publishes are dropped until it returns")
                            }
                        }
                    }
                }
            }
        }))
    }

    async fn deliver_local(&self, payload: Arc<Payload>) {
        if !self.topics.deliver(payload).await {
            trace!("no local topic, publish dropped");
        }
    }
}

struct Inbound {
    subject: String,
    origin: Arc<str>,
    skip_own: bool,
    topics: TopicRegistry,
}

impl Inbound {
    async fn run(
        self,
        mut subscription: BrokerSubscription,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                maybe_frame = subscription.recv() => {
                    let Some(raw) = maybe_frame else {
                        break;
                    };
                    self.handle(&raw).await;
                }
            }
        }
        debug!(subject = %self.subject, "broker subscription ended");
    }

    async fn handle(&self, raw: &[u8]) {
        let frame = match BrokerFrame::decode(raw) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(subject = %self.subject, error = %error, "undecodable broker frame dropped");
                return;
            }
        };
        if self.skip_own && frame.origin == *self.origin {
            return;
        }
        match frame.payload() {
            Ok(payload) => {
                self.topics.deliver(Arc::new(payload)).await;
            }
            Err(error) => {
                warn!(subject = %self.subject, error = %error, "invalid broker frame dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use courier_common::payload::Op;
    use serde_json::json;

    use super::*;

    #[test]
    fn frame_flattens_envelope_fields() {
        let payload =
            Payload::new("doc", Op::Remove, "doc:7", json!({ "id": 7 })).expect("payload");
        let frame = BrokerFrame::new("engine-a", &payload);

        let value: serde_json::Value =
            serde_json::from_slice(&frame.encode().expect("frame should encode")).expect("json");

        assert_eq!(value["origin"], "engine-a");
        assert_eq!(value["rid"], "doc");
        assert_eq!(value["method"], "REMOVE");
        assert_eq!(value["uri"], "doc:7");
        assert_eq!(value["push"], true);

        let decoded = BrokerFrame::decode(&frame.encode().expect("encode")).expect("decode");
        assert_eq!(decoded.payload().expect("payload"), payload);
    }

    #[test]
    fn request_envelope_is_not_a_valid_frame_payload() {
        let frame = BrokerFrame {
            origin: "x".to_string(),
            envelope: Envelope::request("r1", "GET", "/ping", None),
        };
        assert!(matches!(frame.payload(), Err(BrokerError::InvalidFrame(_))));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(BrokerFrame::decode(b"not json"), Err(BrokerError::Decode(_))));
    }
}
