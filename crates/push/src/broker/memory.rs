// In-process broker for single-host deployments that run several engines,
// and for tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, watch};

use super::{BrokerConnection, BrokerError, BrokerSubscription, BrokerTransport};

type Subjects = HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>;

/// Subject -> subscriber list. Cloning shares the same broker.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    subjects: Mutex<Subjects>,
    state: watch::Sender<BrokerConnection>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(BrokerConnection::Connected);
        Self { inner: Arc::new(Inner { subjects: Mutex::new(HashMap::new()), state }) }
    }

    /// Simulate losing the connection. Publishes fail until [`reconnect`](Self::reconnect).
    pub fn disconnect(&self) {
        self.inner.state.send_replace(BrokerConnection::Disconnected);
    }

    pub fn reconnect(&self) {
        self.inner.state.send_replace(BrokerConnection::Connected);
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state.borrow() == BrokerConnection::Connected
    }

    pub fn subscriber_count(&self, subject: &str) -> usize {
        self.subjects().get(subject).map_or(0, Vec::len)
    }

    fn subjects(&self) -> MutexGuard<'_, Subjects> {
        self.inner.subjects.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerTransport for MemoryBroker {
    fn publish(&self, subject: &str, frame: Vec<u8>) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::Disconnected);
        }
        let mut subjects = self.subjects();
        if let Some(subscribers) = subjects.get_mut(subject) {
            subscribers.retain(|subscriber| subscriber.send(frame.clone()).is_ok());
        }
        Ok(())
    }

    fn subscribe(&self, subject: &str) -> Result<BrokerSubscription, BrokerError> {
        if subject.is_empty() {
            return Err(BrokerError::InvalidSubject);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subjects().entry(subject.to_string()).or_default().push(sender);
        Ok(receiver)
    }

    fn connection_state(&self) -> watch::Receiver<BrokerConnection> {
        self.inner.state.subscribe()
    }
}
