// PushEngine: explicitly constructed owner of both registries and the broker
// adapter. Everything it starts stops on `shutdown` or when it is dropped.

use std::sync::{Arc, Mutex, PoisonError};

use courier_common::payload::{Payload, Pushable};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::{BrokerAdapter, BrokerTransport};
use crate::config::PushConfig;
use crate::error::PushError;
use crate::session::{Outbox, SessionDirectory, SessionRegistry};
use crate::topic::TopicRegistry;

pub struct PushEngine {
    sessions: SessionRegistry,
    topics: TopicRegistry,
    broker: BrokerAdapter,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PushEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushEngine").field("broker", &self.broker).finish_non_exhaustive()
    }
}

impl PushEngine {
    /// Start the registries and, when `config.broker` asks for it, the
    /// broker bridge and its startup subjects. Must run inside a tokio runtime.
    pub fn start(
        config: PushConfig,
        transport: Option<Arc<dyn BrokerTransport>>,
    ) -> Result<Self, PushError> {
        if config.broker.enabled && transport.is_none() {
            return Err(PushError::MissingTransport);
        }

        let (shutdown_tx, _) = broadcast::channel(4);
        let directory = SessionDirectory::default();
        let (topics, topic_task) =
            TopicRegistry::start(directory.clone(), &config, shutdown_tx.subscribe());
        let (sessions, session_task) =
            SessionRegistry::start(directory, topics.clone(), &config, shutdown_tx.subscribe());
        let broker = BrokerAdapter::new(&config.broker, transport, topics.clone());

        let mut tasks = vec![topic_task, session_task];
        tasks.extend(broker.watch_connection(&shutdown_tx));

        let engine = Self { sessions, topics, broker, shutdown_tx, tasks: Mutex::new(tasks) };
        engine.subscribe_from_broker(&config.broker.subjects)?;

        info!(
            broker_enabled = engine.broker.is_enabled(),
            local_fanout = config.broker.local_fanout,
            origin = %engine.broker.origin(),
            "push engine started"
        );
        Ok(engine)
    }

    pub async fn open_session(
        &self,
        user_id: &str,
        session_id: &str,
        wait: bool,
    ) -> Result<Outbox, PushError> {
        self.sessions.open(user_id, session_id, wait).await
    }

    pub fn close_session(&self, outbox: Outbox) {
        self.sessions.close(outbox);
    }

    /// Deliver straight to the user's sessions on this engine. Never goes
    /// through the broker.
    pub async fn push_to_user<P>(&self, user_id: &str, item: &P) -> Result<usize, PushError>
    where
        P: Pushable + ?Sized,
    {
        self.sessions.push_to_user(user_id, item).await
    }

    pub async fn subscribe(
        &self,
        uri: &str,
        user_id: &str,
        session_id: &str,
        wait: bool,
    ) -> Result<(), PushError> {
        self.topics.subscribe(uri, user_id, session_id, wait).await
    }

    pub async fn unsubscribe(
        &self,
        uri: &str,
        user_id: &str,
        session_id: &str,
        wait: bool,
    ) -> Result<(), PushError> {
        self.topics.unsubscribe(uri, user_id, session_id, wait).await
    }

    /// Build the payload once and publish it to its topic.
    pub async fn publish<P>(&self, item: &P) -> Result<(), PushError>
    where
        P: Pushable + ?Sized,
    {
        let payload = Arc::new(item.build_payload()?);
        self.publish_payload(payload).await;
        Ok(())
    }

    pub async fn publish_payload(&self, payload: Arc<Payload>) {
        self.broker.publish(payload).await;
    }

    /// Receive broker traffic for `kinds` and deliver it locally.
    pub fn subscribe_from_broker(&self, kinds: &[String]) -> Result<(), PushError> {
        let spawned = self.broker.subscribe_subjects(kinds, &self.shutdown_tx)?;
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).extend(spawned);
        Ok(())
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn topics(&self) -> &TopicRegistry {
        &self.topics
    }

    pub fn broker(&self) -> &BrokerAdapter {
        &self.broker
    }

    /// Signal every actor to stop. Does not wait.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Signal shutdown and wait for every actor task to finish.
    pub async fn stop(&self) {
        self.shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            let _ = task.await;
        }
        info!("push engine stopped");
    }
}

impl Drop for PushEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Both registries without a broker, for unit tests.
#[cfg(test)]
pub(crate) fn start_registries(
    config: &PushConfig,
) -> (SessionRegistry, TopicRegistry, broadcast::Sender<()>) {
    let (shutdown_tx, _) = broadcast::channel(4);
    let directory = SessionDirectory::default();
    let (topics, _) = TopicRegistry::start(directory.clone(), config, shutdown_tx.subscribe());
    let (sessions, _) =
        SessionRegistry::start(directory, topics.clone(), config, shutdown_tx.subscribe());
    (sessions, topics, shutdown_tx)
}
