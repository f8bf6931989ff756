// One actor per active topic: owns the subscriber set and fans payloads out.
//
// Subscribers are session keys. Each payload goes to whatever outbox the
// directory binds the key to at fan-out time, so a reopened session takes
// over its key's subscriptions and the replaced outbox gets nothing more.

use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use courier_common::payload::Payload;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, trace, warn};

use super::TopicCommand;
use crate::session::{SessionDirectory, SessionKey};

pub(crate) type Subscribers = Arc<RwLock<HashSet<SessionKey>>>;

#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Subscribe { key: SessionKey, done: Option<oneshot::Sender<()>> },
    Unsubscribe { key: SessionKey, done: Option<oneshot::Sender<()>> },
    Clear { key: SessionKey },
    Stop,
}

/// Registry-side handle to a running worker.
#[derive(Debug)]
pub(crate) struct TopicHandle {
    pub(crate) commands: mpsc::Sender<WorkerCommand>,
    pub(crate) payloads: mpsc::Sender<Arc<Payload>>,
    pub(crate) subscribers: Subscribers,
    /// SUBSCRIBE commands forwarded but not yet applied.
    pub(crate) pending: Arc<AtomicUsize>,
}

impl TopicHandle {
    pub(crate) fn spawn(
        uri: String,
        sessions: SessionDirectory,
        feedback: mpsc::WeakSender<TopicCommand>,
        command_capacity: usize,
        payload_capacity: usize,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(command_capacity);
        let (payloads, payload_rx) = mpsc::channel(payload_capacity);
        let subscribers = Subscribers::default();
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = TopicWorker {
            uri,
            subscribers: Arc::clone(&subscribers),
            pending: Arc::clone(&pending),
            sessions,
            feedback,
        };
        tokio::spawn(worker.run(command_rx, payload_rx));

        Self { commands, payloads, subscribers, pending }
    }

    /// No subscribers and no queued SUBSCRIBE. Decided under the subscriber read lock.
    pub(crate) async fn is_idle(&self) -> bool {
        let subscribers = self.subscribers.read().await;
        subscribers.is_empty() && self.pending.load(Ordering::SeqCst) == 0
    }
}

struct TopicWorker {
    uri: String,
    subscribers: Subscribers,
    pending: Arc<AtomicUsize>,
    sessions: SessionDirectory,
    feedback: mpsc::WeakSender<TopicCommand>,
}

impl TopicWorker {
    async fn run(
        self,
        mut commands: mpsc::Receiver<WorkerCommand>,
        mut payloads: mpsc::Receiver<Arc<Payload>>,
    ) {
        debug!(uri = %self.uri, "topic worker started");

        loop {
            tokio::select! {
                maybe_command = commands.recv() => {
                    let Some(command) = maybe_command else {
                        break;
                    };
                    if self.apply(command).await.is_break() {
                        break;
                    }
                }
                maybe_payload = payloads.recv() => {
                    let Some(payload) = maybe_payload else {
                        break;
                    };
                    self.fan_out(payload).await;
                }
            }
        }

        commands.close();
        payloads.close();
        debug!(uri = %self.uri, "topic worker stopped");
    }

    async fn apply(&self, command: WorkerCommand) -> ControlFlow<()> {
        match command {
            WorkerCommand::Subscribe { key, done } => {
                if self.sessions.lookup(&key).await.is_some() {
                    self.subscribers.write().await.insert(key.clone());
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    trace!(uri = %self.uri, session = %key, "subscribed");
                } else {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    warn!(uri = %self.uri, session = %key, "session not found, subscribe dropped");
                    self.report_unresolved(key);
                }
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            WorkerCommand::Unsubscribe { key, done } => {
                self.subscribers.write().await.remove(&key);
                if let Some(done) = done {
                    let _ = done.send(());
                }
            }
            WorkerCommand::Clear { key } => {
                self.subscribers.write().await.remove(&key);
            }
            WorkerCommand::Stop => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    /// Write `payload` into every subscriber's current outbox, waiting on full ones.
    async fn fan_out(&self, payload: Arc<Payload>) {
        let keys: Vec<SessionKey> = self.subscribers.read().await.iter().cloned().collect();
        for session in self.sessions.resolve(&keys).await {
            if !session.deliver(Arc::clone(&payload)).await {
                trace!(uri = %self.uri, session = %session.key(), "outbox closed, skipped");
            }
        }
    }

    fn report_unresolved(&self, key: SessionKey) {
        let Some(registry) = self.feedback.upgrade() else {
            return;
        };
        let command = TopicCommand::Forget { uri: self.uri.clone(), key };
        if registry.try_send(command).is_err() {
            warn!(uri = %self.uri, "topic registry busy, unresolved subscription left in index");
        }
    }
}
