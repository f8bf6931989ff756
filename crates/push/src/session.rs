// Session registry: the actor that owns every user+session -> outbox binding.
//
// Lifecycle mutations (ONLINE/OFFLINE) go through one ordered command queue.
// Fan-out readers (`push_to_user`, topic workers) read the
// directory under its shared lock and never touch the queue.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use courier_common::payload::{Payload, Pushable};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::PushConfig;
use crate::error::PushError;
use crate::queue::enqueue_detached;
use crate::topic::TopicRegistry;

const ACTOR: &str = "session registry";

/// Address of one connected client: `user_id:session_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    user_id: String,
    session_id: String,
}

impl SessionKey {
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self { user_id: user_id.into(), session_id: session_id.into() }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.session_id)
    }
}

/// A registered delivery endpoint.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    outbox: mpsc::Sender<Arc<Payload>>,
    sent: AtomicU64,
}

impl Session {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Payloads accepted into this session's outbox so far.
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Wait for outbox space and enqueue. Returns false once the outbox is closed.
    pub(crate) async fn deliver(&self, payload: Arc<Payload>) -> bool {
        if self.outbox.send(payload).await.is_err() {
            return false;
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// True when `channel` is this session's outbox. A channel whose
    /// senders are all gone belongs to nobody.
    pub(crate) fn owns(&self, channel: &mpsc::WeakSender<Arc<Payload>>) -> bool {
        channel.upgrade().is_some_and(|sender| sender.same_channel(&self.outbox))
    }
}

/// Receiving end of a session's output channel, returned by [`SessionRegistry::open`].
#[derive(Debug)]
pub struct Outbox {
    key: SessionKey,
    receiver: mpsc::Receiver<Arc<Payload>>,
    identity: mpsc::WeakSender<Arc<Payload>>,
}

impl Outbox {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub async fn recv(&mut self) -> Option<Arc<Payload>> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<Payload>, TryRecvError> {
        self.receiver.try_recv()
    }
}

/// `user_id -> session_id -> Session`, shared by the registry and topic workers.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionDirectory {
    users: Arc<RwLock<HashMap<String, HashMap<String, Arc<Session>>>>>,
}

impl SessionDirectory {
    pub(crate) async fn lookup(&self, key: &SessionKey) -> Option<Arc<Session>> {
        let users = self.users.read().await;
        users.get(key.user_id()).and_then(|sessions| sessions.get(key.session_id())).cloned()
    }

    /// Current sessions for `keys`, in order, skipping keys with none.
    pub(crate) async fn resolve<'a, I>(&self, keys: I) -> Vec<Arc<Session>>
    where
        I: IntoIterator<Item = &'a SessionKey>,
    {
        let users = self.users.read().await;
        keys.into_iter()
            .filter_map(|key| {
                users.get(key.user_id()).and_then(|sessions| sessions.get(key.session_id()))
            })
            .cloned()
            .collect()
    }

    pub(crate) async fn sessions_for(&self, user_id: &str) -> Vec<Arc<Session>> {
        let users = self.users.read().await;
        users
            .get(user_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }
}

enum SessionCommand {
    Online { session: Arc<Session>, done: Option<oneshot::Sender<()>> },
    Offline { key: SessionKey, channel: mpsc::WeakSender<Arc<Payload>> },
}

/// Handle to the session registry actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct SessionRegistry {
    directory: SessionDirectory,
    commands: mpsc::Sender<SessionCommand>,
    topics: TopicRegistry,
    outbox_capacity: usize,
}

impl fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online { session, .. } => write!(f, "Online({})", session.key),
            Self::Offline { key, .. } => write!(f, "Offline({key})"),
        }
    }
}

impl SessionRegistry {
    pub(crate) fn start(
        directory: SessionDirectory,
        topics: TopicRegistry,
        config: &PushConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(config.command_buffer.max(1));
        let task = tokio::spawn(run_session_registry(directory.clone(), receiver, shutdown));
        let registry =
            Self { directory, commands, topics, outbox_capacity: config.payload_buffer.max(1) };
        (registry, task)
    }

    /// Register a fresh outbox for `user_id:session_id`.
    ///
    /// With `wait`, returns only after the registry has applied the binding,
    /// so the session is immediately discoverable by subscribe and push.
    pub async fn open(
        &self,
        user_id: &str,
        session_id: &str,
        wait: bool,
    ) -> Result<Outbox, PushError> {
        let key = SessionKey::new(user_id, session_id);
        let (sender, receiver) = mpsc::channel(self.outbox_capacity);
        let identity = sender.downgrade();
        let session =
            Arc::new(Session { key: key.clone(), outbox: sender, sent: AtomicU64::new(0) });

        let (done, completed) = if wait {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        self.commands
            .send(SessionCommand::Online { session, done })
            .await
            .map_err(|_| PushError::Stopped(ACTOR))?;

        if let Some(completed) = completed {
            completed.await.map_err(|_| PushError::Stopped(ACTOR))?;
        }

        Ok(Outbox { key, receiver, identity })
    }

    /// Tear a session down: drop its topic subscriptions and unbind it,
    /// both only if its key still maps to this outbox, then close the
    /// outbox. Never waits on either actor.
    pub fn close(&self, outbox: Outbox) {
        let Outbox { key, mut receiver, identity } = outbox;
        self.topics.clear_owned(&key, identity.clone());
        enqueue_detached(
            &self.commands,
            SessionCommand::Offline { key: key.clone(), channel: identity },
            ACTOR,
        );
        receiver.close();
        debug!(session = %key, "session closed");
    }

    /// Deliver to every live session of `user_id`.
    ///
    /// The payload is built only when the user has at least one session.
    /// Returns the number of sessions that accepted it.
    pub async fn push_to_user<P>(&self, user_id: &str, item: &P) -> Result<usize, PushError>
    where
        P: Pushable + ?Sized,
    {
        let sessions = self.directory.sessions_for(user_id).await;
        if sessions.is_empty() {
            return Ok(0);
        }

        let payload = Arc::new(item.build_payload()?);
        let mut delivered = 0;
        for session in sessions {
            if session.deliver(Arc::clone(&payload)).await {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    pub async fn lookup(&self, user_id: &str, session_id: &str) -> Option<Arc<Session>> {
        self.directory.lookup(&SessionKey::new(user_id, session_id)).await
    }

    /// Snapshot of the live sessions of `user_id`.
    pub async fn sessions_for(&self, user_id: &str) -> Vec<Arc<Session>> {
        self.directory.sessions_for(user_id).await
    }

    pub async fn session_count(&self, user_id: &str) -> usize {
        self.directory.sessions_for(user_id).await.len()
    }

    pub async fn sent_count(&self, user_id: &str, session_id: &str) -> Option<u64> {
        self.lookup(user_id, session_id).await.map(|session| session.sent_count())
    }
}

async fn run_session_registry(
    directory: SessionDirectory,
    mut commands: mpsc::Receiver<SessionCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("session registry started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            maybe_command = commands.recv() => {
                let Some(command) = maybe_command else {
                    break;
                };
                debug!(command = ?command, "session command");
                apply(&directory, command).await;
            }
        }
    }

    info!("session registry stopped");
}

async fn apply(directory: &SessionDirectory, command: SessionCommand) {
    match command {
        SessionCommand::Online { session, done } => {
            {
                let mut users = directory.users.write().await;
                users
                    .entry(session.key.user_id.clone())
                    .or_default()
                    .insert(session.key.session_id.clone(), session);
            }
            if let Some(done) = done {
                let _ = done.send(());
            }
        }
        SessionCommand::Offline { key, channel } => {
            let mut users = directory.users.write().await;
            let Some(sessions) = users.get_mut(key.user_id()) else {
                return;
            };
            match sessions.get(key.session_id()) {
                Some(session) if session.owns(&channel) => {
                    sessions.remove(key.session_id());
                }
                Some(_) => debug!(session = %key, "stale offline ignored, session was reopened"),
                None => {}
            }
            if sessions.is_empty() {
                users.remove(key.user_id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use courier_common::payload::{Op, Payload, PayloadError, Pushable};
    use serde_json::json;
    use tokio::sync::mpsc::error::TryRecvError;
    use tokio::time::timeout;

    use super::SessionKey;
    use crate::config::PushConfig;
    use crate::engine::start_registries;

    struct CountingPushable {
        builds: AtomicUsize,
        seq: u64,
    }

    impl Pushable for CountingPushable {
        fn build_payload(&self) -> Result<Payload, PayloadError> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Payload::new("counter", Op::Upsert, "user:100", json!({ "seq": self.seq }))
        }
    }

    #[tokio::test]
    async fn open_with_wait_is_immediately_discoverable() {
        let (sessions, _topics, _shutdown) = start_registries(&PushConfig::default());

        let _outbox = sessions.open("100", "a", true).await.expect("open should succeed");

        let session = sessions.lookup("100", "a").await.expect("session should be registered");
        assert_eq!(session.key().to_string(), "100:a");
        assert_eq!(sessions.session_count("100").await, 1);
    }

    #[tokio::test]
    async fn late_close_does_not_remove_reopened_session() {
        let (sessions, _topics, _shutdown) = start_registries(&PushConfig::default());

        let first = sessions.open("100", "a", true).await.expect("first open should succeed");
        let mut second =
            sessions.open("100", "a", true).await.expect("second open should succeed");

        sessions.close(first);
        // A waited open is ordered after the OFFLINE, so the registry has applied it.
        let _other = sessions.open("200", "z", true).await.expect("barrier open should succeed");

        assert!(sessions.lookup("100", "a").await.is_some(), "newer session must survive");

        let delivered = sessions
            .push_to_user("100", &Payload::new("k", Op::Upsert, "u", json!(1)).expect("payload"))
            .await
            .expect("push should succeed");
        assert_eq!(delivered, 1);
        assert!(second.try_recv().is_ok(), "newer outbox should receive the push");
    }

    #[tokio::test]
    async fn reopened_session_takes_over_topic_delivery() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let mut first = sessions.open("100", "a", true).await.expect("first open should succeed");
        topics.subscribe("t", "100", "a", true).await.expect("subscribe should succeed");
        let mut second = sessions.open("100", "a", true).await.expect("second open should succeed");

        let payload = Payload::new("k", Op::Upsert, "t", json!(1)).expect("payload");
        assert!(topics.deliver(Arc::new(payload)).await);

        let received = timeout(Duration::from_secs(1), second.recv())
            .await
            .expect("push should arrive in time")
            .expect("current outbox should stay open");
        assert_eq!(received.kind(), "k");
        // Nothing holds the replaced outbox any more.
        assert!(matches!(first.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn late_close_keeps_topic_subscriptions_of_reopened_session() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let first = sessions.open("100", "a", true).await.expect("first open should succeed");
        topics.subscribe("t", "100", "a", true).await.expect("first subscribe should succeed");
        let mut second = sessions.open("100", "a", true).await.expect("second open should succeed");
        topics.subscribe("t", "100", "a", true).await.expect("second subscribe should succeed");

        sessions.close(first);
        // Waited commands order after the OFFLINE and the CLEAR on both actors.
        let _other = sessions.open("200", "z", true).await.expect("barrier open should succeed");
        topics.unsubscribe("t", "nobody", "z", true).await.expect("drain should complete");

        let key = SessionKey::new("100", "a");
        assert!(sessions.lookup("100", "a").await.is_some());
        assert_eq!(topics.subscribers("t").await, vec![key.clone()]);
        assert_eq!(topics.subscriptions(&key).await, vec!["t".to_string()]);

        let payload = Payload::new("k", Op::Upsert, "t", json!(2)).expect("payload");
        assert!(topics.deliver(Arc::new(payload)).await);
        let received = timeout(Duration::from_secs(1), second.recv())
            .await
            .expect("push should arrive in time")
            .expect("current outbox should stay open");
        assert_eq!(received.data(), &json!(2));
    }

    #[tokio::test]
    async fn close_unbinds_matching_session() {
        let (sessions, _topics, _shutdown) = start_registries(&PushConfig::default());

        let outbox = sessions.open("100", "a", true).await.expect("open should succeed");
        sessions.close(outbox);
        let _barrier = sessions.open("200", "z", true).await.expect("barrier open should succeed");

        assert!(sessions.lookup("100", "a").await.is_none());
        assert_eq!(sessions.session_count("100").await, 0);
    }

    #[tokio::test]
    async fn push_to_user_preserves_call_order() {
        let (sessions, _topics, _shutdown) = start_registries(&PushConfig::default());
        let mut outbox = sessions.open("100", "a", true).await.expect("open should succeed");

        let reader = tokio::spawn(async move {
            let mut seen = Vec::with_capacity(1000);
            while seen.len() < 1000 {
                let payload = outbox.recv().await.expect("outbox should stay open");
                seen.push(payload.data()["seq"].as_u64().expect("seq should be a number"));
            }
            seen
        });

        for seq in 0..1000 {
            let item = CountingPushable { builds: AtomicUsize::new(0), seq };
            let delivered = sessions.push_to_user("100", &item).await.expect("push should succeed");
            assert_eq!(delivered, 1);
        }

        let seen = reader.await.expect("reader should finish");
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
        assert_eq!(sessions.sent_count("100", "a").await, Some(1000));
    }

    #[tokio::test]
    async fn push_to_offline_user_skips_payload_build() {
        let (sessions, _topics, _shutdown) = start_registries(&PushConfig::default());
        let item = CountingPushable { builds: AtomicUsize::new(0), seq: 1 };

        let delivered = sessions.push_to_user("nobody", &item).await.expect("push should succeed");

        assert_eq!(delivered, 0);
        assert_eq!(item.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn push_to_user_reaches_every_session() {
        let (sessions, _topics, _shutdown) = start_registries(&PushConfig::default());
        let mut phone = sessions.open("100", "phone", true).await.expect("open should succeed");
        let mut laptop = sessions.open("100", "laptop", true).await.expect("open should succeed");
        let mut other = sessions.open("200", "phone", true).await.expect("open should succeed");

        let payload =
            Payload::new("note", Op::Remove, "notes:1", json!({ "id": 1 })).expect("payload");
        let delivered = sessions.push_to_user("100", &payload).await.expect("push should succeed");

        assert_eq!(delivered, 2);
        assert_eq!(phone.try_recv().expect("phone should receive").kind(), "note");
        assert_eq!(laptop.try_recv().expect("laptop should receive").op(), Op::Remove);
        assert!(other.try_recv().is_err());
    }
}
