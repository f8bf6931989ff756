// Topic registry: creates and reclaims topic workers and keeps the
// session -> topics subscription index.
//
// Workers are created lazily on the first SUBSCRIBE and destroyed only by
// the periodic cleanup sweep, once they have no subscribers and no queued
// SUBSCRIBE.

mod worker;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use courier_common::payload::Payload;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use crate::config::PushConfig;
use crate::error::PushError;
use crate::queue::enqueue_detached;
use crate::session::{SessionDirectory, SessionKey};
use worker::{TopicHandle, WorkerCommand};

const ACTOR: &str = "topic registry";
const MIN_CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub(crate) enum TopicCommand {
    Subscribe { uri: String, key: SessionKey, done: Option<oneshot::Sender<()>> },
    Unsubscribe { uri: String, key: SessionKey, done: Option<oneshot::Sender<()>> },
    /// With a channel, applied only while `key` is unbound or still bound
    /// to that channel.
    ClearAll { key: SessionKey, channel: Option<mpsc::WeakSender<Arc<Payload>>> },
    /// Sent by a worker that could not resolve a subscribing session.
    Forget { uri: String, key: SessionKey },
    Sweep { done: Option<oneshot::Sender<usize>> },
}

#[derive(Debug, Default)]
struct TopicTable {
    topics: HashMap<String, TopicHandle>,
    index: HashMap<SessionKey, HashSet<String>>,
}

impl TopicTable {
    fn unindex(&mut self, key: &SessionKey, uri: &str) {
        if let Some(uris) = self.index.get_mut(key) {
            uris.remove(uri);
            if uris.is_empty() {
                self.index.remove(key);
            }
        }
    }
}

/// Handle to the topic registry actor. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TopicRegistry {
    table: Arc<RwLock<TopicTable>>,
    commands: mpsc::Sender<TopicCommand>,
}

impl TopicRegistry {
    pub(crate) fn start(
        sessions: SessionDirectory,
        config: &PushConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, receiver) = mpsc::channel(config.command_buffer.max(1));
        let table = Arc::new(RwLock::new(TopicTable::default()));
        let actor = TopicActor {
            table: Arc::clone(&table),
            sessions,
            feedback: commands.downgrade(),
            command_capacity: config.command_buffer.max(1),
            payload_capacity: config.payload_buffer.max(1),
        };
        let cleanup_interval = config.cleanup_interval.max(MIN_CLEANUP_INTERVAL);
        let task = tokio::spawn(actor.run(receiver, cleanup_interval, shutdown));
        (Self { table, commands }, task)
    }

    /// Subscribe `user_id:session_id` to `uri`, starting the topic if needed.
    ///
    /// With `wait`, returns once the topic worker has applied the
    /// subscription, so publishes issued afterwards reach this session.
    pub async fn subscribe(
        &self,
        uri: &str,
        user_id: &str,
        session_id: &str,
        wait: bool,
    ) -> Result<(), PushError> {
        let key = SessionKey::new(user_id, session_id);
        let (done, completed) = completion(wait);
        self.send(TopicCommand::Subscribe { uri: uri.to_string(), key, done }).await?;
        await_completion(completed).await
    }

    /// Drop one subscription. Unknown topics are a no-op.
    pub async fn unsubscribe(
        &self,
        uri: &str,
        user_id: &str,
        session_id: &str,
        wait: bool,
    ) -> Result<(), PushError> {
        let key = SessionKey::new(user_id, session_id);
        let (done, completed) = completion(wait);
        self.send(TopicCommand::Unsubscribe { uri: uri.to_string(), key, done }).await?;
        await_completion(completed).await
    }

    /// Drop every subscription held by `key`, whichever outbox it is bound to.
    pub async fn clear_all(&self, key: &SessionKey) -> Result<(), PushError> {
        self.send(TopicCommand::ClearAll { key: key.clone(), channel: None }).await
    }

    /// Drop every subscription held by `key` unless the key has been
    /// reopened on another outbox. Never waits on the actor.
    pub(crate) fn clear_owned(&self, key: &SessionKey, channel: mpsc::WeakSender<Arc<Payload>>) {
        let command = TopicCommand::ClearAll { key: key.clone(), channel: Some(channel) };
        enqueue_detached(&self.commands, command, ACTOR);
    }

    /// Run the cleanup scan now. With `wait`, returns the number of topics reclaimed.
    pub async fn sweep(&self, wait: bool) -> Result<usize, PushError> {
        if !wait {
            self.send(TopicCommand::Sweep { done: None }).await?;
            return Ok(0);
        }
        let (done, completed) = oneshot::channel();
        self.send(TopicCommand::Sweep { done: Some(done) }).await?;
        completed.await.map_err(|_| PushError::Stopped(ACTOR))
    }

    /// Hand a payload to its topic worker. Returns false when no topic exists
    /// for the payload's uri, which means there is nobody to deliver to.
    pub async fn deliver(&self, payload: Arc<Payload>) -> bool {
        let queue = {
            let table = self.table.read().await;
            match table.topics.get(payload.uri()) {
                Some(handle) => handle.payloads.clone(),
                None => return false,
            }
        };
        queue.send(payload).await.is_ok()
    }

    pub async fn topic_count(&self) -> usize {
        self.table.read().await.topics.len()
    }

    pub async fn has_topic(&self, uri: &str) -> bool {
        self.table.read().await.topics.contains_key(uri)
    }

    /// Current subscribers of `uri`, sorted.
    pub async fn subscribers(&self, uri: &str) -> Vec<SessionKey> {
        let subscribers = {
            let table = self.table.read().await;
            match table.topics.get(uri) {
                Some(handle) => Arc::clone(&handle.subscribers),
                None => return Vec::new(),
            }
        };
        let mut keys: Vec<SessionKey> = subscribers.read().await.iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Topics `key` is indexed under, sorted.
    pub async fn subscriptions(&self, key: &SessionKey) -> Vec<String> {
        let table = self.table.read().await;
        let mut uris: Vec<String> =
            table.index.get(key).map(|uris| uris.iter().cloned().collect()).unwrap_or_default();
        uris.sort();
        uris
    }

    async fn send(&self, command: TopicCommand) -> Result<(), PushError> {
        self.commands.send(command).await.map_err(|_| PushError::Stopped(ACTOR))
    }
}

fn completion(wait: bool) -> (Option<oneshot::Sender<()>>, Option<oneshot::Receiver<()>>) {
    if wait {
        let (tx, rx) = oneshot::channel();
        (Some(tx), Some(rx))
    } else {
        (None, None)
    }
}

async fn await_completion(completed: Option<oneshot::Receiver<()>>) -> Result<(), PushError> {
    match completed {
        Some(completed) => completed.await.map_err(|_| PushError::Stopped(ACTOR)),
        None => Ok(()),
    }
}

struct TopicActor {
    table: Arc<RwLock<TopicTable>>,
    sessions: SessionDirectory,
    feedback: mpsc::WeakSender<TopicCommand>,
    command_capacity: usize,
    payload_capacity: usize,
}

impl TopicActor {
    async fn run(
        self,
        mut commands: mpsc::Receiver<TopicCommand>,
        cleanup_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut cleanup =
            tokio::time::interval_at(Instant::now() + cleanup_interval, cleanup_interval);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(cleanup_secs = cleanup_interval.as_secs(), "topic registry started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                maybe_command = commands.recv() => {
                    let Some(command) = maybe_command else {
                        break;
                    };
                    trace!(command = ?command, "topic command");
                    self.apply(command).await;
                }

                _ = cleanup.tick() => {
                    self.sweep().await;
                }
            }
        }

        self.stop_all().await;
        info!("topic registry stopped");
    }

    async fn apply(&self, command: TopicCommand) {
        match command {
            TopicCommand::Subscribe { uri, key, done } => {
                let queue = {
                    let mut table = self.table.write().await;
                    let handle = table.topics.entry(uri.clone()).or_insert_with(|| {
                        debug!(uri = %uri, "starting topic worker");
                        TopicHandle::spawn(
                            uri.clone(),
                            self.sessions.clone(),
                            self.feedback.clone(),
                            self.command_capacity,
                            self.payload_capacity,
                        )
                    });
                    handle.pending.fetch_add(1, Ordering::SeqCst);
                    let queue = handle.commands.clone();
                    table.index.entry(key.clone()).or_default().insert(uri);
                    queue
                };
                let _ = queue.send(WorkerCommand::Subscribe { key, done }).await;
            }
            TopicCommand::Unsubscribe { uri, key, done } => {
                let queue = {
                    let mut table = self.table.write().await;
                    table.unindex(&key, &uri);
                    table.topics.get(&uri).map(|handle| handle.commands.clone())
                };
                match queue {
                    Some(queue) => {
                        let _ = queue.send(WorkerCommand::Unsubscribe { key, done }).await;
                    }
                    None => {
                        if let Some(done) = done {
                            let _ = done.send(());
                        }
                    }
                }
            }
            TopicCommand::ClearAll { key, channel } => {
                if let Some(channel) = &channel {
                    let reopened = self
                        .sessions
                        .lookup(&key)
                        .await
                        .is_some_and(|current| !current.owns(channel));
                    if reopened {
                        debug!(session = %key, "stale clear ignored, session was reopened");
                        return;
                    }
                }
                let queues: Vec<_> = {
                    let mut table = self.table.write().await;
                    let uris = table.index.remove(&key).unwrap_or_default();
                    uris.iter()
                        .filter_map(|uri| table.topics.get(uri))
                        .map(|handle| handle.commands.clone())
                        .collect()
                };
                for queue in queues {
                    let _ = queue.send(WorkerCommand::Clear { key: key.clone() }).await;
                }
            }
            TopicCommand::Forget { uri, key } => {
                let mut table = self.table.write().await;
                let still_wanted = match table.topics.get(&uri) {
                    Some(handle) => {
                        handle.pending.load(Ordering::SeqCst) > 0
                            || handle.subscribers.read().await.contains(&key)
                    }
                    None => false,
                };
                if !still_wanted {
                    table.unindex(&key, &uri);
                }
            }
            TopicCommand::Sweep { done } => {
                let reclaimed = self.sweep().await;
                if let Some(done) = done {
                    let _ = done.send(reclaimed);
                }
            }
        }
    }

    /// Stop and remove every topic with no subscribers and no queued SUBSCRIBE.
    async fn sweep(&self) -> usize {
        let (stopped, active) = {
            let mut table = self.table.write().await;
            let mut idle = Vec::new();
            for (uri, handle) in &table.topics {
                if handle.is_idle().await {
                    idle.push(uri.clone());
                }
            }

            let mut stopped = Vec::with_capacity(idle.len());
            for uri in idle {
                if let Some(handle) = table.topics.remove(&uri) {
                    table.index.retain(|_, uris| {
                        uris.remove(&uri);
                        !uris.is_empty()
                    });
                    stopped.push((uri, handle));
                }
            }
            (stopped, table.topics.len())
        };

        for (uri, handle) in &stopped {
            let _ = handle.commands.send(WorkerCommand::Stop).await;
            debug!(uri = %uri, "topic reclaimed");
        }
        debug!(active, reclaimed = stopped.len(), "topic cleanup finished");
        stopped.len()
    }

    async fn stop_all(&self) {
        let handles: Vec<TopicHandle> = {
            let mut table = self.table.write().await;
            table.index.clear();
            table.topics.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            let _ = handle.commands.send(WorkerCommand::Stop).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use courier_common::payload::{Op, Payload};
    use serde_json::json;
    use tokio::time::{sleep, Instant};

    use crate::config::PushConfig;
    use crate::engine::start_registries;
    use crate::session::SessionKey;

    fn payload(uri: &str, seq: u64) -> Arc<Payload> {
        Arc::new(Payload::new("tick", Op::Upsert, uri, json!({ "seq": seq })).expect("payload"))
    }

    #[tokio::test]
    async fn subscribe_creates_topic_and_indexes_session() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let _outbox = sessions.open("100", "a", true).await.expect("open should succeed");

        topics.subscribe("test:uri", "100", "a", true).await.expect("subscribe should succeed");

        let key = SessionKey::new("100", "a");
        assert!(topics.has_topic("test:uri").await);
        assert_eq!(topics.subscribers("test:uri").await, vec![key.clone()]);
        assert_eq!(topics.subscriptions(&key).await, vec!["test:uri".to_string()]);
    }

    #[tokio::test]
    async fn deliver_reaches_only_subscribers() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let mut subscriber = sessions.open("100", "a", true).await.expect("open should succeed");
        let mut bystander = sessions.open("200", "b", true).await.expect("open should succeed");
        topics.subscribe("test:uri", "100", "a", true).await.expect("subscribe should succeed");

        assert!(topics.deliver(payload("test:uri", 1)).await);
        let received = subscriber.recv().await.expect("subscriber should receive");
        assert_eq!(received.data()["seq"], 1);
        assert!(bystander.try_recv().is_err());

        assert!(!topics.deliver(payload("other:uri", 2)).await, "no topic means no delivery");
    }

    #[tokio::test]
    async fn subscribe_for_unknown_session_is_dropped_and_unindexed() {
        let (_sessions, topics, _shutdown) = start_registries(&PushConfig::default());

        topics.subscribe("test:uri", "ghost", "x", true).await.expect("subscribe should complete");
        // Forget is queued behind the wait completion; a second waited command orders after it.
        topics.unsubscribe("unrelated", "ghost", "y", true).await.expect("barrier should complete");

        assert!(topics.subscribers("test:uri").await.is_empty());
        assert!(topics.subscriptions(&SessionKey::new("ghost", "x")).await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_from_missing_topic_is_noop() {
        let (_sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        topics
            .unsubscribe("never:existed", "100", "a", true)
            .await
            .expect("unsubscribe should succeed");
        assert_eq!(topics.topic_count().await, 0);
    }

    #[tokio::test]
    async fn subscribe_unsubscribe_sequence_converges_to_net_effect() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let _outbox = sessions.open("100", "a", true).await.expect("open should succeed");
        let key = SessionKey::new("100", "a");

        let sequence = [true, true, false, true, false, false, true];
        for subscribe in sequence {
            if subscribe {
                topics.subscribe("t", "100", "a", false).await.expect("subscribe should enqueue");
            } else {
                topics
                    .unsubscribe("t", "100", "a", false)
                    .await
                    .expect("unsubscribe should enqueue");
            }
        }
        topics.subscribe("barrier", "100", "a", true).await.expect("barrier should complete");
        // Worker queues for "t" are drained by the time a later waited command on "t" completes.
        topics.unsubscribe("t", "nobody", "z", true).await.expect("drain should complete");

        assert_eq!(topics.subscribers("t").await, vec![key.clone()]);
        assert!(topics.subscriptions(&key).await.contains(&"t".to_string()));
    }

    #[tokio::test]
    async fn clear_all_removes_every_subscription() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let _outbox = sessions.open("100", "a", true).await.expect("open should succeed");
        for uri in ["a:1", "a:2", "a:3"] {
            topics.subscribe(uri, "100", "a", true).await.expect("subscribe should succeed");
        }

        let key = SessionKey::new("100", "a");
        topics.clear_all(&key).await.expect("clear should enqueue");
        for uri in ["a:1", "a:2", "a:3"] {
            topics.unsubscribe(uri, "nobody", "z", true).await.expect("drain should complete");
            assert!(topics.subscribers(uri).await.is_empty());
        }
        assert!(topics.subscriptions(&key).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_reclaims_only_empty_topics() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let _outbox = sessions.open("100", "a", true).await.expect("open should succeed");
        topics.subscribe("busy", "100", "a", true).await.expect("subscribe should succeed");
        topics.subscribe("idle", "100", "a", true).await.expect("subscribe should succeed");
        topics.unsubscribe("idle", "100", "a", true).await.expect("unsubscribe should succeed");

        let reclaimed = topics.sweep(true).await.expect("sweep should run");

        assert_eq!(reclaimed, 1);
        assert!(topics.has_topic("busy").await);
        assert!(!topics.has_topic("idle").await);
    }

    #[tokio::test]
    async fn sweep_spares_topic_with_queued_subscribe() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let mut outbox = sessions.open("100", "a", true).await.expect("open should succeed");

        topics.subscribe("t", "100", "a", false).await.expect("subscribe should enqueue");
        let reclaimed = topics.sweep(true).await.expect("sweep should run");

        assert_eq!(reclaimed, 0);
        assert!(topics.has_topic("t").await, "a topic with a queued subscribe is never reclaimed");

        topics.unsubscribe("t", "nobody", "z", true).await.expect("drain should complete");
        assert_eq!(topics.subscribers("t").await, vec![SessionKey::new("100", "a")]);
        assert!(topics.deliver(payload("t", 5)).await);
        let received = outbox.recv().await.expect("new subscriber should receive");
        assert_eq!(received.data()["seq"], 5);
    }

    #[tokio::test]
    async fn closes_past_command_capacity_are_still_applied() {
        let config = PushConfig { command_buffer: 1, ..PushConfig::default() };
        let (sessions, topics, _shutdown) = start_registries(&config);
        let names = ["a", "b", "c", "d", "e"];
        let mut outboxes = Vec::with_capacity(names.len());
        for name in names {
            outboxes.push(sessions.open("100", name, true).await.expect("open should succeed"));
            topics.subscribe("t", "100", name, true).await.expect("subscribe should succeed");
        }

        // Back-to-back closes overflow both one-slot queues.
        for outbox in outboxes {
            sessions.close(outbox);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while sessions.session_count("100").await > 0 || !topics.subscribers("t").await.is_empty() {
            assert!(Instant::now() < deadline, "every OFFLINE and CLEAR should be applied");
            sleep(Duration::from_millis(10)).await;
        }
        for name in names {
            assert!(topics.subscriptions(&SessionKey::new("100", name)).await.is_empty());
        }
    }

    #[tokio::test]
    async fn resubscribe_after_reclaim_recreates_topic() {
        let (sessions, topics, _shutdown) = start_registries(&PushConfig::default());
        let mut outbox = sessions.open("100", "a", true).await.expect("open should succeed");
        topics.subscribe("t", "100", "a", true).await.expect("subscribe should succeed");
        topics.unsubscribe("t", "100", "a", true).await.expect("unsubscribe should succeed");
        assert_eq!(topics.sweep(true).await.expect("sweep should run"), 1);
        assert!(!topics.has_topic("t").await);

        topics.subscribe("t", "100", "a", true).await.expect("resubscribe should succeed");
        assert!(topics.deliver(payload("t", 9)).await);

        let received = outbox.recv().await.expect("resubscribed session should receive");
        assert_eq!(received.data()["seq"], 9);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_cleanup_reclaims_after_interval() {
        let config =
            PushConfig { cleanup_interval: Duration::from_secs(60), ..PushConfig::default() };
        let (sessions, topics, _shutdown) = start_registries(&config);
        let _outbox = sessions.open("100", "a", true).await.expect("open should succeed");
        topics.subscribe("t", "100", "a", true).await.expect("subscribe should succeed");
        topics.unsubscribe("t", "100", "a", true).await.expect("unsubscribe should succeed");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(topics.has_topic("t").await, "topic survives until the interval elapses");

        tokio::time::sleep(Duration::from_secs(31)).await;
        // Any waited command orders after the tick the actor just handled.
        topics.unsubscribe("x", "nobody", "z", true).await.expect("barrier should complete");
        assert!(!topics.has_topic("t").await);
    }
}
