//! Event bus
//!
//! Subscriptions are made on topic patterns whose `.`-separated segments may
//! be `*` (exactly one segment). Each subscribed pattern owns a bounded queue
//! and a delivery task; publishing matches the concrete topic against every
//! pattern and enqueues without ever waiting. A full queue drops the message
//! and bumps the overflow counter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default per-topic queue capacity
pub const DEFAULT_TOPIC_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub topic: String,
    pub from: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    pub ts: u64,
    pub payload: serde_json::Value,
}

impl EventMessage {
    pub fn new(
        topic: impl Into<String>,
        from: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let topic = topic.into();
        Self {
            event: topic.clone(),
            topic,
            from: from.into(),
            kind: kind.into(),
            ts: common::time::now_ms(),
            payload,
        }
    }
}

pub type SubscriberId = String;

type Handler = Arc<dyn Fn(EventMessage) -> BoxFuture<'static, ()> + Send + Sync>;

struct TopicQueue {
    tx: mpsc::Sender<EventMessage>,
    handlers: Arc<RwLock<Vec<(SubscriberId, Handler)>>>,
    token: CancellationToken,
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, TopicQueue>,
    // subscriber id -> pattern
    subscribers: HashMap<SubscriberId, String>,
}

pub struct EventBus {
    state: Mutex<BusState>,
    capacity: usize,
    overflow: AtomicU64,
    stopped: AtomicBool,
    token: CancellationToken,
}

/// `*` in the pattern matches exactly one segment
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut p = pattern.split('.');
    let mut t = topic.split('.');
    loop {
        match (p.next(), t.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => {},
            (Some(a), Some(b)) if a == b => {},
            _ => return false,
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            capacity: capacity.max(1),
            overflow: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    /// Register `handler` on `pattern`. Must be called inside a tokio runtime.
    pub fn subscribe<F, Fut>(&self, pattern: &str, handler: F) -> SubscriberId
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        if self.stopped.load(Ordering::Acquire) {
            return id;
        }
        let handler: Handler = Arc::new(move |msg| -> BoxFuture<'static, ()> { handler(msg).boxed() });

        let mut state = self.state.lock();
        let queue = state
            .topics
            .entry(pattern.to_string())
            .or_insert_with(|| self.spawn_topic(pattern));
        queue.handlers.write().push((id.clone(), handler));
        state.subscribers.insert(id.clone(), pattern.to_string());
        debug!("eventbus subscribe {} -> {}", id, pattern);
        id
    }

    fn spawn_topic(&self, pattern: &str) -> TopicQueue {
        let (tx, mut rx) = mpsc::channel::<EventMessage>(self.capacity);
        let handlers: Arc<RwLock<Vec<(SubscriberId, Handler)>>> = Arc::default();
        let token = self.token.child_token();

        let task_handlers = Arc::clone(&handlers);
        let task_token = token.clone();
        let name = pattern.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(msg) = msg else { break };
                        let current: Vec<Handler> =
                            task_handlers.read().iter().map(|(_, h)| Arc::clone(h)).collect();
                        for handler in current {
                            handler(msg.clone()).await;
                        }
                    }
                }
            }
            debug!("eventbus topic {} delivery stopped", name);
        });

        TopicQueue {
            tx,
            handlers,
            token,
        }
    }

    /// Remove a subscriber; the topic task goes away with its last subscriber
    pub fn unsubscribe(&self, id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(pattern) = state.subscribers.remove(id) else {
            return false;
        };
        let empty = match state.topics.get(&pattern) {
            Some(queue) => {
                let mut handlers = queue.handlers.write();
                handlers.retain(|(sid, _)| sid != id);
                handlers.is_empty()
            },
            None => false,
        };
        if empty {
            if let Some(queue) = state.topics.remove(&pattern) {
                queue.token.cancel();
            }
        }
        true
    }

    /// Enqueue `msg` on every pattern matching `topic`; never waits
    pub fn publish(&self, topic: &str, msg: EventMessage) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let state = self.state.lock();
        for (pattern, queue) in state.topics.iter() {
            if !topic_matches(pattern, topic) {
                continue;
            }
            match queue.tx.try_send(msg.clone()) {
                Ok(()) => {},
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped.is_power_of_two() {
                        warn!("eventbus queue full on {}, dropped {} so far", pattern, dropped);
                    }
                },
                Err(mpsc::error::TrySendError::Closed(_)) => {},
            }
        }
    }

    /// Messages dropped because a topic queue was full
    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    /// Patterns that currently own a queue and delivery task
    pub fn topic_count(&self) -> usize {
        self.state.lock().topics.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Messages waiting in every topic queue
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .topics
            .values()
            .map(|q| self.capacity - q.tx.capacity())
            .sum()
    }

    /// Cancel every delivery task and drop all subscriptions
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.token.cancel();
        let mut state = self.state.lock();
        state.topics.clear();
        state.subscribers.clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Notify;

    fn msg(topic: &str) -> EventMessage {
        EventMessage::new(topic, "test", "test", serde_json::json!("x"))
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("a.b.c", "a.b.c"));
        assert!(topic_matches("a.b.*", "a.b.c"));
        assert!(topic_matches("*.b.c", "a.b.c"));
        assert!(topic_matches("a.*.d", "a.x.d"));
        assert!(!topic_matches("a.*.d", "a.b.c"));
        assert!(!topic_matches("a.b", "a.b.c"));
        assert!(!topic_matches("a.b.c.*", "a.b.c"));
    }

    #[tokio::test]
    async fn test_wildcard_delivery() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
        for (pattern, tag) in [("a.b.c", "1"), ("a.b.*", "2"), ("a.*.d", "3"), ("*.b.c", "4")] {
            let tx = tx.clone();
            bus.subscribe(pattern, move |_| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(tag);
                }
            });
        }

        bus.publish("a.b.c", msg("a.b.c"));

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        got.sort();
        assert_eq!(got, vec!["1", "2", "4"]);
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_leaves_nothing() {
        let bus = EventBus::new();
        bus.publish("nobody.listens", msg("nobody.listens"));
        assert_eq!(bus.topic_count(), 0);
        assert_eq!(bus.pending(), 0);
    }

    #[tokio::test]
    async fn test_publish_never_blocks_on_stalled_subscriber() {
        let bus = EventBus::with_capacity(DEFAULT_TOPIC_CAPACITY);
        let release = Arc::new(Notify::new());
        let gate = Arc::clone(&release);
        bus.subscribe("stall.*", move |_| {
            let gate = Arc::clone(&gate);
            async move { gate.notified().await }
        });

        let started = std::time::Instant::now();
        for _ in 0..1500 {
            bus.publish("stall.x", msg("stall.x"));
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(bus.overflow_count() >= 499);
        release.notify_waiters();
    }

    #[tokio::test]
    async fn test_last_unsubscribe_tears_down_topic() {
        let bus = EventBus::new();
        let a = bus.subscribe("x.y", |_| async {});
        let b = bus.subscribe("x.y", |_| async {});
        assert_eq!(bus.topic_count(), 1);

        assert!(bus.unsubscribe(&a));
        assert_eq!(bus.topic_count(), 1);
        assert!(bus.unsubscribe(&b));
        assert_eq!(bus.topic_count(), 0);
        assert!(!bus.unsubscribe(&b));
    }

    #[tokio::test]
    async fn test_stop_drops_everything() {
        let bus = EventBus::new();
        bus.subscribe("a.*", |_| async {});
        bus.stop();
        bus.stop();
        assert_eq!(bus.topic_count(), 0);
        bus.publish("a.b", msg("a.b"));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
