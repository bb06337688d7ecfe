//! In-memory broker for tests and simulation.
//!
//! [`InMemoryBroker`] implements both [`KeyValueBroker`] and [`StreamBroker`]
//! inside the process. It keeps the semantics the rest of the crate relies on:
//!
//! - bucket-wide, strictly increasing revisions and conditional updates
//! - bounded per-key history, TTL expiry, delete and purge markers
//! - a watch feed that replays the latest entry per key, then follows writes
//! - work-queue streams, durable pull consumers shared by many subscriptions,
//!   explicit ack, in-progress and term, redelivery after `ack_wait`
//!
//! Clones share state, so every "process" of a test cluster can hold its own
//! handle to the same broker.
//!
//! # Fault injection
//!
//! Tests can make the broker unavailable, force the next conditional updates
//! to conflict, fail publishes after a number of successes, or stall consumer
//! subscriptions. Faults are checked before any state is touched.
//!
//! All timing uses tokio's clock, so tests running with paused time see TTL and
//! ack-wait expiry deterministically.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;

use super::{
    subject_matches, AckKind, AckPolicy, BucketConfig, ConsumerConfig, Headers, KeyStream,
    KeyValueBroker, KvEntry, KvOperation, MessageAcker, MessageInfo, PublishAck,
    PullSubscription, RawMessage, RetentionPolicy, Revision, StreamBroker, StreamConfig,
    StreamInfo, WatchStream,
};
use crate::error::BrokerError;

/// Capacity of each bucket's change-feed channel.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Process-local broker sharing state between clones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    faults: Mutex<Faults>,
}

#[derive(Debug, Default)]
struct State {
    buckets: HashMap<String, Bucket>,
    streams: HashMap<String, Stream>,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: bool,
    conflicting_updates: u32,
    publishes_before_failure: Option<u32>,
    subscribe_delay: Duration,
}

#[derive(Debug)]
struct Bucket {
    config: BucketConfig,
    last_revision: u64,
    /// Per-key history, oldest first.
    keys: HashMap<String, Vec<StoredEntry>>,
    watchers: broadcast::Sender<KvEntry>,
}

#[derive(Debug, Clone)]
struct StoredEntry {
    entry: KvEntry,
    written_at: Instant,
}

#[derive(Debug)]
struct Stream {
    config: StreamConfig,
    last_sequence: u64,
    messages: BTreeMap<u64, StoredMessage>,
    consumers: HashMap<String, Consumer>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct StoredMessage {
    subject: String,
    headers: Headers,
    payload: Bytes,
    published_at: Instant,
}

#[derive(Debug)]
struct Consumer {
    config: ConsumerConfig,
    /// Delivered but not yet acknowledged: sequence -> redelivery deadline.
    pending: HashMap<u64, Instant>,
    delivery_counts: HashMap<u64, u32>,
    /// Acknowledged or terminated on a limits-retention stream.
    done: HashSet<u64>,
}

impl InMemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`BrokerError::Unavailable`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.faults.lock().unavailable = unavailable;
    }

    /// Make the next `count` conditional updates fail with a revision conflict.
    pub fn inject_update_conflicts(&self, count: u32) {
        self.inner.faults.lock().conflicting_updates = count;
    }

    /// Let `successes` more publishes through, then fail every publish.
    /// `None` clears the fault.
    pub fn fail_publishes_after(&self, successes: Option<u32>) {
        self.inner.faults.lock().publishes_before_failure = successes;
    }

    /// Hold every `pull_subscribe` for `delay` before it is served.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        self.inner.faults.lock().subscribe_delay = delay;
    }

    /// Number of delivered-but-unacknowledged messages of a consumer.
    pub fn ack_pending(&self, stream: &str, consumer: &str) -> usize {
        let state = self.inner.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(consumer))
            .map_or(0, |c| c.pending.len())
    }

    fn check_available(&self) -> Result<(), BrokerError> {
        if self.inner.faults.lock().unavailable {
            return Err(BrokerError::Unavailable("injected outage".into()));
        }
        Ok(())
    }
}

fn validate_key(key: &str) -> Result<(), BrokerError> {
    let legal = !key.is_empty()
        && !key.starts_with('.')
        && !key.ends_with('.')
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '/' | '_' | '=' | '.'));
    if legal {
        Ok(())
    } else {
        Err(BrokerError::InvalidKey(key.to_string()))
    }
}

impl Bucket {
    fn new(config: BucketConfig) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
        Self {
            config,
            last_revision: 0,
            keys: HashMap::new(),
            watchers,
        }
    }

    fn is_expired(&self, stored: &StoredEntry, now: Instant) -> bool {
        !self.config.max_age.is_zero() && now.duration_since(stored.written_at) >= self.config.max_age
    }

    /// Latest non-expired entry of a key, any operation.
    fn latest(&self, key: &str, now: Instant) -> Option<&KvEntry> {
        self.keys
            .get(key)
            .and_then(|history| history.last())
            .filter(|stored| !self.is_expired(stored, now))
            .map(|stored| &stored.entry)
    }

    fn live(&self, key: &str, now: Instant) -> Option<&KvEntry> {
        self.latest(key, now)
            .filter(|entry| entry.operation == KvOperation::Put)
    }

    fn write(&mut self, key: &str, value: Bytes, operation: KvOperation, now: Instant) -> Revision {
        self.last_revision += 1;
        let entry = KvEntry {
            bucket: self.config.name.clone(),
            key: key.to_string(),
            value,
            revision: Revision(self.last_revision),
            operation,
        };

        let history_limit = usize::from(self.config.history.max(1));
        let history = self.keys.entry(key.to_string()).or_default();
        if operation == KvOperation::Purge {
            history.clear();
        }
        history.push(StoredEntry {
            entry: entry.clone(),
            written_at: now,
        });
        if history.len() > history_limit {
            let excess = history.len() - history_limit;
            history.drain(..excess);
        }

        // No receivers is fine: nobody is watching.
        let _ = self.watchers.send(entry);
        Revision(self.last_revision)
    }
}

impl State {
    fn bucket(&self, name: &str) -> Result<&Bucket, BrokerError> {
        self.buckets
            .get(name)
            .ok_or_else(|| BrokerError::NotFound(format!("bucket {name}")))
    }

    fn bucket_mut(&mut self, name: &str) -> Result<&mut Bucket, BrokerError> {
        self.buckets
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("bucket {name}")))
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut Stream, BrokerError> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| BrokerError::NotFound(format!("stream {name}")))
    }
}

#[async_trait]
impl KeyValueBroker for InMemoryBroker {
    async fn create_bucket(&self, config: &BucketConfig) -> Result<(), BrokerError> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        match state.buckets.get_mut(&config.name) {
            Some(bucket) => bucket.config = config.clone(),
            None => {
                tracing::debug!(bucket = %config.name, history = config.history, "bucket created");
                state
                    .buckets
                    .insert(config.name.clone(), Bucket::new(config.clone()));
            }
        }
        Ok(())
    }

    async fn bucket_exists(&self, bucket: &str) -> Result<bool, BrokerError> {
        self.check_available()?;
        Ok(self.inner.state.lock().buckets.contains_key(bucket))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BrokerError> {
        self.check_available()?;
        validate_key(key)?;
        let state = self.inner.state.lock();
        let bucket = state.bucket(bucket)?;
        Ok(bucket.live(key, Instant::now()).cloned())
    }

    async fn put(&self, bucket: &str, key: &str, value: Bytes) -> Result<Revision, BrokerError> {
        self.check_available()?;
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        let bucket = state.bucket_mut(bucket)?;
        Ok(bucket.write(key, value, KvOperation::Put, Instant::now()))
    }

    async fn create(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
    ) -> Result<Revision, BrokerError> {
        self.check_available()?;
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        let bucket = state.bucket_mut(bucket)?;
        let now = Instant::now();
        if bucket.live(key, now).is_some() {
            return Err(BrokerError::AlreadyExists {
                key: key.to_string(),
            });
        }
        Ok(bucket.write(key, value, KvOperation::Put, now))
    }

    async fn update(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        expected: Revision,
    ) -> Result<Revision, BrokerError> {
        self.check_available()?;
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        let bucket = state.bucket_mut(bucket)?;
        let now = Instant::now();
        let actual = bucket.latest(key, now).map(|entry| entry.revision);

        {
            let mut faults = self.inner.faults.lock();
            if faults.conflicting_updates > 0 {
                faults.conflicting_updates -= 1;
                return Err(BrokerError::RevisionConflict {
                    key: key.to_string(),
                    expected,
                    actual,
                });
            }
        }

        if actual != Some(expected) {
            return Err(BrokerError::RevisionConflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        Ok(bucket.write(key, value, KvOperation::Put, now))
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BrokerError> {
        self.check_available()?;
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        let bucket = state.bucket_mut(bucket)?;
        bucket.write(key, Bytes::new(), KvOperation::Delete, Instant::now());
        Ok(())
    }

    async fn purge(&self, bucket: &str, key: &str) -> Result<(), BrokerError> {
        self.check_available()?;
        validate_key(key)?;
        let mut state = self.inner.state.lock();
        let bucket = state.bucket_mut(bucket)?;
        bucket.write(key, Bytes::new(), KvOperation::Purge, Instant::now());
        Ok(())
    }

    async fn keys(&self, bucket: &str) -> Result<KeyStream, BrokerError> {
        self.check_available()?;
        let state = self.inner.state.lock();
        let bucket = state.bucket(bucket)?;
        let now = Instant::now();
        let mut keys: Vec<String> = bucket
            .keys
            .keys()
            .filter(|key| bucket.live(key, now).is_some())
            .cloned()
            .collect();
        keys.sort();
        Ok(stream::iter(keys.into_iter().map(Ok)).boxed())
    }

    async fn watch_all(&self, bucket: &str) -> Result<WatchStream, BrokerError> {
        self.check_available()?;
        let state = self.inner.state.lock();
        let bucket = state.bucket(bucket)?;
        let now = Instant::now();

        // Subscribe under the same lock as the snapshot: no gap, no overlap.
        let receiver = bucket.watchers.subscribe();
        let mut snapshot: Vec<KvEntry> = bucket
            .keys
            .keys()
            .filter_map(|key| bucket.latest(key, now).cloned())
            .collect();
        snapshot.sort_by_key(|entry| entry.revision);

        let live = stream::unfold(receiver, |mut receiver| async move {
            match receiver.recv().await {
                Ok(entry) => Some((Ok(entry), receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(BrokerError::Other(format!("watch lagged by {skipped} entries"))),
                    receiver,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        });

        Ok(stream::iter(snapshot.into_iter().map(Ok)).chain(live).boxed())
    }
}

impl Stream {
    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            messages: self.messages.len() as u64,
            last_sequence: self.last_sequence,
        }
    }

    fn expire_messages(&mut self, now: Instant) {
        if self.config.max_age.is_zero() {
            return;
        }
        let max_age = self.config.max_age;
        self.messages
            .retain(|_, message| now.duration_since(message.published_at) < max_age);
    }

    /// Pick up to `max` deliverable messages for a consumer and mark them
    /// pending. Also returns the earliest pending deadline, so an empty fetch
    /// knows when a redelivery could become possible.
    fn deliver(
        &mut self,
        consumer_name: &str,
        max: usize,
        now: Instant,
    ) -> Result<(Vec<(u64, u32)>, Option<Instant>), BrokerError> {
        self.expire_messages(now);
        let consumer = self
            .consumers
            .get_mut(consumer_name)
            .ok_or_else(|| BrokerError::NotFound(format!("consumer {consumer_name}")))?;

        let mut picked = Vec::new();
        for (&sequence, message) in &self.messages {
            if picked.len() >= max {
                break;
            }
            if consumer.done.contains(&sequence)
                || !subject_matches(&consumer.config.filter_subject, &message.subject)
            {
                continue;
            }
            if matches!(consumer.pending.get(&sequence), Some(deadline) if *deadline > now) {
                continue;
            }
            let delivered = consumer.delivery_counts.get(&sequence).copied().unwrap_or(0);
            if matches!(consumer.config.max_deliver, Some(limit) if delivered >= limit) {
                continue;
            }
            consumer.delivery_counts.insert(sequence, delivered + 1);
            picked.push((sequence, delivered + 1));
        }

        for (sequence, _) in &picked {
            match consumer.config.ack_policy {
                AckPolicy::Explicit => {
                    consumer
                        .pending
                        .insert(*sequence, now + consumer.config.ack_wait);
                }
                AckPolicy::None => {
                    consumer.pending.remove(sequence);
                    consumer.done.insert(*sequence);
                }
            }
        }

        let next_deadline = consumer
            .pending
            .values()
            .copied()
            .filter(|deadline| *deadline > now)
            .min();
        Ok((picked, next_deadline))
    }

    fn settle(&mut self, consumer_name: &str, sequence: u64, kind: AckKind, now: Instant) {
        let work_queue = self.config.retention == RetentionPolicy::WorkQueue;
        let Some(consumer) = self.consumers.get_mut(consumer_name) else {
            return;
        };
        match kind {
            AckKind::Progress => {
                if let Some(deadline) = consumer.pending.get_mut(&sequence) {
                    *deadline = now + consumer.config.ack_wait;
                }
            }
            AckKind::Ack | AckKind::Term => {
                consumer.pending.remove(&sequence);
                consumer.delivery_counts.remove(&sequence);
                if work_queue {
                    self.messages.remove(&sequence);
                } else {
                    consumer.done.insert(sequence);
                }
            }
        }
    }
}

#[async_trait]
impl StreamBroker for InMemoryBroker {
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<StreamInfo, BrokerError> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        let stream = state
            .streams
            .entry(config.name.clone())
            .or_insert_with(|| {
                tracing::debug!(stream = %config.name, subjects = ?config.subjects, "stream created");
                Stream {
                    config: config.clone(),
                    last_sequence: 0,
                    messages: BTreeMap::new(),
                    consumers: HashMap::new(),
                    notify: Arc::new(Notify::new()),
                }
            });
        if stream.config != *config {
            tracing::debug!(stream = %config.name, "stream config updated");
            stream.config = config.clone();
        }
        Ok(stream.info())
    }

    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError> {
        self.check_available()?;
        let mut state = self.inner.state.lock();
        let stream = state.stream_mut(name)?;
        stream.expire_messages(Instant::now());
        Ok(stream.info())
    }

    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<PublishAck, BrokerError> {
        self.check_available()?;
        {
            let mut faults = self.inner.faults.lock();
            match faults.publishes_before_failure {
                Some(0) => return Err(BrokerError::Unavailable("injected publish failure".into())),
                Some(ref mut remaining) => *remaining -= 1,
                None => {}
            }
        }

        let mut state = self.inner.state.lock();
        let stream = state
            .streams
            .values_mut()
            .find(|stream| {
                stream
                    .config
                    .subjects
                    .iter()
                    .any(|pattern| subject_matches(pattern, subject))
            })
            .ok_or_else(|| BrokerError::NotFound(format!("no stream captures {subject}")))?;

        stream.last_sequence += 1;
        let sequence = stream.last_sequence;
        stream.messages.insert(
            sequence,
            StoredMessage {
                subject: subject.to_string(),
                headers,
                payload,
                published_at: Instant::now(),
            },
        );
        stream.notify.notify_waiters();
        Ok(PublishAck {
            stream: stream.config.name.clone(),
            sequence,
        })
    }

    async fn pull_subscribe(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<Box<dyn PullSubscription>, BrokerError> {
        let delay = self.inner.faults.lock().subscribe_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.check_available()?;
        let mut state = self.inner.state.lock();
        let target = state.stream_mut(stream)?;
        match target.consumers.get_mut(&config.durable_name) {
            Some(consumer) => consumer.config = config.clone(),
            None => {
                tracing::debug!(stream, consumer = %config.durable_name, "durable consumer created");
                target.consumers.insert(
                    config.durable_name.clone(),
                    Consumer {
                        config: config.clone(),
                        pending: HashMap::new(),
                        delivery_counts: HashMap::new(),
                        done: HashSet::new(),
                    },
                );
            }
        }

        Ok(Box::new(MemorySubscription {
            broker: self.clone(),
            stream: stream.to_string(),
            consumer: config.durable_name.clone(),
            notify: target.notify.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug)]
struct MemorySubscription {
    broker: InMemoryBroker,
    stream: String,
    consumer: String,
    notify: Arc<Notify>,
    closed: AtomicBool,
}

impl MemorySubscription {
    fn try_deliver(
        &self,
        max: usize,
    ) -> Result<(Vec<RawMessage>, Option<Instant>), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        let stream = state.stream_mut(&self.stream)?;
        let now = Instant::now();
        let (picked, next_deadline) = stream.deliver(&self.consumer, max, now)?;

        let mut delivered = Vec::with_capacity(picked.len());
        for (sequence, attempt) in picked {
            if let Some(message) = stream.messages.get(&sequence) {
                delivered.push(self.raw_message(sequence, attempt, message));
            }
        }
        Ok((delivered, next_deadline))
    }

    fn raw_message(&self, sequence: u64, attempt: u32, message: &StoredMessage) -> RawMessage {
        RawMessage::new(
            message.subject.clone(),
            message.headers.clone(),
            message.payload.clone(),
            MessageInfo {
                stream: self.stream.clone(),
                consumer: self.consumer.clone(),
                stream_sequence: sequence,
                delivered: attempt,
            },
            Arc::new(MemoryAcker {
                broker: self.broker.clone(),
                stream: self.stream.clone(),
                consumer: self.consumer.clone(),
                sequence,
            }),
        )
    }
}

#[async_trait]
impl PullSubscription for MemorySubscription {
    async fn fetch(&self, max: usize, expires: Duration) -> Result<Vec<RawMessage>, BrokerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BrokerError::Other("subscription closed".into()));
        }
        self.broker.check_available()?;
        if max == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + expires;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking state so a publish in between is not lost.
            notified.as_mut().enable();

            let (messages, next_deadline) = self.try_deliver(max)?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake = next_deadline.map_or(deadline, |pending| pending.min(deadline));
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake) => {}
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(BrokerError::Other("subscription closed".into()));
            }
        }
    }

    async fn unsubscribe(&self) -> Result<(), BrokerError> {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[derive(Debug)]
struct MemoryAcker {
    broker: InMemoryBroker,
    stream: String,
    consumer: String,
    sequence: u64,
}

#[async_trait]
impl MessageAcker for MemoryAcker {
    async fn acknowledge(&self, kind: AckKind) -> Result<(), BrokerError> {
        self.broker.check_available()?;
        let mut state = self.broker.inner.state.lock();
        let stream = state.stream_mut(&self.stream)?;
        stream.settle(&self.consumer, self.sequence, kind, Instant::now());
        Ok(())
    }
}
