//! The KV + stream broker capability this crate consumes.
//!
//! Membership and streaming never talk to a network client directly. They
//! depend on two object-safe traits:
//!
//! - [`KeyValueBroker`]: buckets of keys with per-key revisions, bounded
//!   history, TTL, enumeration and a change feed
//! - [`StreamBroker`]: named streams bound to subject patterns, durable pull
//!   consumers, explicit ack / in-progress / term
//!
//! A deployment plugs in an adapter for its broker product; tests and
//! simulations use [`InMemoryBroker`](memory::InMemoryBroker), which implements
//! both with the same semantics.
//!
//! # Revisions
//!
//! Every write to a bucket gets a bucket-wide, strictly increasing
//! [`Revision`]. A conditional [`update`](KeyValueBroker::update) succeeds only
//! when the caller's expected revision is still the latest one for that key.
//!
//! ```text
//! writer A: get(k) -> rev 7          writer B: get(k) -> rev 7
//! writer A: update(k, v, 7) -> rev 9 writer B: update(k, v', 7) -> conflict
//! ```

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

pub use memory::InMemoryBroker;

/// Optimistic-concurrency token assigned by the broker to every KV write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Revision(pub u64);

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of change recorded for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KvOperation {
    /// A value was written.
    Put,
    /// The key was deleted; history is kept.
    Delete,
    /// The key and its history were removed.
    Purge,
}

/// One revision of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    /// Bucket the key lives in.
    pub bucket: String,
    /// The key.
    pub key: String,
    /// Value bytes; empty for delete and purge markers.
    pub value: Bytes,
    /// Revision of this write.
    pub revision: Revision,
    /// What the write did.
    pub operation: KvOperation,
}

/// Bucket provisioning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    /// Bucket name.
    pub name: String,
    /// Revisions kept per key (at least 1).
    pub history: u8,
    /// Entries older than this are treated as absent. `Duration::ZERO` keeps
    /// entries forever.
    pub max_age: Duration,
}

/// Lazy, finite sequence of keys.
pub type KeyStream = BoxStream<'static, Result<String, BrokerError>>;

/// Change feed: latest value of every key first, then live updates.
pub type WatchStream = BoxStream<'static, Result<KvEntry, BrokerError>>;

/// Key-value half of the broker.
#[async_trait]
pub trait KeyValueBroker: fmt::Debug + Send + Sync {
    /// Create the bucket, or succeed if it already exists.
    async fn create_bucket(&self, config: &BucketConfig) -> Result<(), BrokerError>;

    /// Whether the bucket exists.
    async fn bucket_exists(&self, bucket: &str) -> Result<bool, BrokerError>;

    /// Latest live value of a key, `None` if absent, deleted or expired.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, BrokerError>;

    /// Unconditional write.
    async fn put(&self, bucket: &str, key: &str, value: Bytes) -> Result<Revision, BrokerError>;

    /// Write only if the key has no live value.
    ///
    /// Fails with [`BrokerError::AlreadyExists`] otherwise.
    async fn create(&self, bucket: &str, key: &str, value: Bytes)
        -> Result<Revision, BrokerError>;

    /// Write only if `expected` is still the key's latest revision.
    ///
    /// Fails with [`BrokerError::RevisionConflict`] otherwise.
    async fn update(
        &self,
        bucket: &str,
        key: &str,
        value: Bytes,
        expected: Revision,
    ) -> Result<Revision, BrokerError>;

    /// Write a delete marker for the key.
    async fn delete(&self, bucket: &str, key: &str) -> Result<(), BrokerError>;

    /// Drop the key's history, leaving a purge marker.
    async fn purge(&self, bucket: &str, key: &str) -> Result<(), BrokerError>;

    /// Enumerate keys with a live value.
    async fn keys(&self, bucket: &str) -> Result<KeyStream, BrokerError>;

    /// Subscribe to changes, starting with the latest entry of every key.
    async fn watch_all(&self, bucket: &str) -> Result<WatchStream, BrokerError>;
}

/// Message retention of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionPolicy {
    /// Keep messages until limits (age) remove them.
    #[default]
    Limits,
    /// Remove a message once it has been acknowledged; each message goes to
    /// exactly one consumer.
    WorkQueue,
}

/// Stream provisioning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream name.
    pub name: String,
    /// Subject patterns captured by the stream (`*` = one token, `>` = rest).
    pub subjects: Vec<String>,
    /// Retention policy.
    pub retention: RetentionPolicy,
    /// Maximum message age; `Duration::ZERO` for unlimited.
    pub max_age: Duration,
}

/// Stream state as reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Current configuration.
    pub config: StreamConfig,
    /// Messages currently stored.
    pub messages: u64,
    /// Sequence of the last published message.
    pub last_sequence: u64,
}

/// Acknowledgement requirement of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// Every message must be acknowledged individually.
    #[default]
    Explicit,
    /// Messages count as acknowledged once delivered.
    None,
}

/// Durable pull consumer parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Durable name shared by every subscription bound to this consumer.
    pub durable_name: String,
    /// Only messages whose subject matches are delivered.
    pub filter_subject: String,
    /// Acknowledgement policy.
    pub ack_policy: AckPolicy,
    /// Unacknowledged messages are redelivered after this long.
    pub ack_wait: Duration,
    /// Stop redelivering after this many attempts.
    pub max_deliver: Option<u32>,
}

/// Broker confirmation of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    /// Stream that stored the message.
    pub stream: String,
    /// Sequence assigned to the message.
    pub sequence: u64,
}

/// String key/value message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(BTreeMap<String, String>);

impl Headers {
    /// Empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a header, replacing any previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Value of a header.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Number of headers.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Delivery metadata of a fetched message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    /// Stream the message came from.
    pub stream: String,
    /// Consumer that delivered it.
    pub consumer: String,
    /// Stream sequence, strictly increasing per stream.
    pub stream_sequence: u64,
    /// Delivery attempt, starting at 1.
    pub delivered: u32,
}

/// Terminal or extending response to a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    /// Processing finished; do not redeliver.
    Ack,
    /// Still working; restart the ack-wait timer.
    Progress,
    /// Never redeliver this message.
    Term,
}

/// Broker side of a delivered message's acknowledgement.
#[async_trait]
pub trait MessageAcker: fmt::Debug + Send + Sync {
    /// Send an acknowledgement of the given kind.
    async fn acknowledge(&self, kind: AckKind) -> Result<(), BrokerError>;
}

/// A message as delivered by a pull consumer.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Subject it was published on.
    pub subject: String,
    /// Headers set by the publisher.
    pub headers: Headers,
    /// Payload bytes.
    pub payload: Bytes,
    /// Delivery metadata.
    pub info: MessageInfo,
    acker: Arc<dyn MessageAcker>,
}

impl RawMessage {
    /// Assemble a delivered message. Broker adapters call this.
    pub fn new(
        subject: String,
        headers: Headers,
        payload: Bytes,
        info: MessageInfo,
        acker: Arc<dyn MessageAcker>,
    ) -> Self {
        Self {
            subject,
            headers,
            payload,
            info,
            acker,
        }
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) -> Result<(), BrokerError> {
        self.acker.acknowledge(AckKind::Ack).await
    }

    /// Extend the redelivery deadline.
    pub async fn in_progress(&self) -> Result<(), BrokerError> {
        self.acker.acknowledge(AckKind::Progress).await
    }

    /// Reject permanently.
    pub async fn term(&self) -> Result<(), BrokerError> {
        self.acker.acknowledge(AckKind::Term).await
    }
}

/// A bound pull subscription on a durable consumer.
#[async_trait]
pub trait PullSubscription: fmt::Debug + Send + Sync {
    /// Pull up to `max` messages, waiting at most `expires` for the first one.
    ///
    /// Returns an empty batch when nothing arrived in time.
    async fn fetch(&self, max: usize, expires: Duration) -> Result<Vec<RawMessage>, BrokerError>;

    /// Release the subscription. The durable consumer and its unacknowledged
    /// messages stay on the broker.
    async fn unsubscribe(&self) -> Result<(), BrokerError>;
}

/// Stream half of the broker.
#[async_trait]
pub trait StreamBroker: fmt::Debug + Send + Sync {
    /// Create the stream, or update it when the stored config differs.
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<StreamInfo, BrokerError>;

    /// Current state of a stream.
    async fn stream_info(&self, name: &str) -> Result<StreamInfo, BrokerError>;

    /// Publish to the stream capturing `subject`.
    async fn publish(
        &self,
        subject: &str,
        headers: Headers,
        payload: Bytes,
    ) -> Result<PublishAck, BrokerError>;

    /// Create or bind the durable consumer and open a pull subscription.
    async fn pull_subscribe(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<Box<dyn PullSubscription>, BrokerError>;
}

/// Whether `subject` matches `pattern` (`*` = one token, `>` = one or more
/// trailing tokens).
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}
