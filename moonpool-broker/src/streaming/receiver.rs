//! Consumer side: pulling, batching and acknowledging events.
//!
//! Lifecycle:
//!
//! ```text
//!  Uninitialized ──initialize()──► Initialized ──shutdown()──► ShutDown
//!        │                                                        ▲
//!        └──────────────────────── shutdown() ────────────────────┘
//! ```
//!
//! Each fetch cycle:
//!
//! 1. pull up to `max_count` messages from the shared durable consumer
//! 2. terminate messages that cannot be attributed or decoded
//! 3. mark the rest in-progress with the broker and remember them in the
//!    in-flight map under a fresh id
//! 4. group them by `(stream_id, namespace)` in fetch order
//! 5. raise each batch token to the highest sequence already handed out for
//!    that channel, so tokens never move backwards across redeliveries
//!
//! [`messages_delivered`](QueueAdapterReceiver::messages_delivered) acks and
//! forgets them. Anything never acknowledged is redelivered by the broker
//! after `ack_wait`: delivery is at-least-once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use super::adapter::StreamProvisioner;
use super::queue::QueueId;
use super::types::{
    Batch, BatchEntry, BatchKey, SequenceToken, PAYLOAD_TYPE_HEADER, STREAM_ID_HEADER,
    STREAM_NAMESPACE_HEADER,
};
use crate::broker::{AckPolicy, ConsumerConfig, PullSubscription, RawMessage, StreamBroker};
use crate::codec::{DecodedPayload, TypeRegistry};
use crate::config::StreamingOptions;
use crate::error::{CodecError, StreamingError};
use crate::naming::StreamNaming;

/// Receiver contract invoked by the hosting runtime.
#[async_trait]
pub trait QueueAdapterReceiver: Send + Sync {
    /// Bind to the broker, failing with
    /// [`StreamingError::InitializationTimeout`] after `timeout`.
    async fn initialize(&self, timeout: Duration) -> Result<(), StreamingError>;

    /// Fetch up to `max_count` events, grouped into per-channel batches.
    async fn get_queue_messages(&self, max_count: usize) -> Result<Vec<Batch>, StreamingError>;

    /// Acknowledge every entry of `batches`. Unknown entries are ignored.
    async fn messages_delivered(&self, batches: &[Batch]) -> Result<(), StreamingError>;

    /// Release the subscription. In-flight messages are left for redelivery.
    async fn shutdown(&self, timeout: Duration) -> Result<(), StreamingError>;
}

#[derive(Debug)]
enum ReceiverState {
    Uninitialized,
    Initialized(Arc<dyn PullSubscription>),
    ShutDown,
}

/// Why a fetched message was terminated.
#[derive(Debug)]
enum Rejection {
    MissingHeader(&'static str),
    Codec(CodecError),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::MissingHeader(header) => write!(f, "missing header {header}"),
            Rejection::Codec(e) => write!(f, "{e}"),
        }
    }
}

/// [`QueueAdapterReceiver`] pulling from a durable broker consumer.
///
/// All receivers of a provider share one durable consumer; the broker hands
/// each message to exactly one of them.
#[derive(Debug)]
pub struct BrokerQueueReceiver {
    queue: QueueId,
    broker: Arc<dyn StreamBroker>,
    provisioner: Arc<StreamProvisioner>,
    stream_name: String,
    consumer: ConsumerConfig,
    fetch_wait: Duration,
    registry: TypeRegistry,
    state: Mutex<ReceiverState>,
    init_lock: tokio::sync::Mutex<()>,
    in_flight: DashMap<Uuid, RawMessage>,
    high_water: DashMap<BatchKey, u64>,
}

struct Accepted {
    key: BatchKey,
    payload_type: String,
    payload: DecodedPayload,
}

impl BrokerQueueReceiver {
    pub(crate) fn new(
        queue: QueueId,
        broker: Arc<dyn StreamBroker>,
        provisioner: Arc<StreamProvisioner>,
        naming: &StreamNaming,
        options: &StreamingOptions,
        registry: TypeRegistry,
    ) -> Self {
        Self {
            queue,
            broker,
            provisioner,
            stream_name: naming.stream_name(),
            consumer: ConsumerConfig {
                durable_name: naming.consumer_name(),
                filter_subject: naming.subject_pattern(),
                ack_policy: AckPolicy::Explicit,
                ack_wait: options.ack_wait,
                max_deliver: options.max_deliver,
            },
            fetch_wait: options.fetch_wait,
            registry,
            state: Mutex::new(ReceiverState::Uninitialized),
            init_lock: tokio::sync::Mutex::new(()),
            in_flight: DashMap::new(),
            high_water: DashMap::new(),
        }
    }

    /// Logical queue this receiver serves.
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    /// Messages fetched but not yet acknowledged.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    fn subscription(&self) -> Result<Arc<dyn PullSubscription>, StreamingError> {
        match &*self.state.lock() {
            ReceiverState::Uninitialized => Err(StreamingError::NotInitialized),
            ReceiverState::Initialized(subscription) => Ok(subscription.clone()),
            ReceiverState::ShutDown => Err(StreamingError::AlreadyShutDown),
        }
    }

    fn accept(&self, message: &RawMessage) -> Result<Accepted, Rejection> {
        let header = |name: &'static str| {
            message
                .headers
                .get(name)
                .ok_or(Rejection::MissingHeader(name))
        };
        let payload_type = header(PAYLOAD_TYPE_HEADER)?;
        let stream_id = header(STREAM_ID_HEADER)?;
        let namespace = header(STREAM_NAMESPACE_HEADER)?;
        let payload = self
            .registry
            .decode(payload_type, &message.payload)
            .map_err(Rejection::Codec)?;
        Ok(Accepted {
            key: BatchKey::new(stream_id, namespace),
            payload_type: payload_type.to_string(),
            payload,
        })
    }

    /// Remember a message under an id no other in-flight message uses.
    ///
    /// A redelivered message replaces the entry of its earlier delivery.
    fn track(&self, message: RawMessage) -> Uuid {
        let sequence = message.info.stream_sequence;
        self.in_flight.retain(|_, held| held.info.stream_sequence != sequence);
        loop {
            let id = Uuid::new_v4();
            if let Entry::Vacant(vacant) = self.in_flight.entry(id) {
                vacant.insert(message);
                return id;
            }
        }
    }

    /// Lift `batch.token` to the channel's high-water mark, or advance the mark.
    fn settle_token(&self, batch: &mut Batch) {
        let mut mark = self.high_water.entry(batch.key.clone()).or_insert(0);
        if batch.token.sequence_number < *mark {
            batch.token.sequence_number = *mark;
        } else {
            *mark = batch.token.sequence_number;
        }
    }
}

#[async_trait]
impl QueueAdapterReceiver for BrokerQueueReceiver {
    async fn initialize(&self, timeout: Duration) -> Result<(), StreamingError> {
        let _guard = self.init_lock.lock().await;
        match &*self.state.lock() {
            ReceiverState::Initialized(_) => return Ok(()),
            ReceiverState::ShutDown => return Err(StreamingError::AlreadyShutDown),
            ReceiverState::Uninitialized => {}
        }

        let subscribe = async {
            self.provisioner.ensure().await?;
            let subscription = self
                .broker
                .pull_subscribe(&self.stream_name, &self.consumer)
                .await?;
            Ok::<_, StreamingError>(subscription)
        };
        let subscription: Arc<dyn PullSubscription> = Arc::from(
            tokio::time::timeout(timeout, subscribe)
                .await
                .map_err(|_| StreamingError::InitializationTimeout(timeout))??,
        );

        // shutdown() does not take init_lock and may have run meanwhile.
        let installed = {
            let mut state = self.state.lock();
            let vacant = matches!(*state, ReceiverState::Uninitialized);
            if vacant {
                *state = ReceiverState::Initialized(subscription.clone());
            }
            vacant
        };
        if !installed {
            match tokio::time::timeout(timeout, subscription.unsubscribe()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(queue = %self.queue, error = %e, "unsubscribe failed"),
                Err(_) => tracing::warn!(queue = %self.queue, ?timeout, "unsubscribe timed out"),
            }
            tracing::info!(queue = %self.queue, "receiver shut down during initialize");
            return Err(StreamingError::AlreadyShutDown);
        }
        tracing::info!(
            queue = %self.queue,
            stream = %self.stream_name,
            consumer = %self.consumer.durable_name,
            "receiver initialized"
        );
        Ok(())
    }

    async fn get_queue_messages(&self, max_count: usize) -> Result<Vec<Batch>, StreamingError> {
        let subscription = self.subscription()?;
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let messages = subscription.fetch(max_count, self.fetch_wait).await?;

        let mut batches: Vec<Batch> = Vec::new();
        let mut index: HashMap<BatchKey, usize> = HashMap::new();
        for message in messages {
            let accepted = match self.accept(&message) {
                Ok(accepted) => accepted,
                Err(reason) => {
                    tracing::warn!(
                        queue = %self.queue,
                        subject = %message.subject,
                        sequence = message.info.stream_sequence,
                        reason = %reason,
                        "terminating malformed message"
                    );
                    if let Err(e) = message.term().await {
                        tracing::warn!(sequence = message.info.stream_sequence, error = %e, "term failed");
                    }
                    continue;
                }
            };

            let sequence_number = message.info.stream_sequence;
            if let Err(e) = message.in_progress().await {
                tracing::warn!(sequence = sequence_number, error = %e, "in-progress signal failed");
            }
            let internal_id = self.track(message);

            let slot = *index.entry(accepted.key.clone()).or_insert_with(|| {
                batches.push(Batch {
                    key: accepted.key.clone(),
                    token: SequenceToken::default(),
                    entries: Vec::new(),
                });
                batches.len() - 1
            });
            let batch = &mut batches[slot];
            batch.entries.push(BatchEntry {
                internal_id,
                payload_type: accepted.payload_type,
                payload: accepted.payload,
                sequence_number,
            });
            if sequence_number >= batch.token.sequence_number {
                let event_index = u32::try_from(batch.entries.len() - 1).unwrap_or(u32::MAX);
                batch.token = SequenceToken::new(sequence_number, event_index);
            }
        }

        for batch in &mut batches {
            self.settle_token(batch);
        }

        if !batches.is_empty() {
            tracing::debug!(
                queue = %self.queue,
                batches = batches.len(),
                in_flight = self.in_flight.len(),
                "messages fetched"
            );
        }
        Ok(batches)
    }

    async fn messages_delivered(&self, batches: &[Batch]) -> Result<(), StreamingError> {
        let mut first_error = None;
        for entry in batches.iter().flat_map(|batch| &batch.entries) {
            let Some((_, message)) = self.in_flight.remove(&entry.internal_id) else {
                continue;
            };
            if let Err(e) = message.ack().await {
                tracing::warn!(
                    queue = %self.queue,
                    sequence = entry.sequence_number,
                    error = %e,
                    "ack failed, message will be redelivered"
                );
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), StreamingError> {
        let previous = std::mem::replace(&mut *self.state.lock(), ReceiverState::ShutDown);
        let ReceiverState::Initialized(subscription) = previous else {
            return Ok(());
        };

        match tokio::time::timeout(timeout, subscription.unsubscribe()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(queue = %self.queue, error = %e, "unsubscribe failed"),
            Err(_) => tracing::warn!(queue = %self.queue, ?timeout, "unsubscribe timed out"),
        }
        let abandoned = self.in_flight.len();
        self.in_flight.clear();
        tracing::info!(queue = %self.queue, abandoned, "receiver shut down");
        Ok(())
    }
}
