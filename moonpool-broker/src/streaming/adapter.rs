//! Producer side: publishing event batches onto the broker stream.
//!
//! Every `(stream_id, namespace)` channel of a provider maps to one subject
//! under the provider's stream. The stream uses work-queue retention, so each
//! message is handed to exactly one receiver of the shared durable consumer.
//!
//! ```text
//!  queue_message_batch(S, N, [A, B, C])
//!     │
//!     ├─ ensure stream (once)      streaming-{cluster}-{service}-{provider}
//!     │                            subjects: {cluster}-{service}-{provider}.*.*
//!     │
//!     ├─ publish A ─► {prefix}.S.N   headers: payloadType, streamId, streamNamespace
//!     ├─ publish B ─► {prefix}.S.N
//!     └─ publish C ─► {prefix}.S.N
//! ```
//!
//! Publishes are sequential, which preserves order within a call. A failed
//! publish aborts the rest of the batch; the events already published stay
//! published.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;

use super::queue::{QueueId, QueueMapper};
use super::receiver::{BrokerQueueReceiver, QueueAdapterReceiver};
use super::types::{
    SequenceToken, PAYLOAD_TYPE_HEADER, STREAM_ID_HEADER, STREAM_NAMESPACE_HEADER,
};
use crate::broker::{Headers, RetentionPolicy, StreamBroker, StreamConfig};
use crate::codec::{JsonCodec, TypeRegistry, TypedPayload};
use crate::config::{BrokerOptions, StreamingOptions};
use crate::error::{CodecError, StreamingError};
use crate::naming::StreamNaming;

/// Which way a queue adapter moves events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueDirection {
    /// Only receives.
    ReadOnly,
    /// Only publishes.
    WriteOnly,
    /// Publishes and receives.
    ReadWrite,
}

/// An encoded event ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingEvent {
    /// Type tag, sent as the `payloadType` header.
    pub payload_type: String,
    /// JSON body.
    pub body: Bytes,
}

impl OutgoingEvent {
    /// Encode a typed event.
    pub fn encode<T: TypedPayload>(event: &T) -> Result<Self, CodecError> {
        Ok(Self {
            payload_type: T::TYPE_TAG.to_string(),
            body: Bytes::from(JsonCodec.encode(event)?),
        })
    }
}

/// Queue adapter contract invoked by the hosting runtime.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Provider name.
    fn name(&self) -> &str;

    /// Whether receivers can rewind to an earlier token.
    fn is_rewindable(&self) -> bool;

    /// Supported direction.
    fn direction(&self) -> QueueDirection;

    /// Publish events for one channel, in order.
    ///
    /// `token` is accepted for interface compatibility; the broker assigns
    /// sequence numbers.
    async fn queue_message_batch(
        &self,
        stream_id: &str,
        namespace: &str,
        events: Vec<OutgoingEvent>,
        token: Option<SequenceToken>,
    ) -> Result<(), StreamingError>;

    /// Receiver for one logical queue.
    fn create_receiver(&self, queue: QueueId) -> Result<Box<dyn QueueAdapterReceiver>, StreamingError>;
}

/// Lazily provisions the provider's stream; shared by the adapter and its
/// receivers so the stream is ensured once per process.
#[derive(Debug)]
pub(crate) struct StreamProvisioner {
    broker: Arc<dyn StreamBroker>,
    config: StreamConfig,
    ready: OnceCell<()>,
}

impl StreamProvisioner {
    fn new(broker: Arc<dyn StreamBroker>, naming: &StreamNaming) -> Self {
        Self {
            broker,
            config: StreamConfig {
                name: naming.stream_name(),
                subjects: vec![naming.subject_pattern()],
                retention: RetentionPolicy::WorkQueue,
                max_age: Duration::ZERO,
            },
            ready: OnceCell::new(),
        }
    }

    pub(crate) async fn ensure(&self) -> Result<(), StreamingError> {
        self.ready
            .get_or_try_init(|| async {
                let info = self.broker.ensure_stream(&self.config).await?;
                tracing::info!(
                    stream = %info.config.name,
                    subjects = ?info.config.subjects,
                    messages = info.messages,
                    "stream ready"
                );
                Ok::<(), StreamingError>(())
            })
            .await?;
        Ok(())
    }
}

/// [`QueueAdapter`] publishing to a [`StreamBroker`].
#[derive(Debug, Clone)]
pub struct BrokerQueueAdapter {
    broker: Arc<dyn StreamBroker>,
    naming: StreamNaming,
    options: StreamingOptions,
    registry: TypeRegistry,
    mapper: QueueMapper,
    provisioner: Arc<StreamProvisioner>,
}

impl BrokerQueueAdapter {
    /// Create an adapter. Receivers it creates decode payloads through
    /// `registry`.
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        broker_options: &BrokerOptions,
        options: StreamingOptions,
        registry: TypeRegistry,
    ) -> Result<Self, StreamingError> {
        options.validate()?;
        let naming = broker_options.naming()?.streaming(&options.provider_name)?;
        let mapper = QueueMapper::new(options.partition_count)?;
        let provisioner = Arc::new(StreamProvisioner::new(broker.clone(), &naming));
        Ok(Self {
            broker,
            naming,
            options,
            registry,
            mapper,
            provisioner,
        })
    }

    /// Broker names used by this provider.
    pub fn naming(&self) -> &StreamNaming {
        &self.naming
    }

    /// Stream id to queue mapping.
    pub fn mapper(&self) -> &QueueMapper {
        &self.mapper
    }

    /// Encode and publish typed events for one channel.
    pub async fn queue_events<T: TypedPayload>(
        &self,
        stream_id: &str,
        namespace: &str,
        events: &[T],
    ) -> Result<(), StreamingError> {
        let encoded = events
            .iter()
            .map(OutgoingEvent::encode)
            .collect::<Result<Vec<_>, _>>()?;
        self.queue_message_batch(stream_id, namespace, encoded, None)
            .await
    }

    /// Concrete receiver for one logical queue.
    pub fn receiver(&self, queue: QueueId) -> Result<BrokerQueueReceiver, StreamingError> {
        let queue = self.mapper.check(queue)?;
        Ok(BrokerQueueReceiver::new(
            queue,
            self.broker.clone(),
            self.provisioner.clone(),
            &self.naming,
            &self.options,
            self.registry.clone(),
        ))
    }
}

#[async_trait]
impl QueueAdapter for BrokerQueueAdapter {
    fn name(&self) -> &str {
        &self.options.provider_name
    }

    fn is_rewindable(&self) -> bool {
        false
    }

    fn direction(&self) -> QueueDirection {
        QueueDirection::ReadWrite
    }

    async fn queue_message_batch(
        &self,
        stream_id: &str,
        namespace: &str,
        events: Vec<OutgoingEvent>,
        _token: Option<SequenceToken>,
    ) -> Result<(), StreamingError> {
        let subject = self.naming.subject(stream_id, namespace);
        self.provisioner.ensure().await?;

        let total = events.len();
        for (index, event) in events.into_iter().enumerate() {
            let headers: Headers = [
                (PAYLOAD_TYPE_HEADER, event.payload_type.as_str()),
                (STREAM_ID_HEADER, stream_id),
                (STREAM_NAMESPACE_HEADER, namespace),
            ]
            .into_iter()
            .collect();

            if let Err(e) = self.broker.publish(&subject, headers, event.body).await {
                tracing::warn!(
                    subject = %subject,
                    published = index,
                    total,
                    error = %e,
                    "batch publish aborted"
                );
                return Err(e.into());
            }
        }
        tracing::debug!(subject = %subject, events = total, "batch published");
        Ok(())
    }

    fn create_receiver(&self, queue: QueueId) -> Result<Box<dyn QueueAdapterReceiver>, StreamingError> {
        Ok(Box::new(self.receiver(queue)?))
    }
}
