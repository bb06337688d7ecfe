//! Durable event streaming over a broker work queue.
//!
//! - [`BrokerQueueAdapter`]: publishes ordered event batches per
//!   `(stream_id, namespace)` channel
//! - [`BrokerQueueReceiver`]: pulls, batches and acknowledges them
//! - [`QueueMapper`]: stable hash of stream ids onto logical queues

pub mod adapter;
pub mod queue;
pub mod receiver;
pub mod types;

pub use adapter::{BrokerQueueAdapter, OutgoingEvent, QueueAdapter, QueueDirection};
pub use queue::{QueueId, QueueMapper};
pub use receiver::{BrokerQueueReceiver, QueueAdapterReceiver};
pub use types::{
    Batch, BatchEntry, BatchKey, SequenceToken, PAYLOAD_TYPE_HEADER, STREAM_ID_HEADER,
    STREAM_NAMESPACE_HEADER,
};
