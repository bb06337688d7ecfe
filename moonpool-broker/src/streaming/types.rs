//! Batches handed to the runtime by the receiver.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::DecodedPayload;

/// Header carrying the event's type tag.
pub const PAYLOAD_TYPE_HEADER: &str = "payloadType";
/// Header carrying the logical stream id.
pub const STREAM_ID_HEADER: &str = "streamId";
/// Header carrying the stream namespace.
pub const STREAM_NAMESPACE_HEADER: &str = "streamNamespace";

/// One logical ordered channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchKey {
    /// Stream id.
    pub stream_id: String,
    /// Stream namespace; may be empty.
    pub namespace: String,
}

impl BatchKey {
    /// Create a key.
    pub fn new(stream_id: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.stream_id)
    }
}

/// Position of an event: broker sequence, then index within the batch.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct SequenceToken {
    /// Broker-assigned stream sequence.
    pub sequence_number: u64,
    /// Index of the event inside its batch.
    pub event_index: u32,
}

impl SequenceToken {
    /// Create a token.
    pub fn new(sequence_number: u64, event_index: u32) -> Self {
        Self {
            sequence_number,
            event_index,
        }
    }
}

impl fmt::Display for SequenceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sequence_number, self.event_index)
    }
}

/// One decoded event inside a batch.
#[derive(Clone)]
pub struct BatchEntry {
    /// Receiver-local id, key of the in-flight map.
    pub internal_id: Uuid,
    /// Type tag the payload was decoded with.
    pub payload_type: String,
    /// The decoded event.
    pub payload: DecodedPayload,
    /// Broker-assigned stream sequence.
    pub sequence_number: u64,
}

impl BatchEntry {
    /// The payload as `T`, if that is its type.
    pub fn downcast<T: 'static>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for BatchEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchEntry")
            .field("internal_id", &self.internal_id)
            .field("payload_type", &self.payload_type)
            .field("sequence_number", &self.sequence_number)
            .finish_non_exhaustive()
    }
}

/// Events of one channel from one fetch, in broker order.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Channel.
    pub key: BatchKey,
    /// Token of the newest event in the batch.
    pub token: SequenceToken,
    /// Events, oldest first.
    pub entries: Vec<BatchEntry>,
}

impl Batch {
    /// Number of events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the batch holds no events.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Events of type `T`, skipping the others.
    pub fn events<T: 'static>(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(BatchEntry::downcast::<T>)
    }

    /// Sequence numbers, oldest first.
    pub fn sequence_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|entry| entry.sequence_number)
    }
}
