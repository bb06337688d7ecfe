//! Mapping stream ids onto a fixed set of logical queues.
//!
//! `queue_for(id) = crc32(id) % partition_count`, with the CRC-32 (ISO-HDLC)
//! checksum computed by `crc32fast`. The mapping depends on nothing but the id
//! bytes and the partition count, so it is stable across restarts and
//! processes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, StreamingError};

/// A logical queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue-{}", self.0)
    }
}

/// Hashes stream ids onto `partition_count` queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMapper {
    partition_count: u32,
}

impl QueueMapper {
    /// Create a mapper over `partition_count` queues (at least one).
    pub fn new(partition_count: u32) -> Result<Self, ConfigError> {
        if partition_count == 0 {
            return Err(ConfigError::OutOfRange {
                field: "partition_count",
                reason: "must be at least 1".into(),
            });
        }
        Ok(Self { partition_count })
    }

    /// Number of queues.
    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Queue responsible for a stream id.
    pub fn queue_for(&self, stream_id: &str) -> QueueId {
        QueueId(crc32fast::hash(stream_id.as_bytes()) % self.partition_count)
    }

    /// Every queue, in order.
    pub fn all_queues(&self) -> impl Iterator<Item = QueueId> {
        (0..self.partition_count).map(QueueId)
    }

    /// Reject queue ids outside the range.
    pub fn check(&self, queue: QueueId) -> Result<QueueId, StreamingError> {
        if queue.0 < self.partition_count {
            Ok(queue)
        } else {
            Err(StreamingError::InvalidQueue {
                queue: queue.0,
                partition_count: self.partition_count,
            })
        }
    }
}
