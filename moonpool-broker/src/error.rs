//! Error types for broker-backed membership and streaming.
//!
//! Errors are split by concern the same way the components are split:
//!
//! - [`BrokerError`]: anything the remote KV/stream broker reports
//! - [`CodecError`]: payload encoding and type-tag resolution
//! - [`StoreError`]: typed bucket access (broker or codec failure)
//! - [`MembershipError`]: membership directory and keep-alive
//! - [`StreamingError`]: queue adapter and receiver
//! - [`ConfigError`]: invalid names or options
//!
//! Transient broker failures and optimistic-concurrency conflicts are both
//! [`BrokerError`] variants; callers tell them apart with
//! [`BrokerError::is_transient`] and [`BrokerError::is_conflict`].

use std::time::Duration;

use thiserror::Error;

use crate::broker::Revision;

/// Errors reported by the KV/stream broker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker could not be reached (connection drop, not connected).
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// A broker call did not complete in time.
    #[error("broker operation timed out")]
    Timeout,

    /// The bucket, stream or consumer does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A create-only write hit an existing key.
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// The key that was already present.
        key: String,
    },

    /// Optimistic-concurrency check failed: a concurrent writer won.
    #[error("revision conflict on {key}: expected {expected}, found {actual:?}")]
    RevisionConflict {
        /// The key being written.
        key: String,
        /// The revision the caller last observed.
        expected: Revision,
        /// The revision currently stored, `None` if the key is absent.
        actual: Option<Revision>,
    },

    /// A key or subject contains characters the broker does not accept.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),

    /// Any other broker-side failure.
    #[error("broker error: {0}")]
    Other(String),
}

impl BrokerError {
    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_) | BrokerError::Timeout)
    }

    /// Whether this is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            BrokerError::RevisionConflict { .. } | BrokerError::AlreadyExists { .. }
        )
    }
}

/// Errors from encoding or decoding payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Failed to encode a value to bytes.
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Failed to decode bytes to a value.
    #[error("decode error: {0}")]
    Decode(#[source] serde_json::Error),

    /// The type tag does not resolve to a known type.
    #[error("unknown payload type: {0:?}")]
    UnknownType(String),
}

/// Errors from typed bucket access.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The broker rejected or failed the operation.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// A value could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl StoreError {
    /// Whether this is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Broker(e) if e.is_conflict())
    }
}

/// Errors from the membership directory.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// The broker rejected or failed the operation.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// A stored entry could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A bucket key does not decode to a member address.
    #[error("invalid member key: {0:?}")]
    InvalidKey(String),

    /// The directory was used before `initialize()`.
    #[error("membership directory not initialized")]
    NotInitialized,

    /// The entry for an address is not in the directory.
    #[error("no membership entry for {0}")]
    EntryNotFound(String),

    /// `start_keep_alive` was called while a loop is running.
    #[error("keep-alive loop already running")]
    KeepAliveAlreadyRunning,

    /// The keep-alive task did not stop within the allotted time.
    #[error("keep-alive task did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// Options were invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<StoreError> for MembershipError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Broker(e) => MembershipError::Broker(e),
            StoreError::Codec(e) => MembershipError::Codec(e),
        }
    }
}

impl MembershipError {
    /// Whether this is a lost optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MembershipError::Broker(e) if e.is_conflict())
    }
}

/// Errors from the streaming queue adapter and receiver.
#[derive(Debug, Error)]
pub enum StreamingError {
    /// The broker rejected or failed the operation.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// An event could not be encoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The receiver was used before `initialize()`.
    #[error("receiver not initialized")]
    NotInitialized,

    /// The receiver has been shut down.
    #[error("receiver already shut down")]
    AlreadyShutDown,

    /// The queue id is outside the configured partition range.
    #[error("queue {queue} out of range (partition count {partition_count})")]
    InvalidQueue {
        /// Requested queue.
        queue: u32,
        /// Configured partition count.
        partition_count: u32,
    },

    /// `initialize` did not complete within its timeout.
    #[error("receiver initialization timed out after {0:?}")]
    InitializationTimeout(Duration),

    /// Options were invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors from validating names and options.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A required option was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// A name contains characters that cannot appear in bucket/stream names.
    #[error("{field} contains an illegal character: {value:?}")]
    IllegalName {
        /// Option name.
        field: &'static str,
        /// Offending value.
        value: String,
    },

    /// A numeric or duration option is out of range.
    #[error("{field} is out of range: {reason}")]
    OutOfRange {
        /// Option name.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// A property could not be parsed.
    #[error("invalid value for {key}: {reason}")]
    Parse {
        /// Property key.
        key: String,
        /// Parser message.
        reason: String,
    },
}
