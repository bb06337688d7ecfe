//! Typed, revision-aware access to one KV bucket.
//!
//! [`KvStore`] sits between the membership directory and the raw
//! [`KeyValueBroker`]. It provisions the bucket lazily on first use and wraps
//! every value in the codec's type-tagged envelope, so stored entries can be
//! read back by any process without an external schema.
//!
//! Every write returns the broker-assigned [`Revision`]; the caller keeps it
//! as the optimistic-concurrency token for the next conditional update.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;

use crate::broker::{BucketConfig, KeyStream, KeyValueBroker, Revision, WatchStream};
use crate::codec::{JsonCodec, TypedPayload};
use crate::error::{CodecError, StoreError};

/// A decoded value next to the revision it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The stored value.
    pub value: T,
    /// Broker revision of the write that produced `value`.
    pub revision: Revision,
}

/// Typed access to one bucket.
pub struct KvStore {
    broker: Arc<dyn KeyValueBroker>,
    config: BucketConfig,
    codec: JsonCodec,
    provisioned: OnceCell<()>,
}

impl fmt::Debug for KvStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvStore")
            .field("bucket", &self.config.name)
            .field("provisioned", &self.provisioned.initialized())
            .finish()
    }
}

impl KvStore {
    /// Bind to a bucket. Nothing is sent to the broker until first use.
    pub fn new(broker: Arc<dyn KeyValueBroker>, config: BucketConfig) -> Self {
        Self {
            broker,
            config,
            codec: JsonCodec,
            provisioned: OnceCell::new(),
        }
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.config.name
    }

    /// Create the bucket if it does not exist yet.
    ///
    /// Only the first successful call talks to the broker; a failed attempt
    /// is retried by the next caller.
    pub async fn ensure_bucket_exists(&self) -> Result<(), StoreError> {
        self.provisioned
            .get_or_try_init(|| async {
                if self.broker.bucket_exists(&self.config.name).await? {
                    tracing::debug!(bucket = %self.config.name, "bucket already provisioned");
                } else {
                    self.broker.create_bucket(&self.config).await?;
                    tracing::info!(
                        bucket = %self.config.name,
                        history = self.config.history,
                        ttl = ?self.config.max_age,
                        "bucket provisioned"
                    );
                }
                Ok::<(), StoreError>(())
            })
            .await?;
        Ok(())
    }

    /// Read and decode a key.
    pub async fn get<T: TypedPayload>(&self, key: &str) -> Result<Option<Versioned<T>>, StoreError> {
        self.ensure_bucket_exists().await?;
        let Some(entry) = self.broker.get(&self.config.name, key).await? else {
            return Ok(None);
        };
        let value = self.decode(&entry.value)?;
        Ok(Some(Versioned {
            value,
            revision: entry.revision,
        }))
    }

    /// Unconditional write.
    pub async fn put<T: TypedPayload>(&self, key: &str, value: &T) -> Result<Revision, StoreError> {
        self.ensure_bucket_exists().await?;
        let bytes = self.encode(value)?;
        Ok(self.broker.put(&self.config.name, key, bytes).await?)
    }

    /// Write only if the key is absent.
    pub async fn create<T: TypedPayload>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<Revision, StoreError> {
        self.ensure_bucket_exists().await?;
        let bytes = self.encode(value)?;
        Ok(self.broker.create(&self.config.name, key, bytes).await?)
    }

    /// Write only if the stored revision is still `expected`.
    pub async fn update_if_revision<T: TypedPayload>(
        &self,
        key: &str,
        value: &T,
        expected: Revision,
    ) -> Result<Revision, StoreError> {
        self.ensure_bucket_exists().await?;
        let bytes = self.encode(value)?;
        Ok(self
            .broker
            .update(&self.config.name, key, bytes, expected)
            .await?)
    }

    /// Delete a key.
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_bucket_exists().await?;
        Ok(self.broker.delete(&self.config.name, key).await?)
    }

    /// Lazily enumerate live keys.
    pub async fn list_keys(&self) -> Result<KeyStream, StoreError> {
        self.ensure_bucket_exists().await?;
        Ok(self.broker.keys(&self.config.name).await?)
    }

    /// Follow every change to the bucket, starting with its current contents.
    pub async fn watch(&self) -> Result<WatchStream, StoreError> {
        self.ensure_bucket_exists().await?;
        Ok(self.broker.watch_all(&self.config.name).await?)
    }

    /// Decode a raw value read from this bucket, e.g. from a watch event.
    pub fn decode<T: TypedPayload>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        self.codec.decode_tagged(bytes)
    }

    fn encode<T: TypedPayload>(&self, value: &T) -> Result<Bytes, CodecError> {
        self.codec.encode_tagged(value).map(Bytes::from)
    }
}
