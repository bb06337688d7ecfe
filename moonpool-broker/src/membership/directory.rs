//! KV-backed membership directory.
//!
//! The directory keeps an in-process cache of every member entry together
//! with the broker revision it was written at. The broker bucket is the source
//! of truth; the cache follows it through a watch feed.
//!
//! ```text
//!                    insert_or_update / update_i_am_alive
//!   runtime ──────────────────────────────────────────────┐
//!      ▲                                                  ▼
//!      │ read_one / read_all                    ┌──────────────────┐
//!      │ (cache only)                           │  KV bucket       │
//!  ┌───┴──────────────┐   Put / Delete / Purge  │  key = member    │
//!  │ DashMap cache    │◄────── watch feed ──────│  value = entry   │
//!  │ address → record │                         │  revision = CAS  │
//!  └──────────────────┘                         └──────────────────┘
//! ```
//!
//! # Consistency
//!
//! - A write updates the cache only after the broker accepted it, with the
//!   revision the broker returned.
//! - Watch events carrying a revision not newer than the cached one are
//!   ignored, so the cache converges to the highest revision per key.
//! - Reads never touch the broker once the directory is initialized.
//!
//! A failed watch feed is re-subscribed after `watch_retry_delay`, preceded by
//! a full reload so that keys that expired or were purged while the feed was
//! down leave the cache.
//!
//! # Example
//!
//! ```rust
//! use std::net::{IpAddr, Ipv4Addr};
//! use std::sync::Arc;
//! use chrono::Utc;
//! use moonpool_broker::broker::InMemoryBroker;
//! use moonpool_broker::config::{BrokerOptions, MembershipOptions};
//! use moonpool_broker::membership::{MemberEntry, MemberStatus, MembershipDirectory};
//! use moonpool_broker::MemberAddress;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Arc::new(InMemoryBroker::new());
//! let options = BrokerOptions::builder().cluster_id("dev").service_id("orders").build()?;
//! let directory = MembershipDirectory::new(broker, &options, MembershipOptions::default())?;
//! directory.initialize().await?;
//!
//! let me = MemberAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 11111, 1);
//! let entry = MemberEntry::new(me, Utc::now()).with_status(MemberStatus::Active);
//! directory.insert_or_update(entry).await?;
//! assert_eq!(directory.read_all()?.len(), 1);
//!
//! directory.shutdown(std::time::Duration::from_secs(1)).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::keep_alive::{self, KeepAliveHandle};
use super::types::{DirectoryRecord, MemberEntry, MembershipTableData, TableVersion};
use crate::address::MemberAddress;
use crate::broker::{KeyValueBroker, KvEntry, KvOperation, Revision};
use crate::config::{BrokerOptions, MembershipOptions};
use crate::error::MembershipError;
use crate::naming::{decode_member_key, encode_member_key, ClusterNaming};
use crate::store::KvStore;
use crate::time::{Clock, SystemClock};

/// State shared between the directory handle and its background tasks.
#[derive(Debug)]
pub(crate) struct DirectoryCore {
    store: KvStore,
    cache: DashMap<MemberAddress, DirectoryRecord>,
    clock: Arc<dyn Clock>,
    options: MembershipOptions,
    initialized: AtomicBool,
}

impl DirectoryCore {
    fn ensure_initialized(&self) -> Result<(), MembershipError> {
        if self.initialized.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(MembershipError::NotInitialized)
        }
    }

    /// Store a record unless the cache already holds a newer revision.
    fn upsert(&self, record: DirectoryRecord) -> bool {
        match self.cache.entry(record.entry.address) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().revision < record.revision {
                    occupied.insert(record);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
        }
    }

    /// Fold one watch event into the cache.
    fn apply(&self, event: KvEntry) {
        let address = match decode_member_key(&event.key) {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(key = %event.key, error = %e, "ignoring watch event for foreign key");
                return;
            }
        };

        match event.operation {
            KvOperation::Put => {
                let entry: MemberEntry = match self.store.decode(&event.value) {
                    Ok(entry) => entry,
                    Err(e) => {
                        tracing::warn!(
                            address = %address,
                            revision = %event.revision,
                            error = %e,
                            "ignoring undecodable membership entry"
                        );
                        return;
                    }
                };
                if entry.address != address {
                    tracing::warn!(key = %event.key, entry = %entry.address, "entry does not match its key");
                    return;
                }
                let status = entry.status;
                if self.upsert(DirectoryRecord {
                    entry,
                    revision: event.revision,
                }) {
                    tracing::debug!(address = %address, %status, revision = %event.revision, "member updated from watch");
                }
            }
            KvOperation::Delete | KvOperation::Purge => {
                let removed = self
                    .cache
                    .remove_if(&address, |_, record| record.revision < event.revision);
                if removed.is_some() {
                    tracing::debug!(address = %address, revision = %event.revision, "member removed from watch");
                }
            }
        }
    }

    /// Reload everything from the broker and replace the cache.
    pub(crate) async fn reload(&self) -> Result<usize, MembershipError> {
        let keys: Vec<String> = self.store.list_keys().await?.try_collect().await?;

        let mut fresh = Vec::with_capacity(keys.len());
        for key in keys {
            let address =
                decode_member_key(&key).map_err(|_| MembershipError::InvalidKey(key.clone()))?;
            // Deleted between listing and reading.
            let Some(versioned) = self.store.get::<MemberEntry>(&key).await? else {
                continue;
            };
            if versioned.value.address != address {
                return Err(MembershipError::InvalidKey(key));
            }
            fresh.push(DirectoryRecord {
                entry: versioned.value,
                revision: versioned.revision,
            });
        }

        let count = fresh.len();
        let live: std::collections::HashSet<MemberAddress> =
            fresh.iter().map(|record| record.entry.address).collect();
        self.cache.retain(|address, _| live.contains(address));
        for record in fresh {
            self.upsert(record);
        }
        tracing::debug!(bucket = %self.store.bucket(), members = count, "membership cache reloaded");
        Ok(count)
    }

    /// Re-read one key, e.g. after losing a revision race.
    pub(crate) async fn reload_one(&self, address: &MemberAddress) -> Result<(), MembershipError> {
        let key = encode_member_key(address);
        match self.store.get::<MemberEntry>(&key).await? {
            Some(versioned) => {
                self.upsert(DirectoryRecord {
                    entry: versioned.value,
                    revision: versioned.revision,
                });
            }
            None => {
                self.cache.remove(address);
            }
        }
        Ok(())
    }

    /// Stamp the liveness timestamp of a cached member and write it back.
    pub(crate) async fn update_i_am_alive_at(
        &self,
        address: &MemberAddress,
        alive_at: DateTime<Utc>,
    ) -> Result<Revision, MembershipError> {
        self.ensure_initialized()?;
        let Some(mut record) = self.cache.get(address).map(|r| r.value().clone()) else {
            return Err(MembershipError::EntryNotFound(address.to_string()));
        };
        record.entry.i_am_alive_time = alive_at;

        let key = encode_member_key(address);
        let revision = self
            .store
            .update_if_revision(&key, &record.entry, record.revision)
            .await?;
        self.upsert(DirectoryRecord {
            entry: record.entry,
            revision,
        });
        Ok(revision)
    }

    pub(crate) async fn update_i_am_alive(
        &self,
        address: &MemberAddress,
    ) -> Result<Revision, MembershipError> {
        let now = self.clock.now();
        self.update_i_am_alive_at(address, now).await
    }
}

/// Background tasks owned by a directory.
#[derive(Debug, Default)]
struct Tasks {
    watch: Option<(CancellationToken, JoinHandle<()>)>,
    keep_alive: Option<KeepAliveHandle>,
}

/// Membership table over a KV bucket, with a watch-fed local cache.
///
/// Created with [`new`](Self::new), then [`initialize`](Self::initialize)d
/// once. Every other operation fails with
/// [`MembershipError::NotInitialized`] before that.
#[derive(Debug)]
pub struct MembershipDirectory {
    core: Arc<DirectoryCore>,
    naming: ClusterNaming,
    tasks: Mutex<Tasks>,
    init_lock: tokio::sync::Mutex<()>,
}

impl MembershipDirectory {
    /// Create a directory using the system clock.
    pub fn new(
        broker: Arc<dyn KeyValueBroker>,
        broker_options: &BrokerOptions,
        options: MembershipOptions,
    ) -> Result<Self, MembershipError> {
        Self::with_clock(broker, broker_options, options, Arc::new(SystemClock))
    }

    /// Create a directory stamping liveness from `clock`.
    pub fn with_clock(
        broker: Arc<dyn KeyValueBroker>,
        broker_options: &BrokerOptions,
        options: MembershipOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, MembershipError> {
        broker_options.validate()?;
        options.validate()?;
        let naming = broker_options.naming()?;
        let bucket = naming.bucket_name(&broker_options.bucket_base);
        let store = KvStore::new(broker, options.bucket_config(bucket));
        Ok(Self {
            core: Arc::new(DirectoryCore {
                store,
                cache: DashMap::new(),
                clock,
                options,
                initialized: AtomicBool::new(false),
            }),
            naming,
            tasks: Mutex::new(Tasks::default()),
            init_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Name of the backing bucket.
    pub fn bucket(&self) -> &str {
        self.core.store.bucket()
    }

    /// Cluster this directory belongs to.
    pub fn cluster_id(&self) -> &str {
        self.naming.cluster_id()
    }

    /// Options this directory runs with.
    pub fn options(&self) -> &MembershipOptions {
        &self.core.options
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub fn is_initialized(&self) -> bool {
        self.core.initialized.load(Ordering::Acquire)
    }

    /// Provision the bucket, warm the cache and start the watch feed.
    ///
    /// Idempotent. Failures propagate: a directory that cannot reach its
    /// bucket at startup must not pretend to be running.
    pub async fn initialize(&self) -> Result<(), MembershipError> {
        let _guard = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        self.core.store.ensure_bucket_exists().await?;
        let members = self.core.reload().await?;

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_watch(self.core.clone(), token.clone()));
        self.tasks.lock().watch = Some((token, handle));

        self.core.initialized.store(true, Ordering::Release);
        tracing::info!(bucket = %self.bucket(), members, "membership directory initialized");
        Ok(())
    }

    /// Write an entry: create on first write for its address, otherwise a
    /// conditional update against the cached revision.
    ///
    /// Conflicts and broker failures are returned to the caller; the cache is
    /// only touched once the broker accepted the write.
    pub async fn insert_or_update(&self, entry: MemberEntry) -> Result<Revision, MembershipError> {
        self.core.ensure_initialized()?;
        let address = entry.address;
        let key = encode_member_key(&address);
        let cached = self
            .core
            .cache
            .get(&address)
            .map(|record| (record.revision, record.entry.status));

        let revision = match cached {
            None => self.core.store.put(&key, &entry).await?,
            Some((expected, previous)) => {
                if !previous.can_transition_to(entry.status) {
                    tracing::warn!(
                        address = %address,
                        from = %previous,
                        to = %entry.status,
                        "membership status moved backwards"
                    );
                }
                self.core
                    .store
                    .update_if_revision(&key, &entry, expected)
                    .await?
            }
        };

        tracing::debug!(address = %address, status = %entry.status, revision = %revision, "member written");
        self.core.upsert(DirectoryRecord { entry, revision });
        Ok(revision)
    }

    /// Create an entry that must not exist yet.
    pub async fn insert(&self, entry: MemberEntry) -> Result<Revision, MembershipError> {
        self.core.ensure_initialized()?;
        let key = encode_member_key(&entry.address);
        let revision = self.core.store.create(&key, &entry).await?;
        self.core.upsert(DirectoryRecord { entry, revision });
        Ok(revision)
    }

    /// Update an entry only if it is still at `expected`.
    pub async fn update(
        &self,
        entry: MemberEntry,
        expected: Revision,
    ) -> Result<Revision, MembershipError> {
        self.core.ensure_initialized()?;
        let key = encode_member_key(&entry.address);
        let revision = self
            .core
            .store
            .update_if_revision(&key, &entry, expected)
            .await?;
        self.core.upsert(DirectoryRecord { entry, revision });
        Ok(revision)
    }

    /// Cached record for an address.
    pub fn read_one(&self, address: &MemberAddress) -> Result<Option<DirectoryRecord>, MembershipError> {
        self.core.ensure_initialized()?;
        Ok(self.core.cache.get(address).map(|record| record.value().clone()))
    }

    /// Every cached record, ordered by address.
    pub fn read_all(&self) -> Result<Vec<DirectoryRecord>, MembershipError> {
        self.core.ensure_initialized()?;
        let mut records: Vec<DirectoryRecord> = self
            .core
            .cache
            .iter()
            .map(|record| record.value().clone())
            .collect();
        records.sort_by(|a, b| a.entry.address.cmp(&b.entry.address));
        Ok(records)
    }

    /// Every cached record with etags and a synthesized table version.
    pub fn read_table(&self) -> Result<MembershipTableData, MembershipError> {
        Ok(MembershipTableData::from_records(self.read_all()?))
    }

    /// Version synthesized from the highest cached revision.
    pub fn table_version(&self) -> TableVersion {
        TableVersion::from_revision(self.core.cache.iter().map(|r| r.revision).max())
    }

    /// Delete every key in the bucket. Returns how many were deleted.
    pub async fn delete_all(&self) -> Result<usize, MembershipError> {
        self.core.ensure_initialized()?;
        let keys: Vec<String> = self.core.store.list_keys().await?.try_collect().await?;
        for key in &keys {
            self.core.store.delete(key).await?;
        }
        self.core.cache.clear();
        tracing::info!(bucket = %self.bucket(), deleted = keys.len(), "membership table cleared");
        Ok(keys.len())
    }

    /// Reload the cache from the broker.
    pub async fn refresh(&self) -> Result<usize, MembershipError> {
        self.core.ensure_initialized()?;
        self.core.reload().await
    }

    /// Delete dead members whose last heartbeat is older than `before`.
    /// Returns how many were deleted.
    pub async fn cleanup_defunct(&self, before: DateTime<Utc>) -> Result<usize, MembershipError> {
        self.core.ensure_initialized()?;
        let defunct: Vec<MemberAddress> = self
            .core
            .cache
            .iter()
            .filter(|record| {
                record.entry.status.is_terminated() && record.entry.i_am_alive_time < before
            })
            .map(|record| record.entry.address)
            .collect();

        for address in &defunct {
            self.core.store.delete(&encode_member_key(address)).await?;
            self.core.cache.remove(address);
            tracing::info!(address = %address, "defunct member removed");
        }
        Ok(defunct.len())
    }

    /// Stamp the current time as the member's liveness timestamp.
    pub async fn update_i_am_alive(&self, address: &MemberAddress) -> Result<Revision, MembershipError> {
        self.core.update_i_am_alive(address).await
    }

    /// Write an explicit liveness timestamp.
    pub async fn update_i_am_alive_at(
        &self,
        address: &MemberAddress,
        alive_at: DateTime<Utc>,
    ) -> Result<Revision, MembershipError> {
        self.core.update_i_am_alive_at(address, alive_at).await
    }

    /// Start heartbeating `address` every `heartbeat_interval`.
    ///
    /// Only one loop runs per directory.
    pub fn start_keep_alive(&self, address: MemberAddress) -> Result<(), MembershipError> {
        self.core.ensure_initialized()?;
        let mut tasks = self.tasks.lock();
        if tasks
            .keep_alive
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
        {
            return Err(MembershipError::KeepAliveAlreadyRunning);
        }
        tasks.keep_alive = Some(keep_alive::spawn(
            self.core.clone(),
            address,
            self.core.options.heartbeat_interval,
        ));
        Ok(())
    }

    /// Whether a keep-alive loop is running.
    pub fn is_keep_alive_running(&self) -> bool {
        self.tasks
            .lock()
            .keep_alive
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the keep-alive loop, waiting at most `timeout` for it to exit.
    pub async fn stop_keep_alive(&self, timeout: Duration) -> Result<(), MembershipError> {
        let handle = self.tasks.lock().keep_alive.take();
        match handle {
            Some(handle) => handle.stop(timeout).await,
            None => Ok(()),
        }
    }

    /// Stop every background task, waiting at most `timeout` overall.
    ///
    /// Idempotent. The cache stays readable afterwards but is no longer fed.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), MembershipError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let (watch, keep_alive) = {
            let mut tasks = self.tasks.lock();
            (tasks.watch.take(), tasks.keep_alive.take())
        };

        let mut result = Ok(());
        if let Some(handle) = keep_alive {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            result = handle.stop(remaining).await;
        }
        if let Some((token, handle)) = watch {
            token.cancel();
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if let Err(e) = join_within(handle, remaining, "watch").await {
                result = result.and(Err(e));
            }
        }
        tracing::debug!(bucket = %self.bucket(), "membership directory shut down");
        result
    }

    /// [`shutdown`](Self::shutdown) bounded by the configured `shutdown_timeout`.
    pub async fn close(&self) -> Result<(), MembershipError> {
        self.shutdown(self.core.options.shutdown_timeout).await
    }
}

impl Drop for MembershipDirectory {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut();
        if let Some((token, _)) = &tasks.watch {
            token.cancel();
        }
        if let Some(handle) = &tasks.keep_alive {
            handle.cancel();
        }
    }
}

/// Wait for a background task, aborting it if it overstays.
pub(crate) async fn join_within(
    handle: JoinHandle<()>,
    timeout: Duration,
    task: &'static str,
) -> Result<(), MembershipError> {
    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            tracing::error!(task, error = %e, "background task failed");
            Ok(())
        }
        Err(_) => {
            abort.abort();
            tracing::warn!(task, ?timeout, "background task did not stop in time");
            Err(MembershipError::ShutdownTimeout(timeout))
        }
    }
}

async fn run_watch(core: Arc<DirectoryCore>, token: CancellationToken) {
    loop {
        match core.store.watch().await {
            Ok(mut feed) => {
                tracing::debug!(bucket = %core.store.bucket(), "membership watch subscribed");
                loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => return,
                        next = feed.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => core.apply(event),
                        Some(Err(e)) => {
                            tracing::warn!(bucket = %core.store.bucket(), error = %e, "membership watch failed");
                            break;
                        }
                        None => {
                            tracing::warn!(bucket = %core.store.bucket(), "membership watch ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(bucket = %core.store.bucket(), error = %e, "membership watch subscribe failed");
            }
        }

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(core.options.watch_retry_delay) => {}
        }
        if let Err(e) = core.reload().await {
            tracing::warn!(bucket = %core.store.bucket(), error = %e, "membership reload before resubscribe failed");
        }
    }
}
