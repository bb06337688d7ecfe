//! Membership-table contract invoked by the hosting runtime.
//!
//! [`MembershipTable`] is the table-shaped view a silo runtime expects: rows
//! with string etags and a table version. [`MembershipDirectory`] implements
//! it on top of per-key revisions:
//!
//! | Operation | KV behavior |
//! |-----------|-------------|
//! | `insert_row` | create-only write; `Ok(false)` if the row exists |
//! | `update_row` | write if the etag (revision) still matches; `Ok(false)` otherwise |
//! | `read_row`, `read_all` | served from the directory cache |
//! | `update_i_am_alive` | conditional write of the liveness timestamp |
//!
//! The table version passed by callers is accepted and ignored: there is no
//! table-wide counter to check it against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::directory::MembershipDirectory;
use super::types::{MemberEntry, MembershipTableData, TableVersion};
use crate::address::MemberAddress;
use crate::broker::Revision;
use crate::error::MembershipError;

/// Table-shaped membership storage.
#[async_trait]
pub trait MembershipTable: Send + Sync {
    /// Prepare the table. `try_init_table_version` asks the implementation to
    /// create the initial version row when it keeps one.
    async fn init(&self, try_init_table_version: bool) -> Result<(), MembershipError>;

    /// Add a row that must not exist. `Ok(false)` if it does.
    async fn insert_row(
        &self,
        entry: MemberEntry,
        version: TableVersion,
    ) -> Result<bool, MembershipError>;

    /// Replace a row if its etag still matches. `Ok(false)` on a lost race.
    async fn update_row(
        &self,
        entry: MemberEntry,
        etag: &str,
        version: TableVersion,
    ) -> Result<bool, MembershipError>;

    /// The row for one member, if any.
    async fn read_row(&self, address: &MemberAddress) -> Result<MembershipTableData, MembershipError>;

    /// Every row.
    async fn read_all(&self) -> Result<MembershipTableData, MembershipError>;

    /// Refresh only the liveness timestamp of `entry`'s row.
    async fn update_i_am_alive(&self, entry: &MemberEntry) -> Result<(), MembershipError>;

    /// Remove every row of a cluster.
    async fn delete_membership_table_entries(&self, cluster_id: &str) -> Result<(), MembershipError>;

    /// Remove dead rows whose last heartbeat is older than `before`.
    async fn cleanup_defunct_silo_entries(
        &self,
        before: DateTime<Utc>,
    ) -> Result<usize, MembershipError>;
}

fn conflict_as_false(result: Result<Revision, MembershipError>) -> Result<bool, MembershipError> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => {
            tracing::debug!(error = %e, "membership row write lost a race");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[async_trait]
impl MembershipTable for MembershipDirectory {
    async fn init(&self, try_init_table_version: bool) -> Result<(), MembershipError> {
        tracing::debug!(try_init_table_version, "membership table init");
        self.initialize().await
    }

    async fn insert_row(
        &self,
        entry: MemberEntry,
        _version: TableVersion,
    ) -> Result<bool, MembershipError> {
        conflict_as_false(self.insert(entry).await)
    }

    async fn update_row(
        &self,
        entry: MemberEntry,
        etag: &str,
        _version: TableVersion,
    ) -> Result<bool, MembershipError> {
        let Ok(expected) = etag.parse::<u64>() else {
            tracing::debug!(address = %entry.address, etag, "etag is not a revision");
            return Ok(false);
        };
        conflict_as_false(self.update(entry, Revision(expected)).await)
    }

    async fn read_row(&self, address: &MemberAddress) -> Result<MembershipTableData, MembershipError> {
        let records = self.read_one(address)?.into_iter().collect();
        let mut data = MembershipTableData::from_records(records);
        data.version = self.table_version();
        Ok(data)
    }

    async fn read_all(&self) -> Result<MembershipTableData, MembershipError> {
        self.read_table()
    }

    async fn update_i_am_alive(&self, entry: &MemberEntry) -> Result<(), MembershipError> {
        self.update_i_am_alive_at(&entry.address, entry.i_am_alive_time)
            .await
            .map(|_| ())
    }

    async fn delete_membership_table_entries(&self, cluster_id: &str) -> Result<(), MembershipError> {
        if cluster_id != self.cluster_id() {
            tracing::warn!(
                requested = cluster_id,
                own = self.cluster_id(),
                "refusing to clear another cluster's membership"
            );
            return Ok(());
        }
        self.delete_all().await.map(|_| ())
    }

    async fn cleanup_defunct_silo_entries(
        &self,
        before: DateTime<Utc>,
    ) -> Result<usize, MembershipError> {
        self.cleanup_defunct(before).await
    }
}
