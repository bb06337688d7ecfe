//! Membership data model: member status, entries and table versions.
//!
//! A [`MemberEntry`] is what the hosting runtime publishes about one process
//! instance. The directory stores it next to the broker revision of the write
//! that produced it ([`DirectoryRecord`]); that revision is the
//! optimistic-concurrency token for the next update.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::address::MemberAddress;
use crate::broker::Revision;
use crate::codec::TypedPayload;

/// Lifecycle status of a cluster member.
///
/// Statuses only move forward, in declaration order, toward [`Dead`](Self::Dead).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum MemberStatus {
    /// Constructed locally, not yet announced.
    #[default]
    Created,
    /// Announced, not yet ready to serve.
    Joining,
    /// Fully operational.
    Active,
    /// Graceful shutdown started.
    ShuttingDown,
    /// Stopping immediately.
    Stopping,
    /// Gone, either crashed or finished shutting down.
    Dead,
}

impl MemberStatus {
    /// Shutting down or stopping, but not yet dead.
    pub fn is_terminating(self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Stopping)
    }

    /// Dead.
    pub fn is_terminated(self) -> bool {
        self == Self::Dead
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(self, next: MemberStatus) -> bool {
        next >= self
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "Created",
            Self::Joining => "Joining",
            Self::Active => "Active",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopping => "Stopping",
            Self::Dead => "Dead",
        };
        f.write_str(name)
    }
}

/// One suspicion vote against a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspectEntry {
    /// Who suspects the member.
    pub suspecting: MemberAddress,
    /// When the vote was cast.
    pub time: DateTime<Utc>,
}

/// Everything published about one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Process instance identity.
    pub address: MemberAddress,
    /// Lifecycle status.
    pub status: MemberStatus,
    /// Client-facing gateway port; 0 means this member is not a gateway.
    pub proxy_port: u16,
    /// Machine host name.
    pub host_name: String,
    /// Logical member name.
    pub silo_name: String,
    /// Deployment role.
    pub role_name: String,
    /// Upgrade domain.
    pub update_zone: i32,
    /// Failure domain.
    pub fault_zone: i32,
    /// When the process started.
    pub start_time: DateTime<Utc>,
    /// Last liveness heartbeat.
    pub i_am_alive_time: DateTime<Utc>,
    /// Suspicion votes, oldest first.
    #[serde(default)]
    pub suspect_times: Vec<SuspectEntry>,
}

impl TypedPayload for MemberEntry {
    const TYPE_TAG: &'static str = "moonpool.membership.MemberEntry";
}

impl MemberEntry {
    /// A fresh entry in [`MemberStatus::Created`], started and alive at `now`.
    pub fn new(address: MemberAddress, now: DateTime<Utc>) -> Self {
        Self {
            address,
            status: MemberStatus::Created,
            proxy_port: 0,
            host_name: String::new(),
            silo_name: String::new(),
            role_name: String::new(),
            update_zone: 0,
            fault_zone: 0,
            start_time: now,
            i_am_alive_time: now,
            suspect_times: Vec::new(),
        }
    }

    /// Builder: set the status.
    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Builder: set the gateway port.
    pub fn with_proxy_port(mut self, proxy_port: u16) -> Self {
        self.proxy_port = proxy_port;
        self
    }

    /// Builder: set host and silo names.
    pub fn with_names(mut self, host_name: impl Into<String>, silo_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self.silo_name = silo_name.into();
        self
    }

    /// Builder: set the role.
    pub fn with_role(mut self, role_name: impl Into<String>) -> Self {
        self.role_name = role_name.into();
        self
    }

    /// Builder: set update and fault zones.
    pub fn with_zones(mut self, update_zone: i32, fault_zone: i32) -> Self {
        self.update_zone = update_zone;
        self.fault_zone = fault_zone;
        self
    }

    /// Whether clients may connect through this member.
    pub fn is_gateway(&self) -> bool {
        self.status == MemberStatus::Active && self.proxy_port != 0
    }

    /// Record a suspicion vote.
    pub fn add_suspector(&mut self, suspecting: MemberAddress, time: DateTime<Utc>) {
        self.suspect_times.push(SuspectEntry { suspecting, time });
    }
}

/// Global version of the membership table.
///
/// The KV directory has no table-wide counter; it synthesizes one from the
/// highest revision in its cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TableVersion {
    /// Monotonic version number.
    pub version: u64,
    /// Opaque version tag.
    pub etag: String,
}

impl TableVersion {
    /// Version derived from the highest known revision (0 when empty).
    pub fn from_revision(revision: Option<Revision>) -> Self {
        let version = revision.map_or(0, |r| r.0);
        Self {
            version,
            etag: version.to_string(),
        }
    }

    /// The version following this one.
    pub fn next(&self) -> Self {
        let version = self.version + 1;
        Self {
            version,
            etag: version.to_string(),
        }
    }
}

impl fmt::Display for TableVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.version)
    }
}

/// A cached entry and the revision it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryRecord {
    /// The entry.
    pub entry: MemberEntry,
    /// Optimistic-concurrency token.
    pub revision: Revision,
}

impl DirectoryRecord {
    /// The revision as the string etag handed out through the table SPI.
    pub fn etag(&self) -> String {
        self.revision.to_string()
    }
}

/// A full read of the membership table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MembershipTableData {
    /// Entries with their etags, ordered by address.
    pub entries: Vec<(MemberEntry, String)>,
    /// Table version at the time of the read.
    pub version: TableVersion,
}

impl MembershipTableData {
    /// Build from directory records.
    pub fn from_records(mut records: Vec<DirectoryRecord>) -> Self {
        let version =
            TableVersion::from_revision(records.iter().map(|record| record.revision).max());
        records.sort_by(|a, b| a.entry.address.cmp(&b.entry.address));
        let entries = records
            .into_iter()
            .map(|record| {
                let etag = record.etag();
                (record.entry, etag)
            })
            .collect();
        Self { entries, version }
    }

    /// Find the entry for an address.
    pub fn get(&self, address: &MemberAddress) -> Option<&(MemberEntry, String)> {
        self.entries.iter().find(|(entry, _)| entry.address == *address)
    }

    /// Members currently in `status`.
    pub fn with_status(&self, status: MemberStatus) -> impl Iterator<Item = &MemberEntry> {
        self.entries
            .iter()
            .map(|(entry, _)| entry)
            .filter(move |entry| entry.status == status)
    }
}
