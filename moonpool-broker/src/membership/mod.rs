//! Cluster membership over a KV bucket.
//!
//! - [`MembershipDirectory`]: cached, revision-controlled member table with a
//!   watch feed and a keep-alive loop
//! - [`MembershipTable`]: the table contract a silo runtime calls
//! - [`GatewayView`]: active gateways derived from the directory

pub mod directory;
pub mod gateway;
mod keep_alive;
pub mod table;
pub mod types;

pub use directory::MembershipDirectory;
pub use gateway::{gateway_address, gateway_uri, GatewayListProvider, GatewayView};
pub use table::MembershipTable;
pub use types::{
    DirectoryRecord, MemberEntry, MemberStatus, MembershipTableData, SuspectEntry, TableVersion,
};
