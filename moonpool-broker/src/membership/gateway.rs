//! Gateway discovery: which members accept client connections.
//!
//! A read-only projection of the membership directory. A member is a gateway
//! when it is `Active` and advertises a non-zero proxy port; its gateway URI
//! is built from its IP and proxy port with generation 0, since clients do not
//! care which incarnation serves them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::directory::MembershipDirectory;
use super::types::MemberEntry;
use crate::address::MemberAddress;
use crate::error::MembershipError;

/// Gateway list contract invoked by client runtimes.
#[async_trait]
pub trait GatewayListProvider: Send + Sync {
    /// Prepare the provider.
    async fn init(&self) -> Result<(), MembershipError>;

    /// URIs of every current gateway.
    async fn get_gateways(&self) -> Result<Vec<String>, MembershipError>;

    /// How often callers should re-poll.
    fn max_staleness(&self) -> Duration;

    /// Whether the list changes without caller action.
    fn is_updatable(&self) -> bool;
}

/// Gateway endpoint of a member: proxy port, generation 0.
pub fn gateway_address(entry: &MemberEntry) -> MemberAddress {
    MemberAddress::new(entry.address.ip, entry.proxy_port, 0)
}

/// `gwy.tcp://{ip}:{port}/0` for a gateway address.
pub fn gateway_uri(address: &MemberAddress) -> String {
    let endpoint = address.endpoint();
    format!("gwy.tcp://{}/{}", endpoint, address.generation)
}

/// Gateway list served from a [`MembershipDirectory`].
#[derive(Debug, Clone)]
pub struct GatewayView {
    directory: Arc<MembershipDirectory>,
    max_staleness: Duration,
}

impl GatewayView {
    /// Project `directory`, advertising its configured `max_staleness`.
    pub fn new(directory: Arc<MembershipDirectory>) -> Self {
        let max_staleness = directory.options().max_staleness;
        Self {
            directory,
            max_staleness,
        }
    }

    /// Gateway addresses of active members with a proxy port.
    pub fn active_gateways(&self) -> Result<Vec<MemberAddress>, MembershipError> {
        Ok(self
            .directory
            .read_all()?
            .iter()
            .filter(|record| record.entry.is_gateway())
            .map(|record| gateway_address(&record.entry))
            .collect())
    }
}

#[async_trait]
impl GatewayListProvider for GatewayView {
    async fn init(&self) -> Result<(), MembershipError> {
        self.directory.initialize().await
    }

    async fn get_gateways(&self) -> Result<Vec<String>, MembershipError> {
        let gateways: Vec<String> = self.active_gateways()?.iter().map(gateway_uri).collect();
        tracing::debug!(count = gateways.len(), "gateway list read");
        Ok(gateways)
    }

    fn max_staleness(&self) -> Duration {
        self.max_staleness
    }

    fn is_updatable(&self) -> bool {
        true
    }
}
