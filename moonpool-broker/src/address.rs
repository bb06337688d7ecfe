//! Member addresses: endpoint plus generation.
//!
//! A [`MemberAddress`] identifies one process incarnation in the cluster. Two
//! processes bound to the same `ip:port` one after the other are told apart by
//! their generation, so a restarted member never inherits its predecessor's
//! directory entry.
//!
//! The parsable form is `"{ip}:{port}@{generation}"`. IPv6 addresses are written
//! without brackets; parsing splits on the *last* `:` before the `@`.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Globally unique identifier of one cluster process instance.
///
/// # Examples
///
/// ```
/// use moonpool_broker::MemberAddress;
/// use std::net::{IpAddr, Ipv4Addr};
///
/// let addr = MemberAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 11111, 42);
/// assert_eq!(addr.to_string(), "10.0.0.7:11111@42");
/// assert_eq!(addr.to_string().parse::<MemberAddress>().ok(), Some(addr));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberAddress {
    /// IP address (IPv4 or IPv6).
    pub ip: IpAddr,
    /// Silo-to-silo port.
    pub port: u16,
    /// Incarnation counter, usually derived from the process start time.
    pub generation: i32,
}

impl MemberAddress {
    /// Create a member address.
    pub fn new(ip: IpAddr, port: u16, generation: i32) -> Self {
        Self {
            ip,
            port,
            generation,
        }
    }

    /// Create a member address from a socket address.
    pub fn from_socket(endpoint: SocketAddr, generation: i32) -> Self {
        Self::new(endpoint.ip(), endpoint.port(), generation)
    }

    /// The silo-to-silo endpoint.
    pub fn endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Same host and generation, different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self { port, ..*self }
    }
}

impl fmt::Display for MemberAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.ip, self.port, self.generation)
    }
}

/// Error parsing a member address from its string form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemberAddressParseError {
    /// No `@` generation separator.
    #[error("missing generation separator '@'")]
    MissingGeneration,
    /// No `:` port separator.
    #[error("missing port separator ':'")]
    MissingPort,
    /// The IP part did not parse.
    #[error("invalid IP address")]
    InvalidIp,
    /// The port part did not parse.
    #[error("invalid port number")]
    InvalidPort,
    /// The generation part did not parse.
    #[error("invalid generation")]
    InvalidGeneration,
}

impl FromStr for MemberAddress {
    type Err = MemberAddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (endpoint, generation) = s
            .rsplit_once('@')
            .ok_or(MemberAddressParseError::MissingGeneration)?;
        let (ip, port) = endpoint
            .rsplit_once(':')
            .ok_or(MemberAddressParseError::MissingPort)?;

        let ip: IpAddr = ip.parse().map_err(|_| MemberAddressParseError::InvalidIp)?;
        let port: u16 = port
            .parse()
            .map_err(|_| MemberAddressParseError::InvalidPort)?;
        let generation: i32 = generation
            .parse()
            .map_err(|_| MemberAddressParseError::InvalidGeneration)?;

        Ok(Self::new(ip, port, generation))
    }
}
