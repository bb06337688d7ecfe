//! Options for the broker connection, the membership directory and streaming.
//!
//! Three option groups, each usable three ways:
//!
//! - built in code ([`BrokerOptions::builder`], or struct update syntax on the
//!   `Default` impls)
//! - deserialized with serde from any structured config source
//! - parsed from flat key/value properties with `from_properties`
//!
//! Durations use humantime syntax (`15s`, `1m`, `500ms`) in both serialized and
//! flat forms.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::time::Duration;
//! use moonpool_broker::config::{BrokerOptions, MembershipOptions};
//!
//! let broker = BrokerOptions::builder()
//!     .cluster_id("dev")
//!     .service_id("orders")
//!     .build()
//!     .expect("valid options");
//! assert_eq!(broker.naming().expect("naming").bucket_name(&broker.bucket_base), "membership-dev-orders");
//!
//! let props = HashMap::from([("heartbeat_interval".to_string(), "5s".to_string())]);
//! let membership = MembershipOptions::from_properties(&props).expect("valid properties");
//! assert_eq!(membership.heartbeat_interval, Duration::from_secs(5));
//! ```

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::broker::BucketConfig;
use crate::error::ConfigError;
use crate::naming::ClusterNaming;

/// Default broker URL.
pub const DEFAULT_BROKER_URL: &str = "nats://127.0.0.1:4222";
/// Default base name of the membership bucket.
pub const DEFAULT_BUCKET_BASE: &str = "membership";
/// Default streaming provider name.
pub const DEFAULT_PROVIDER_NAME: &str = "default";

/// Broker connection and cluster identity.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerOptions {
    /// Broker connection URL.
    pub url: String,
    /// Base name of the membership bucket.
    pub bucket_base: String,
    /// Cluster id, shared by every process of one deployment.
    pub cluster_id: String,
    /// Service id.
    pub service_id: String,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_BROKER_URL.to_string(),
            bucket_base: DEFAULT_BUCKET_BASE.to_string(),
            cluster_id: String::new(),
            service_id: String::new(),
        }
    }
}

impl BrokerOptions {
    /// Start building broker options.
    pub fn builder() -> BrokerOptionsBuilder {
        BrokerOptionsBuilder::default()
    }

    /// Check that every field is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Empty("url"));
        }
        if self.bucket_base.is_empty() {
            return Err(ConfigError::Empty("bucket_base"));
        }
        self.naming().map(|_| ())
    }

    /// Naming convention for this deployment.
    pub fn naming(&self) -> Result<ClusterNaming, ConfigError> {
        ClusterNaming::new(self.cluster_id.clone(), self.service_id.clone())
    }

    /// Parse from flat properties (`url`, `bucket_base`, `cluster_id`,
    /// `service_id`). Missing keys keep their defaults; unknown keys are
    /// ignored so one property map can feed every option group.
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(url) = props.get("url") {
            options.url = url.clone();
        }
        if let Some(base) = props.get("bucket_base") {
            options.bucket_base = base.clone();
        }
        if let Some(cluster_id) = props.get("cluster_id") {
            options.cluster_id = cluster_id.clone();
        }
        if let Some(service_id) = props.get("service_id") {
            options.service_id = service_id.clone();
        }
        options.validate()?;
        Ok(options)
    }
}

/// Builder for [`BrokerOptions`].
#[derive(Debug, Clone, Default)]
pub struct BrokerOptionsBuilder {
    url: Option<String>,
    bucket_base: Option<String>,
    cluster_id: Option<String>,
    service_id: Option<String>,
}

impl BrokerOptionsBuilder {
    /// Set the broker URL.
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Set the membership bucket base name.
    pub fn bucket_base(mut self, base: impl Into<String>) -> Self {
        self.bucket_base = Some(base.into());
        self
    }

    /// Set the cluster id.
    pub fn cluster_id(mut self, cluster_id: impl Into<String>) -> Self {
        self.cluster_id = Some(cluster_id.into());
        self
    }

    /// Set the service id.
    pub fn service_id(mut self, service_id: impl Into<String>) -> Self {
        self.service_id = Some(service_id.into());
        self
    }

    /// Build and validate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the cluster or service id is missing or
    /// contains characters that cannot appear in broker names.
    pub fn build(self) -> Result<BrokerOptions, ConfigError> {
        let defaults = BrokerOptions::default();
        let options = BrokerOptions {
            url: self.url.unwrap_or(defaults.url),
            bucket_base: self.bucket_base.unwrap_or(defaults.bucket_base),
            cluster_id: self.cluster_id.ok_or(ConfigError::Empty("cluster_id"))?,
            service_id: self.service_id.ok_or(ConfigError::Empty("service_id"))?,
        };
        options.validate()?;
        Ok(options)
    }
}

/// Membership directory timing and bucket settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MembershipOptions {
    /// Period of the keep-alive heartbeat.
    #[serde(with = "humantime_duration")]
    pub heartbeat_interval: Duration,
    /// How stale the gateway list may get before clients re-poll.
    #[serde(with = "humantime_duration")]
    pub max_staleness: Duration,
    /// Revisions kept per key.
    pub bucket_history: u8,
    /// Bucket TTL; entries that stop heartbeating disappear after this.
    #[serde(with = "humantime_duration")]
    pub bucket_ttl: Duration,
    /// Delay before re-subscribing a failed watch feed.
    #[serde(with = "humantime_duration")]
    pub watch_retry_delay: Duration,
    /// Bounded wait for background tasks in `MembershipDirectory::close`.
    #[serde(with = "humantime_duration")]
    pub shutdown_timeout: Duration,
}

impl Default for MembershipOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            max_staleness: Duration::from_secs(60),
            bucket_history: 1,
            bucket_ttl: Duration::from_secs(300),
            watch_retry_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl MembershipOptions {
    /// Check ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("heartbeat_interval", self.heartbeat_interval)?;
        non_zero("watch_retry_delay", self.watch_retry_delay)?;
        if self.bucket_history == 0 || self.bucket_history > 64 {
            return Err(ConfigError::OutOfRange {
                field: "bucket_history",
                reason: format!("{} not in 1..=64", self.bucket_history),
            });
        }
        if !self.bucket_ttl.is_zero() && self.bucket_ttl <= self.heartbeat_interval {
            return Err(ConfigError::OutOfRange {
                field: "bucket_ttl",
                reason: format!(
                    "{} must exceed heartbeat_interval {}",
                    humantime::format_duration(self.bucket_ttl),
                    humantime::format_duration(self.heartbeat_interval)
                ),
            });
        }
        Ok(())
    }

    /// Bucket settings for a bucket called `name`.
    pub fn bucket_config(&self, name: impl Into<String>) -> BucketConfig {
        BucketConfig {
            name: name.into(),
            history: self.bucket_history,
            max_age: self.bucket_ttl,
        }
    }

    /// Parse from flat properties; see [`BrokerOptions::from_properties`].
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        set_duration(props, "heartbeat_interval", &mut options.heartbeat_interval)?;
        set_duration(props, "max_staleness", &mut options.max_staleness)?;
        set_parsed(props, "bucket_history", &mut options.bucket_history)?;
        set_duration(props, "bucket_ttl", &mut options.bucket_ttl)?;
        set_duration(props, "watch_retry_delay", &mut options.watch_retry_delay)?;
        set_duration(props, "shutdown_timeout", &mut options.shutdown_timeout)?;
        options.validate()?;
        Ok(options)
    }
}

/// Streaming provider settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamingOptions {
    /// Provider name, part of stream and subject names.
    pub provider_name: String,
    /// Redelivery deadline for unacknowledged messages.
    #[serde(with = "humantime_duration")]
    pub ack_wait: Duration,
    /// Longest a fetch waits for the first message.
    #[serde(with = "humantime_duration")]
    pub fetch_wait: Duration,
    /// Number of logical queues stream ids are hashed onto.
    pub partition_count: u32,
    /// Delivery attempts before the broker gives up on a message.
    pub max_deliver: Option<u32>,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            provider_name: DEFAULT_PROVIDER_NAME.to_string(),
            ack_wait: Duration::from_secs(30),
            fetch_wait: Duration::from_secs(1),
            partition_count: 8,
            max_deliver: None,
        }
    }
}

impl StreamingOptions {
    /// Check ranges. Name legality is checked when names are derived.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider_name.is_empty() {
            return Err(ConfigError::Empty("provider_name"));
        }
        non_zero("ack_wait", self.ack_wait)?;
        non_zero("fetch_wait", self.fetch_wait)?;
        if self.partition_count == 0 {
            return Err(ConfigError::OutOfRange {
                field: "partition_count",
                reason: "must be at least 1".into(),
            });
        }
        if self.max_deliver == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "max_deliver",
                reason: "must be at least 1 when set".into(),
            });
        }
        Ok(())
    }

    /// Parse from flat properties; see [`BrokerOptions::from_properties`].
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut options = Self::default();
        if let Some(name) = props.get("provider_name") {
            options.provider_name = name.clone();
        }
        set_duration(props, "ack_wait", &mut options.ack_wait)?;
        set_duration(props, "fetch_wait", &mut options.fetch_wait)?;
        set_parsed(props, "partition_count", &mut options.partition_count)?;
        if let Some(raw) = props.get("max_deliver") {
            options.max_deliver = Some(parse_value("max_deliver", raw)?);
        }
        options.validate()?;
        Ok(options)
    }
}

fn non_zero(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::OutOfRange {
            field,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(())
}

fn set_duration(
    props: &HashMap<String, String>,
    key: &str,
    target: &mut Duration,
) -> Result<(), ConfigError> {
    if let Some(raw) = props.get(key) {
        *target = humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::Parse {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn set_parsed<T>(props: &HashMap<String, String>, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = props.get(key) {
        *target = parse_value(key, raw)?;
    }
    Ok(())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Serde adapter for humantime duration strings.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }
}
