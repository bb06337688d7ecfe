//! Broker-facing names derived from cluster identity.
//!
//! Every identifier the broker sees is a pure function of
//! `(cluster_id, service_id, base/provider name)`, so all processes of one
//! deployment agree on bucket, stream, subject and consumer names without
//! coordination:
//!
//! ```text
//! bucket            {base}-{cluster}-{service}
//! stream, consumer  streaming-{cluster}-{service}-{provider}
//! subject pattern   {cluster}-{service}-{provider}.*.*
//! subject           {cluster}-{service}-{provider}.{stream_id}.{namespace}
//! member key        10.0.0.1:11111@42  <->  10.0.0.1_11111=42
//! ```

use crate::address::{MemberAddress, MemberAddressParseError};
use crate::error::ConfigError;

/// Separator between address and port in the parsable address form.
const ADDRESS_SEPARATOR: char = ':';
/// Separator before the generation in the parsable address form.
const GENERATION_SEPARATOR: char = '@';
/// Key-safe stand-in for [`ADDRESS_SEPARATOR`].
const ADDRESS_SUBSTITUTE: char = '_';
/// Key-safe stand-in for [`GENERATION_SEPARATOR`].
const GENERATION_SUBSTITUTE: char = '=';

/// Token used in subjects for an empty namespace.
const EMPTY_TOKEN: &str = "_";

/// Names shared by every component of one cluster deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNaming {
    cluster_id: String,
    service_id: String,
}

impl ClusterNaming {
    /// Validate and capture the cluster identity.
    pub fn new(
        cluster_id: impl Into<String>,
        service_id: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let cluster_id = cluster_id.into();
        let service_id = service_id.into();
        validate_name("cluster_id", &cluster_id)?;
        validate_name("service_id", &service_id)?;
        Ok(Self {
            cluster_id,
            service_id,
        })
    }

    /// Cluster id.
    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Service id.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// KV bucket name: `{base}-{cluster}-{service}`.
    pub fn bucket_name(&self, base: &str) -> String {
        format!("{}-{}-{}", base, self.cluster_id, self.service_id)
    }

    /// Names for one streaming provider.
    pub fn streaming(&self, provider_name: &str) -> Result<StreamNaming, ConfigError> {
        validate_name("provider_name", provider_name)?;
        Ok(StreamNaming {
            prefix: format!(
                "{}-{}-{}",
                self.cluster_id, self.service_id, provider_name
            ),
        })
    }
}

/// Stream, consumer and subject names for one streaming provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNaming {
    prefix: String,
}

impl StreamNaming {
    /// Stream name: `streaming-{cluster}-{service}-{provider}`.
    pub fn stream_name(&self) -> String {
        format!("streaming-{}", self.prefix)
    }

    /// Durable consumer name; identical to the stream name so every receiver
    /// of the deployment shares one work queue.
    pub fn consumer_name(&self) -> String {
        self.stream_name()
    }

    /// Subject pattern bound to the stream: `{prefix}.*.*`.
    pub fn subject_pattern(&self) -> String {
        format!("{}.*.*", self.prefix)
    }

    /// Concrete subject for one `(stream_id, namespace)` channel.
    ///
    /// Characters that would break subject tokenization are replaced with `_`.
    /// Receivers attribute messages from headers, so the mapping does not need
    /// to be reversible.
    pub fn subject(&self, stream_id: &str, namespace: &str) -> String {
        format!(
            "{}.{}.{}",
            self.prefix,
            subject_token(stream_id),
            subject_token(namespace)
        )
    }
}

fn subject_token(raw: &str) -> String {
    if raw.is_empty() {
        return EMPTY_TOKEN.to_string();
    }
    raw.chars()
        .map(|c| match c {
            '.' | '*' | '>' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::Empty(field));
    }
    if value
        .chars()
        .any(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace())
    {
        return Err(ConfigError::IllegalName {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Encode a member address as a KV key.
///
/// KV keys may not contain `:` or `@`; both are swapped for characters that
/// never appear in the parsable address form.
pub fn encode_member_key(address: &MemberAddress) -> String {
    address
        .to_string()
        .chars()
        .map(|c| match c {
            ADDRESS_SEPARATOR => ADDRESS_SUBSTITUTE,
            GENERATION_SEPARATOR => GENERATION_SUBSTITUTE,
            c => c,
        })
        .collect()
}

/// Decode a KV key produced by [`encode_member_key`].
pub fn decode_member_key(key: &str) -> Result<MemberAddress, MemberAddressParseError> {
    let parsable: String = key
        .chars()
        .map(|c| match c {
            ADDRESS_SUBSTITUTE => ADDRESS_SEPARATOR,
            GENERATION_SUBSTITUTE => GENERATION_SEPARATOR,
            c => c,
        })
        .collect();
    parsable.parse()
}
