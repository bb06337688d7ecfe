//! # moonpool-broker
//!
//! Cluster membership and durable event streaming for a silo cluster, built on
//! a shared key-value/stream broker.
//!
//! Two subsystems share one naming convention and one broker:
//!
//! - **Membership**: a versioned member table in a KV bucket, cached locally
//!   and fed by a watch, with a keep-alive heartbeat and a gateway view
//! - **Streaming**: a producer that maps `(stream_id, namespace)` channels onto
//!   broker subjects, and a receiver that rebuilds ordered batches and tracks
//!   them until acknowledged (at-least-once)
//!
//! ```text
//!            naming ─► codec ─► broker ─► store ─► membership ─► gateway
//!                                  │
//!                                  └──────────► streaming (adapter, receiver)
//! ```
//!
//! ## Broker
//!
//! The crate consumes the [`KeyValueBroker`](broker::KeyValueBroker) and
//! [`StreamBroker`](broker::StreamBroker) traits. [`InMemoryBroker`](broker::InMemoryBroker)
//! implements both in-process with the same revision, retention and
//! acknowledgement semantics, plus fault injection for tests.
//!
//! ## Runtime contracts
//!
//! - [`MembershipTable`](membership::MembershipTable)
//! - [`GatewayListProvider`](membership::GatewayListProvider)
//! - [`QueueAdapter`](streaming::QueueAdapter)
//! - [`QueueAdapterReceiver`](streaming::QueueAdapterReceiver)

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod address;
pub mod broker;
pub mod codec;
pub mod config;
pub mod error;
pub mod membership;
pub mod naming;
pub mod store;
pub mod streaming;
pub mod time;

pub use address::{MemberAddress, MemberAddressParseError};
pub use codec::{JsonCodec, TypeRegistry, TypedPayload};
pub use config::{BrokerOptions, MembershipOptions, StreamingOptions};
pub use error::{BrokerError, CodecError, ConfigError, MembershipError, StoreError, StreamingError};
pub use naming::{ClusterNaming, StreamNaming};
