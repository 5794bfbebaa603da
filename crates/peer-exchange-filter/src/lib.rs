//! Peer metadata exchange filter
//!
//! A byte-stream filter that lets two adjacent proxies swap workload identity
//! (node id, cluster, labels) at the start of a TCP connection, invisibly to the
//! application protocol carried on it.
//!
//! The host runtime owns the sockets and drives one [`MetadataExchangeFilter`]
//! per connection leg:
//!
//! ```ignore
//! use peer_exchange_filter::{ExchangeSettings, MetadataExchangeFilter, StaticIdentity};
//! use std::sync::Arc;
//!
//! let settings = ExchangeSettings::new("istio-peer-exchange");
//! let identity = Arc::new(StaticIdentity::new(local_node));
//! let config = Arc::new(settings.build_downstream(identity)?);
//!
//! // per accepted connection
//! let mut filter = MetadataExchangeFilter::new(config.clone());
//! filter.on_new_connection(&mut callbacks);
//! let status = filter.on_data(&mut read_buf, false, &mut callbacks);
//! ```
//!
//! Outcomes are reported through named counters (see [`stats`]).

pub mod config;
pub mod discovery;
pub mod filter;
pub mod identity;
pub mod labels;
pub mod stats;

pub use config::{ConfigError, Direction, ExchangeConfig, ExchangeSettings, WriteTiming};
pub use discovery::{DiscoveryEntry, NetworkDiscovery, WorkloadDiscovery};
pub use filter::{ConnectionCallbacks, ExchangePhase, FilterStatus, MetadataExchangeFilter};
pub use identity::{LocalIdentityProvider, StaticIdentity};
pub use labels::merge_exchange_metadata;
pub use stats::{CounterStore, ExchangeStats, StatsSink, DEFAULT_STAT_PREFIX};

pub use peer_exchange_proto::{NodeMetadata, DEFAULT_PROTOCOL};
