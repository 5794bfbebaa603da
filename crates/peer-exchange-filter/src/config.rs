//! Exchange configuration
//!
//! One [`ExchangeConfig`] is built per listener (or upstream cluster) and shared
//! read-only by every connection the listener accepts.

use crate::discovery::WorkloadDiscovery;
use crate::identity::LocalIdentityProvider;
use crate::labels::merge_exchange_metadata;
use crate::stats::ExchangeStats;
use peer_exchange_proto::NodeMetadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// Configuration errors, reported when the filter chain is built
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Protocol identifier must not be empty")]
    EmptyProtocol,

    #[error("Invalid discovery network '{network}': {reason}")]
    InvalidNetwork { network: String, reason: String },
}

/// Which leg of a proxied connection the filter sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client-facing leg (accepted connections)
    Downstream,
    /// Server-facing leg (connections this proxy opens)
    Upstream,
}

impl Direction {
    pub fn write_timing(&self) -> WriteTiming {
        match self {
            Direction::Downstream => WriteTiming::OnConnect,
            Direction::Upstream => WriteTiming::OnFirstWrite,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Downstream => write!(f, "downstream"),
            Direction::Upstream => write!(f, "upstream"),
        }
    }
}

/// When the local frame goes out on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTiming {
    /// Immediately when the connection is established
    OnConnect,
    /// Prepended to the first outbound buffer
    OnFirstWrite,
}

/// Immutable per-listener exchange configuration
pub struct ExchangeConfig {
    protocol: String,
    direction: Direction,
    enable_discovery: bool,
    additional_labels: BTreeSet<String>,
    identity: Arc<dyn LocalIdentityProvider>,
    discovery: Option<Arc<dyn WorkloadDiscovery>>,
    stats: ExchangeStats,
}

impl ExchangeConfig {
    /// Create a configuration
    ///
    /// Fails if `protocol` is empty. Duplicate additional labels collapse.
    pub fn new<I, S>(
        protocol: impl Into<String>,
        direction: Direction,
        enable_discovery: bool,
        additional_labels: I,
        identity: Arc<dyn LocalIdentityProvider>,
    ) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let protocol = protocol.into();
        if protocol.is_empty() {
            return Err(ConfigError::EmptyProtocol);
        }

        Ok(Self {
            protocol,
            direction,
            enable_discovery,
            additional_labels: additional_labels.into_iter().map(Into::into).collect(),
            identity,
            discovery: None,
            stats: ExchangeStats::default(),
        })
    }

    /// Attach the discovery source consulted when discovery is enabled
    pub fn with_discovery(mut self, discovery: Arc<dyn WorkloadDiscovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    /// Report outcomes to the given stats scope
    pub fn with_stats(mut self, stats: ExchangeStats) -> Self {
        self.stats = stats;
        self
    }

    /// Report to the current sink under `prefix` instead
    pub fn with_stat_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stats = self.stats.with_prefix(prefix);
        self
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn write_timing(&self) -> WriteTiming {
        self.direction.write_timing()
    }

    pub fn discovery_enabled(&self) -> bool {
        self.enable_discovery
    }

    pub fn additional_labels(&self) -> &BTreeSet<String> {
        &self.additional_labels
    }

    pub fn stats(&self) -> &ExchangeStats {
        &self.stats
    }

    /// Whether a negotiated protocol means the peer speaks the exchange
    ///
    /// Exact, case-sensitive comparison.
    pub fn matches_protocol(&self, negotiated: Option<&str>) -> bool {
        negotiated == Some(self.protocol.as_str())
    }

    /// Metadata advertised on a connection to `remote`
    pub fn exchange_metadata(&self, remote: Option<SocketAddr>) -> NodeMetadata {
        let identity = self.identity.local_identity();

        let discovered = match (&self.discovery, remote) {
            (Some(discovery), Some(addr)) if self.enable_discovery => {
                discovery.lookup(&addr.ip())
            }
            _ => None,
        };
        trace!(
            "Building exchange metadata for {:?} (discovered labels: {})",
            remote,
            discovered.is_some()
        );

        merge_exchange_metadata(&identity, &self.additional_labels, discovered.as_ref())
    }
}

impl std::fmt::Debug for ExchangeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeConfig")
            .field("protocol", &self.protocol)
            .field("direction", &self.direction)
            .field("enable_discovery", &self.enable_discovery)
            .field("additional_labels", &self.additional_labels)
            .field("has_discovery", &self.discovery.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}

/// User-facing exchange settings
///
/// ```yaml
/// protocol: istio-peer-exchange
/// enable_discovery: true
/// additional_labels: ["app=foo", "version"]
/// ```
///
/// Direction is not configurable: the host picks `build_downstream` or
/// `build_upstream` depending on where the filter is installed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeSettings {
    pub protocol: String,
    #[serde(default)]
    pub enable_discovery: bool,
    #[serde(default)]
    pub additional_labels: Vec<String>,
}

impl ExchangeSettings {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            enable_discovery: false,
            additional_labels: Vec::new(),
        }
    }

    pub fn build_downstream(
        &self,
        identity: Arc<dyn LocalIdentityProvider>,
    ) -> Result<ExchangeConfig, ConfigError> {
        self.build(Direction::Downstream, identity)
    }

    pub fn build_upstream(
        &self,
        identity: Arc<dyn LocalIdentityProvider>,
    ) -> Result<ExchangeConfig, ConfigError> {
        self.build(Direction::Upstream, identity)
    }

    fn build(
        &self,
        direction: Direction,
        identity: Arc<dyn LocalIdentityProvider>,
    ) -> Result<ExchangeConfig, ConfigError> {
        ExchangeConfig::new(
            self.protocol.clone(),
            direction,
            self.enable_discovery,
            self.additional_labels.iter().cloned(),
            identity,
        )
    }
}
