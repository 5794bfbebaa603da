//! Relay configuration

use peer_exchange_filter::{
    ConfigError, Direction, ExchangeConfig, ExchangeSettings, ExchangeStats,
    LocalIdentityProvider, WorkloadDiscovery,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

/// Exchange settings for one leg, as written in a config file
///
/// ```yaml
/// protocol: istio-peer-exchange
/// negotiated_protocol: istio-peer-exchange
/// additional_labels: ["team=payments"]
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegSettings {
    #[serde(flatten)]
    pub exchange: ExchangeSettings,
    /// Application protocol this leg reports as negotiated. Plain TCP has no
    /// ALPN, so the operator states what the peer on this leg supports.
    #[serde(default)]
    pub negotiated_protocol: Option<String>,
}

/// Runtime configuration for one leg
#[derive(Debug, Clone)]
pub struct LegConfig {
    pub exchange: Arc<ExchangeConfig>,
    pub negotiated_protocol: Option<String>,
}

impl LegConfig {
    pub fn new(exchange: ExchangeConfig, negotiated_protocol: Option<String>) -> Self {
        Self {
            exchange: Arc::new(exchange),
            negotiated_protocol,
        }
    }

    /// Build the leg for `direction` from file settings
    pub fn from_settings(
        settings: &LegSettings,
        direction: Direction,
        identity: Arc<dyn LocalIdentityProvider>,
        discovery: Option<Arc<dyn WorkloadDiscovery>>,
        stats: ExchangeStats,
    ) -> Result<Self, ConfigError> {
        let exchange = match direction {
            Direction::Downstream => settings.exchange.build_downstream(identity)?,
            Direction::Upstream => settings.exchange.build_upstream(identity)?,
        };
        let exchange = match discovery {
            Some(discovery) => exchange.with_discovery(discovery),
            None => exchange,
        }
        .with_stats(stats);

        Ok(Self::new(exchange, settings.negotiated_protocol.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub bind_addr: SocketAddr,
    /// Upstream address (host:port)
    pub upstream_addr: String,
    /// Exchange on accepted connections
    pub downstream: Option<LegConfig>,
    /// Exchange on connections to the upstream
    pub upstream: Option<LegConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use peer_exchange_filter::{CounterStore, NodeMetadata, StaticIdentity};

    #[test]
    fn test_leg_settings_flatten() {
        let yaml = r#"
protocol: istio-peer-exchange
negotiated_protocol: istio-peer-exchange
enable_discovery: true
additional_labels: ["team=payments"]
"#;
        let settings: LegSettings = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(settings.exchange.protocol, "istio-peer-exchange");
        assert!(settings.exchange.enable_discovery);
        assert_eq!(settings.exchange.additional_labels, vec!["team=payments"]);
        assert_eq!(
            settings.negotiated_protocol.as_deref(),
            Some("istio-peer-exchange")
        );
    }

    #[test]
    fn test_leg_config_direction() {
        let settings: LegSettings = serde_yaml::from_str("protocol: mx\n").unwrap();
        assert_eq!(settings.negotiated_protocol, None);

        let identity = Arc::new(StaticIdentity::new(NodeMetadata::new("n1", "c1")));
        let stats = ExchangeStats::new("mx.", Arc::new(CounterStore::new()));
        let leg = LegConfig::from_settings(&settings, Direction::Upstream, identity, None, stats)
            .unwrap();

        assert_eq!(leg.exchange.direction(), Direction::Upstream);
        assert_eq!(leg.exchange.stats().prefix(), "mx.");
    }
}
