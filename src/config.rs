//! Config file loading and merging with CLI flags

use anyhow::{bail, Context, Result};
use peer_exchange_filter::{
    CounterStore, DiscoveryEntry, Direction, ExchangeSettings, ExchangeStats,
    LocalIdentityProvider, NetworkDiscovery, NodeMetadata, StaticIdentity, WorkloadDiscovery,
    DEFAULT_STAT_PREFIX,
};
use peer_exchange_proxy::{LegConfig, LegSettings, ProxyConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Configuration file format (YAML or JSON)
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Address to listen on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind: Option<SocketAddr>,

    /// Upstream address (host:port)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,

    /// Local proxy identity advertised to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<NodeMetadata>,

    /// Exchange on accepted connections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream: Option<LegSettings>,

    /// Exchange on connections to the upstream
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_exchange: Option<LegSettings>,

    /// Address-based discovery rules
    #[serde(default)]
    pub discovery: Vec<DiscoveryEntry>,

    /// Prefix for exchange counters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stat_prefix: Option<String>,
}

/// Values given on the command line; each one overrides the file
#[derive(Debug, Default)]
pub struct Overrides {
    pub bind: Option<SocketAddr>,
    pub upstream: Option<String>,
    pub node_id: Option<String>,
    pub cluster: Option<String>,
    pub labels: Vec<String>,
    pub downstream_protocol: Option<String>,
    pub upstream_protocol: Option<String>,
    pub assume_negotiated: bool,
}

/// Load configuration from a YAML or JSON file (by extension)
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let is_json = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let config: ConfigFile = if is_json {
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    };

    Ok(config)
}

/// Parse `key=value` label flags
fn parse_label_flags(labels: &[String]) -> Result<BTreeMap<String, String>> {
    let mut parsed = BTreeMap::new();
    for label in labels {
        match label.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                parsed.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => bail!("Invalid label '{}', expected key=value", label),
        }
    }
    Ok(parsed)
}

/// Apply a `--*-protocol` flag to a leg, keeping the rest of its file settings
fn override_leg_protocol(leg: &mut Option<LegSettings>, protocol: String, assume_negotiated: bool) {
    let negotiated = assume_negotiated.then(|| protocol.clone());
    match leg {
        Some(settings) => {
            settings.exchange.protocol = protocol;
            if negotiated.is_some() {
                settings.negotiated_protocol = negotiated;
            }
        }
        None => {
            *leg = Some(LegSettings {
                exchange: ExchangeSettings::new(protocol),
                negotiated_protocol: negotiated,
            });
        }
    }
}

/// Merge the file with CLI overrides, giving precedence to CLI values
pub fn merge(mut file: ConfigFile, overrides: Overrides) -> Result<ConfigFile> {
    if overrides.bind.is_some() {
        file.bind = overrides.bind;
    }
    if overrides.upstream.is_some() {
        file.upstream = overrides.upstream;
    }

    let mut identity = file.identity.take().unwrap_or_default();
    if let Some(node_id) = overrides.node_id {
        identity.node_id = node_id;
    }
    if let Some(cluster) = overrides.cluster {
        identity.cluster = cluster;
    }
    identity.labels.extend(parse_label_flags(&overrides.labels)?);
    file.identity = Some(identity);

    if let Some(protocol) = overrides.downstream_protocol {
        override_leg_protocol(&mut file.downstream, protocol, overrides.assume_negotiated);
    }
    if let Some(protocol) = overrides.upstream_protocol {
        override_leg_protocol(&mut file.upstream_exchange, protocol, overrides.assume_negotiated);
    }

    Ok(file)
}

/// Build the relay configuration and the counter store its filters report to
pub fn build_proxy_config(file: ConfigFile) -> Result<(ProxyConfig, Arc<CounterStore>)> {
    let bind_addr = file
        .bind
        .context("No listen address configured (use --bind or `bind:` in the config file)")?;
    let upstream_addr = file
        .upstream
        .context("No upstream configured (use --upstream or `upstream:` in the config file)")?;

    let identity = file.identity.unwrap_or_default();
    if identity.node_id.is_empty() {
        bail!("No node id configured (use --node-id or `identity.node_id`)");
    }
    info!(
        "Local identity: node {} in cluster {} with {} labels",
        identity.node_id,
        identity.cluster,
        identity.labels.len()
    );
    let identity: Arc<dyn LocalIdentityProvider> = Arc::new(StaticIdentity::new(identity));

    let discovery: Option<Arc<dyn WorkloadDiscovery>> = if file.discovery.is_empty() {
        None
    } else {
        let table = NetworkDiscovery::from_entries(&file.discovery)
            .context("Invalid discovery configuration")?;
        info!("Loaded {} discovery rules", table.len());
        Some(Arc::new(table))
    };

    let store = Arc::new(CounterStore::new());
    let stats = ExchangeStats::new(
        file.stat_prefix
            .unwrap_or_else(|| DEFAULT_STAT_PREFIX.to_string()),
        store.clone(),
    );

    let build_leg = |settings: &LegSettings, direction: Direction| {
        LegConfig::from_settings(
            settings,
            direction,
            identity.clone(),
            discovery.clone(),
            stats.clone(),
        )
        .with_context(|| format!("Invalid {} exchange configuration", direction))
    };

    let downstream = file
        .downstream
        .as_ref()
        .map(|s| build_leg(s, Direction::Downstream))
        .transpose()?;
    let upstream = file
        .upstream_exchange
        .as_ref()
        .map(|s| build_leg(s, Direction::Upstream))
        .transpose()?;

    Ok((
        ProxyConfig {
            bind_addr,
            upstream_addr,
            downstream,
            upstream,
        },
        store,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE_YAML: &str = r#"
bind: 127.0.0.1:15001
upstream: 127.0.0.1:8080
identity:
  node_id: sidecar~10.0.0.1~app.ns
  cluster: app.ns
  labels:
    app: reviews
downstream:
  protocol: istio-peer-exchange
  negotiated_protocol: istio-peer-exchange
upstream_exchange:
  protocol: istio-peer-exchange
  enable_discovery: true
  additional_labels: ["team=payments"]
discovery:
  - network: 10.0.0.0/8
    labels:
      mesh: internal
"#;

    fn write_temp(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_yaml_config() {
        let file = write_temp(".yaml", SAMPLE_YAML);
        let config = load_config_file(file.path()).unwrap();

        assert_eq!(config.bind, Some("127.0.0.1:15001".parse().unwrap()));
        assert_eq!(config.identity.as_ref().unwrap().label("app"), Some("reviews"));
        assert_eq!(config.discovery.len(), 1);

        let (proxy, _store) = build_proxy_config(config).unwrap();
        assert_eq!(proxy.upstream_addr, "127.0.0.1:8080");
        assert_eq!(
            proxy.downstream.as_ref().unwrap().exchange.direction(),
            Direction::Downstream
        );
        let upstream = proxy.upstream.as_ref().unwrap();
        assert_eq!(upstream.exchange.direction(), Direction::Upstream);
        assert!(upstream.exchange.discovery_enabled());
        assert_eq!(upstream.negotiated_protocol, None);
    }

    #[test]
    fn test_load_json_config() {
        let file = write_temp(
            ".json",
            r#"{"bind":"127.0.0.1:1","upstream":"example:80","identity":{"node_id":"n","cluster":"c"}}"#,
        );
        let config = load_config_file(file.path()).unwrap();
        assert_eq!(config.upstream.as_deref(), Some("example:80"));
        assert!(config.downstream.is_none());
    }

    #[test]
    fn test_cli_overrides_file() {
        let file = write_temp(".yaml", SAMPLE_YAML);
        let config = load_config_file(file.path()).unwrap();

        let merged = merge(
            config,
            Overrides {
                upstream: Some("10.1.1.1:9000".to_string()),
                node_id: Some("override".to_string()),
                labels: vec!["version=v3".to_string()],
                upstream_protocol: Some("custom-exchange".to_string()),
                assume_negotiated: true,
                ..Default::default()
            },
        )
        .unwrap();

        assert_eq!(merged.upstream.as_deref(), Some("10.1.1.1:9000"));
        let identity = merged.identity.as_ref().unwrap();
        assert_eq!(identity.node_id, "override");
        assert_eq!(identity.cluster, "app.ns");
        assert_eq!(identity.label("app"), Some("reviews"));
        assert_eq!(identity.label("version"), Some("v3"));

        let upstream = merged.upstream_exchange.as_ref().unwrap();
        assert_eq!(upstream.exchange.protocol, "custom-exchange");
        assert_eq!(upstream.negotiated_protocol.as_deref(), Some("custom-exchange"));
        // The rest of the file's leg settings survive the protocol flag
        assert!(upstream.exchange.enable_discovery);
        assert_eq!(upstream.exchange.additional_labels, vec!["team=payments"]);
    }

    #[test]
    fn test_protocol_flag_creates_missing_leg() {
        let merged = merge(
            ConfigFile::default(),
            Overrides {
                downstream_protocol: Some("istio-peer-exchange".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let downstream = merged.downstream.as_ref().unwrap();
        assert_eq!(downstream.exchange.protocol, "istio-peer-exchange");
        assert!(!downstream.exchange.enable_discovery);
        assert_eq!(downstream.negotiated_protocol, None);
        assert!(merged.upstream_exchange.is_none());
    }

    #[test]
    fn test_protocol_flag_keeps_file_negotiation_without_assume() {
        let file = write_temp(".yaml", SAMPLE_YAML);
        let config = load_config_file(file.path()).unwrap();

        let merged = merge(
            config,
            Overrides {
                downstream_protocol: Some("istio-peer-exchange".to_string()),
                ..Default::default()
            },
        )
        .unwrap();

        let downstream = merged.downstream.as_ref().unwrap();
        assert_eq!(
            downstream.negotiated_protocol.as_deref(),
            Some("istio-peer-exchange")
        );
    }

    #[test]
    fn test_invalid_label_flag() {
        let result = merge(
            ConfigFile::default(),
            Overrides {
                labels: vec!["novalue".to_string()],
                ..Default::default()
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_node_id_rejected() {
        let config = ConfigFile {
            bind: Some("127.0.0.1:1".parse().unwrap()),
            upstream: Some("127.0.0.1:2".to_string()),
            ..Default::default()
        };
        assert!(build_proxy_config(config).is_err());
    }

    #[test]
    fn test_empty_protocol_rejected() {
        let config = ConfigFile {
            bind: Some("127.0.0.1:1".parse().unwrap()),
            upstream: Some("127.0.0.1:2".to_string()),
            identity: Some(NodeMetadata::new("n", "c")),
            downstream: Some(LegSettings {
                exchange: ExchangeSettings::new(""),
                negotiated_protocol: None,
            }),
            ..Default::default()
        };
        assert!(build_proxy_config(config).is_err());
    }
}
