//! Address-based workload discovery
//!
//! When discovery is enabled, labels known for the peer's IP address are merged
//! into the metadata this proxy advertises on that connection.

use crate::config::ConfigError;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;
use tracing::trace;

/// Resolves labels for a peer address
pub trait WorkloadDiscovery: Send + Sync {
    fn lookup(&self, addr: &IpAddr) -> Option<BTreeMap<String, String>>;
}

/// One discovery rule as written in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    /// IP address or CIDR range (e.g. "10.0.0.0/8")
    pub network: String,
    /// Labels attached to peers in that range
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Discovery table keyed by network ranges
///
/// Rules are checked in insertion order and the first matching range wins.
#[derive(Debug, Clone, Default)]
pub struct NetworkDiscovery {
    rules: Vec<(IpNetwork, BTreeMap<String, String>)>,
}

impl NetworkDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: &[DiscoveryEntry]) -> Result<Self, ConfigError> {
        let mut discovery = Self::new();
        for entry in entries {
            discovery.insert(&entry.network, entry.labels.clone())?;
        }
        Ok(discovery)
    }

    /// Add a rule for an IP address or CIDR range
    pub fn insert(
        &mut self,
        network: &str,
        labels: BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        let parsed = IpNetwork::from_str(network).map_err(|e| ConfigError::InvalidNetwork {
            network: network.to_string(),
            reason: e.to_string(),
        })?;
        self.rules.push((parsed, labels));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl WorkloadDiscovery for NetworkDiscovery {
    fn lookup(&self, addr: &IpAddr) -> Option<BTreeMap<String, String>> {
        let found = self
            .rules
            .iter()
            .find(|(network, _)| network.contains(*addr))
            .map(|(_, labels)| labels.clone());

        trace!("Discovery lookup for {}: {:?}", addr, found.is_some());
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_lookup_by_cidr() {
        let mut discovery = NetworkDiscovery::new();
        discovery
            .insert("10.0.0.0/8", labels(&[("mesh", "internal")]))
            .unwrap();

        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert_eq!(discovery.lookup(&ip), Some(labels(&[("mesh", "internal")])));

        let outside: IpAddr = "192.168.1.1".parse().unwrap();
        assert_eq!(discovery.lookup(&outside), None);
    }

    #[test]
    fn test_first_match_wins() {
        let discovery = NetworkDiscovery::from_entries(&[
            DiscoveryEntry {
                network: "10.1.0.0/16".to_string(),
                labels: labels(&[("zone", "a")]),
            },
            DiscoveryEntry {
                network: "10.0.0.0/8".to_string(),
                labels: labels(&[("zone", "b")]),
            },
        ])
        .unwrap();

        let ip: IpAddr = "10.1.9.9".parse().unwrap();
        assert_eq!(discovery.lookup(&ip), Some(labels(&[("zone", "a")])));

        let ip: IpAddr = "10.2.9.9".parse().unwrap();
        assert_eq!(discovery.lookup(&ip), Some(labels(&[("zone", "b")])));
    }

    #[test]
    fn test_single_address_and_ipv6() {
        let mut discovery = NetworkDiscovery::new();
        discovery
            .insert("127.0.0.1", labels(&[("host", "loopback")]))
            .unwrap();
        discovery
            .insert("fd00::/8", labels(&[("net", "ula")]))
            .unwrap();
        assert_eq!(discovery.len(), 2);

        let v4: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(discovery.lookup(&v4).is_some());

        let v6: IpAddr = "fd00::1".parse().unwrap();
        assert_eq!(discovery.lookup(&v6), Some(labels(&[("net", "ula")])));
    }

    #[test]
    fn test_invalid_network() {
        let mut discovery = NetworkDiscovery::new();
        let result = discovery.insert("not-a-network", BTreeMap::new());
        assert!(matches!(result, Err(ConfigError::InvalidNetwork { .. })));
        assert!(discovery.is_empty());
    }
}
