//! Workload identity record exchanged between proxies

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a proxy node: who it is, which cluster it runs in, and its labels.
///
/// Labels are kept in a `BTreeMap` so the encoded form is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    /// Node identifier (e.g. `sidecar~10.0.0.1~app.ns~ns.svc.cluster.local`)
    pub node_id: String,
    /// Cluster the node belongs to
    pub cluster: String,
    /// Workload labels
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeMetadata {
    pub fn new(node_id: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cluster: cluster.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Look up a label value
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}
