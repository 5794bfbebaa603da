//! Building the metadata record a connection advertises
//!
//! Additional labels come in two forms:
//! - `key=value` sets a static label
//! - `key` alone propagates that label from the local identity; it is skipped
//!   when the identity does not carry it

use peer_exchange_proto::NodeMetadata;
use std::collections::{BTreeMap, BTreeSet};

/// Split an additional label entry into key and optional static value
pub fn parse_label(entry: &str) -> (&str, Option<&str>) {
    match entry.split_once('=') {
        Some((key, value)) => (key.trim(), Some(value.trim())),
        None => (entry.trim(), None),
    }
}

/// Merge the local identity with discovered and configured labels
///
/// Precedence, lowest to highest: identity labels, labels discovered for the
/// peer's address, static `key=value` additional labels. The inputs are not
/// modified; each connection gets its own record.
pub fn merge_exchange_metadata(
    identity: &NodeMetadata,
    additional_labels: &BTreeSet<String>,
    discovered: Option<&BTreeMap<String, String>>,
) -> NodeMetadata {
    let mut merged = identity.clone();

    if let Some(discovered) = discovered {
        for (key, value) in discovered {
            merged.labels.insert(key.clone(), value.clone());
        }
    }

    for entry in additional_labels {
        let (key, value) = parse_label(entry);
        if key.is_empty() {
            continue;
        }

        match value {
            Some(value) => {
                merged.labels.insert(key.to_string(), value.to_string());
            }
            None => {
                if let Some(value) = identity.labels.get(key) {
                    merged.labels.insert(key.to_string(), value.clone());
                }
            }
        }
    }

    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(entries: &[&str]) -> BTreeSet<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label("app=foo"), ("app", Some("foo")));
        assert_eq!(parse_label("app"), ("app", None));
        assert_eq!(parse_label("a=b=c"), ("a", Some("b=c")));
        assert_eq!(parse_label(" app = foo "), ("app", Some("foo")));
    }

    #[test]
    fn test_static_label_is_added() {
        let identity = NodeMetadata::new("n1", "c1");
        let merged = merge_exchange_metadata(&identity, &labels(&["app=foo"]), None);

        assert_eq!(merged, NodeMetadata::new("n1", "c1").with_label("app", "foo"));
        // Inputs stay untouched
        assert!(identity.labels.is_empty());
    }

    #[test]
    fn test_bare_label_copies_identity_value() {
        let identity = NodeMetadata::new("n1", "c1").with_label("version", "v2");
        let merged = merge_exchange_metadata(&identity, &labels(&["version", "canary"]), None);

        assert_eq!(merged.label("version"), Some("v2"));
        // Not on the identity, so nothing to propagate
        assert_eq!(merged.label("canary"), None);
        assert_eq!(merged.labels.len(), 1);
    }

    #[test]
    fn test_bare_label_prefers_identity_over_discovered() {
        let identity = NodeMetadata::new("n1", "c1").with_label("zone", "us-east-1a");
        let mut discovered = BTreeMap::new();
        discovered.insert("zone".to_string(), "discovered".to_string());

        let merged = merge_exchange_metadata(&identity, &labels(&["zone"]), Some(&discovered));
        assert_eq!(merged.label("zone"), Some("us-east-1a"));
    }

    #[test]
    fn test_precedence() {
        let identity = NodeMetadata::new("n1", "c1")
            .with_label("app", "identity")
            .with_label("zone", "identity");
        let mut discovered = BTreeMap::new();
        discovered.insert("zone".to_string(), "discovered".to_string());
        discovered.insert("mesh".to_string(), "internal".to_string());

        let merged =
            merge_exchange_metadata(&identity, &labels(&["zone=static"]), Some(&discovered));

        assert_eq!(merged.label("app"), Some("identity"));
        assert_eq!(merged.label("mesh"), Some("internal"));
        assert_eq!(merged.label("zone"), Some("static"));
    }

    #[test]
    fn test_empty_key_is_skipped() {
        let identity = NodeMetadata::new("n1", "c1");
        let merged = merge_exchange_metadata(&identity, &labels(&["=oops", ""]), None);
        assert!(merged.labels.is_empty());
    }
}
