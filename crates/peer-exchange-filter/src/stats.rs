//! Exchange outcome counters
//!
//! Every connection that reaches a terminal state bumps exactly one of
//! `alpn_protocol_not_found`, `metadata_added` or `metadata_not_found`.
//! `alpn_protocol_found` and `initial_header_not_found` are informational and
//! never counted as an outcome.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Default prefix for all exchange counters
pub const DEFAULT_STAT_PREFIX: &str = "metadata_exchange.";

pub const ALPN_PROTOCOL_NOT_FOUND: &str = "alpn_protocol_not_found";
pub const ALPN_PROTOCOL_FOUND: &str = "alpn_protocol_found";
pub const INITIAL_HEADER_NOT_FOUND: &str = "initial_header_not_found";
pub const METADATA_ADDED: &str = "metadata_added";
pub const METADATA_NOT_FOUND: &str = "metadata_not_found";

/// Destination for counter increments, owned by the host
///
/// Called concurrently from every connection on a listener.
pub trait StatsSink: Send + Sync {
    fn increment(&self, name: &str);
}

/// In-process counter registry
#[derive(Debug, Default)]
pub struct CounterStore {
    counters: DashMap<String, AtomicU64>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter (0 if never incremented)
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Point-in-time copy of all counters, sorted by name
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect()
    }
}

impl StatsSink for CounterStore {
    fn increment(&self, name: &str) {
        if let Some(counter) = self.counters.get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Prefixed view over a [`StatsSink`] with one method per exchange outcome
#[derive(Clone)]
pub struct ExchangeStats {
    prefix: String,
    sink: Arc<dyn StatsSink>,
}

impl ExchangeStats {
    pub fn new(prefix: impl Into<String>, sink: Arc<dyn StatsSink>) -> Self {
        Self {
            prefix: prefix.into(),
            sink,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Same sink under a different prefix
    pub fn with_prefix(&self, prefix: impl Into<String>) -> Self {
        Self::new(prefix, self.sink.clone())
    }

    /// Full counter name for `name` under this prefix
    pub fn counter_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn alpn_protocol_not_found(&self) {
        self.bump(ALPN_PROTOCOL_NOT_FOUND);
    }

    pub fn alpn_protocol_found(&self) {
        self.bump(ALPN_PROTOCOL_FOUND);
    }

    pub fn initial_header_not_found(&self) {
        self.bump(INITIAL_HEADER_NOT_FOUND);
    }

    pub fn metadata_added(&self) {
        self.bump(METADATA_ADDED);
    }

    pub fn metadata_not_found(&self) {
        self.bump(METADATA_NOT_FOUND);
    }

    fn bump(&self, name: &str) {
        let full = self.counter_name(name);
        trace!("Incrementing counter {}", full);
        self.sink.increment(&full);
    }
}

impl Default for ExchangeStats {
    fn default() -> Self {
        Self::new(DEFAULT_STAT_PREFIX, Arc::new(CounterStore::new()))
    }
}

impl std::fmt::Debug for ExchangeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeStats")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
