//! Metadata Exchange TCP Proxy
//!
//! This crate implements a TCP relay that forwards every accepted connection to a
//! fixed upstream address and runs the peer metadata exchange on either leg:
//! the accepted (downstream) socket, the upstream socket, or both.
//!
//! Peer metadata decoded on a leg is announced on a broadcast channel
//! (see [`ExchangeProxy::subscribe`]).

mod config;
mod connection;
mod server;

pub use config::{LegConfig, LegSettings, ProxyConfig};
pub use server::{ExchangeProxy, PeerMetadataEvent, ProxyError};
