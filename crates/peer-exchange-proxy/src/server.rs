//! Exchange Proxy Server Implementation
//!
//! Listens on a port and relays each connection to the configured upstream,
//! running the metadata exchange on the legs that have it configured.

use crate::config::ProxyConfig;
use crate::connection::{relay, RelayContext};
use peer_exchange_filter::{ConfigError, Direction, NodeMetadata};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Capacity of the peer metadata event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

const BIND_ATTEMPTS: u32 = 3;
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Failed to connect to upstream {address}: {reason}")]
    UpstreamConnectError { address: String, reason: String },

    #[error("Cannot listen on {address}:{port}: {reason} (is another relay or sidecar bound to it? pick a different --bind)")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}

impl ProxyError {
    fn bind(addr: SocketAddr, error: std::io::Error) -> Self {
        ProxyError::BindError {
            address: addr.ip().to_string(),
            port: addr.port(),
            reason: error.to_string(),
        }
    }
}

/// Peer metadata decoded on one leg of a relayed connection
#[derive(Debug, Clone)]
pub struct PeerMetadataEvent {
    pub connection_id: String,
    /// Leg the metadata arrived on
    pub leg: Direction,
    /// Address of the socket on that leg
    pub peer_addr: SocketAddr,
    pub metadata: NodeMetadata,
    pub received_at: chrono::DateTime<chrono::Utc>,
}

pub struct ExchangeProxy {
    config: ProxyConfig,
    events: broadcast::Sender<PeerMetadataEvent>,
}

impl ExchangeProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { config, events }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Receive peer metadata as connections complete their exchange
    pub fn subscribe(&self) -> broadcast::Receiver<PeerMetadataEvent> {
        self.events.subscribe()
    }

    /// Bind the listen address
    ///
    /// `AddrInUse` is retried `BIND_ATTEMPTS` times; sockets from a previous run
    /// can hold the port briefly.
    pub async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let addr = self.config.bind_addr;
        let mut last_error = std::io::Error::from(std::io::ErrorKind::AddrInUse);

        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    if attempt > 1 {
                        info!("Bound exchange listener {} after {} attempts", addr, attempt);
                    }
                    return Ok(listener);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    warn!(
                        "Exchange listener {} busy (attempt {}/{}): {}",
                        addr, attempt, BIND_ATTEMPTS, e
                    );
                    last_error = e;
                    if attempt < BIND_ATTEMPTS {
                        tokio::time::sleep(BIND_RETRY_DELAY).await;
                    }
                }
                Err(e) => return Err(ProxyError::bind(addr, e)),
            }
        }

        Err(ProxyError::bind(addr, last_error))
    }

    /// Bind and serve until the task is cancelled
    pub async fn start(self) -> Result<(), ProxyError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let addr = listener.local_addr()?;
        info!(
            "Exchange proxy listening on {} -> {} (downstream exchange: {}, upstream exchange: {})",
            addr,
            self.config.upstream_addr,
            self.config.downstream.is_some(),
            self.config.upstream.is_some()
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New TCP connection from {}", peer_addr);

                    let config = self.config.clone();
                    let events = self.events.clone();

                    tokio::spawn(async move {
                        if let Err(e) =
                            Self::handle_connection(stream, peer_addr, config, events).await
                        {
                            error!("Error handling TCP connection from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept TCP connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(
        client_stream: TcpStream,
        peer_addr: SocketAddr,
        config: ProxyConfig,
        events: broadcast::Sender<PeerMetadataEvent>,
    ) -> Result<(), ProxyError> {
        let upstream_stream = TcpStream::connect(&config.upstream_addr)
            .await
            .map_err(|e| ProxyError::UpstreamConnectError {
                address: config.upstream_addr.clone(),
                reason: e.to_string(),
            })?;
        let upstream_addr = upstream_stream.peer_addr()?;

        let _ = client_stream.set_nodelay(true);
        let _ = upstream_stream.set_nodelay(true);

        let ctx = RelayContext {
            connection_id: uuid::Uuid::new_v4().to_string(),
            events,
        };
        let connected_at = chrono::Utc::now();

        debug!(
            "Connection {} established: {} -> {}",
            ctx.connection_id, peer_addr, upstream_addr
        );

        let stats = relay(
            client_stream,
            peer_addr,
            upstream_stream,
            upstream_addr,
            config.downstream.as_ref(),
            config.upstream.as_ref(),
            &ctx,
        )
        .await?;

        let duration_ms = (chrono::Utc::now() - connected_at).num_milliseconds();
        debug!(
            "Connection {} closed after {}ms ({} bytes from client, {} bytes from upstream)",
            ctx.connection_id, duration_ms, stats.bytes_from_client, stats.bytes_from_upstream
        );

        Ok(())
    }
}
