//! Byte pump for one relayed connection
//!
//! Each relayed connection has two legs: the accepted client socket
//! (downstream) and the socket to the upstream. A leg optionally runs a
//! [`MetadataExchangeFilter`]. Both sockets are driven from a single task, so
//! every filter sees its events strictly in order.

use crate::config::LegConfig;
use crate::server::{PeerMetadataEvent, ProxyError};
use bytes::{Buf, Bytes, BytesMut};
use peer_exchange_filter::{
    ConnectionCallbacks, Direction, FilterStatus, MetadataExchangeFilter, NodeMetadata,
};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 8192;

/// Reads from a socket pause while this much is queued for the other one
const MAX_PENDING_WRITE: usize = 64 * 1024;

/// Host-side state the filter of one leg talks to
struct LegCallbacks {
    negotiated: Option<String>,
    remote: SocketAddr,
    injected: Vec<Bytes>,
    published: Option<NodeMetadata>,
    close_requested: bool,
}

impl ConnectionCallbacks for LegCallbacks {
    fn negotiated_protocol(&self) -> Option<&str> {
        self.negotiated.as_deref()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn inject_write(&mut self, data: Bytes) {
        self.injected.push(data);
    }

    fn publish_peer_metadata(&mut self, metadata: NodeMetadata) {
        self.published = Some(metadata);
    }

    fn close_connection(&mut self) {
        self.close_requested = true;
    }
}

/// One side of a relayed connection
struct Leg {
    direction: Direction,
    filter: Option<MetadataExchangeFilter>,
    callbacks: LegCallbacks,
}

impl Leg {
    fn new(direction: Direction, config: Option<&LegConfig>, remote: SocketAddr) -> Self {
        Self {
            direction,
            filter: config.map(|c| MetadataExchangeFilter::new(c.exchange.clone())),
            callbacks: LegCallbacks {
                negotiated: config.and_then(|c| c.negotiated_protocol.clone()),
                remote,
                injected: Vec::new(),
                published: None,
                close_requested: false,
            },
        }
    }

    fn on_connect(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            filter.on_new_connection(&mut self.callbacks);
        }
    }

    fn on_read(&mut self, data: &mut BytesMut, end_stream: bool) -> FilterStatus {
        match self.filter.as_mut() {
            Some(filter) => filter.on_data(data, end_stream, &mut self.callbacks),
            None => FilterStatus::Continue,
        }
    }

    fn on_write(&mut self, data: &mut BytesMut, end_stream: bool) {
        if let Some(filter) = self.filter.as_mut() {
            filter.on_write(data, end_stream, &mut self.callbacks);
        }
    }

    fn on_close(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            filter.on_close();
        }
        self.callbacks.injected.clear();
    }

    fn close_requested(&self) -> bool {
        self.callbacks.close_requested
    }

    fn take_published(&mut self) -> Option<NodeMetadata> {
        self.callbacks.published.take()
    }

    /// Queue bytes the filter injected toward this leg's peer
    fn flush_injected(&mut self, queue: &mut BytesMut) {
        for chunk in self.callbacks.injected.drain(..) {
            queue.extend_from_slice(&chunk);
        }
    }
}

/// Per-connection context shared with the server
pub(crate) struct RelayContext {
    pub connection_id: String,
    pub events: broadcast::Sender<PeerMetadataEvent>,
}

#[derive(Debug, Default)]
pub(crate) struct RelayStats {
    pub bytes_from_client: u64,
    pub bytes_from_upstream: u64,
}

/// Relay bytes between `client` and `upstream` until both directions are done
pub(crate) async fn relay(
    client: TcpStream,
    client_addr: SocketAddr,
    upstream: TcpStream,
    upstream_addr: SocketAddr,
    downstream_config: Option<&LegConfig>,
    upstream_config: Option<&LegConfig>,
    ctx: &RelayContext,
) -> Result<RelayStats, ProxyError> {
    let mut down = Leg::new(Direction::Downstream, downstream_config, client_addr);
    let mut up = Leg::new(Direction::Upstream, upstream_config, upstream_addr);
    let mut stats = RelayStats::default();

    let result = pump(client, upstream, &mut down, &mut up, &mut stats, ctx).await;

    down.on_close();
    up.on_close();

    result.map(|_| stats)
}

async fn pump(
    client: TcpStream,
    upstream: TcpStream,
    down: &mut Leg,
    up: &mut Leg,
    stats: &mut RelayStats,
    ctx: &RelayContext,
) -> Result<(), ProxyError> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    // Bytes accepted from one socket and not yet written to the other. Each
    // queue drains in its own select branch; reads never wait on a write.
    let mut to_client = BytesMut::new();
    let mut to_upstream = BytesMut::new();

    down.on_connect();
    up.on_connect();
    down.flush_injected(&mut to_client);
    up.flush_injected(&mut to_upstream);

    let mut client_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut upstream_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut client_open = true;
    let mut upstream_open = true;
    let mut client_write_open = true;
    let mut upstream_write_open = true;

    loop {
        // Propagate half-close once everything read before EOF is delivered
        if !client_open && upstream_write_open && to_upstream.is_empty() {
            let _ = upstream_write.shutdown().await;
            upstream_write_open = false;
        }
        if !upstream_open && client_write_open && to_client.is_empty() {
            let _ = client_write.shutdown().await;
            client_write_open = false;
        }
        if !client_open && !upstream_open && to_client.is_empty() && to_upstream.is_empty() {
            break;
        }

        client_buf.reserve(READ_BUFFER_SIZE);
        upstream_buf.reserve(READ_BUFFER_SIZE);

        tokio::select! {
            read = client_read.read_buf(&mut client_buf),
                if client_open && to_upstream.len() < MAX_PENDING_WRITE =>
            {
                let n = read?;
                let eof = n == 0;
                stats.bytes_from_client += n as u64;
                let mut data = client_buf.split();

                let status = down.on_read(&mut data, eof);
                announce(down, ctx);
                if down.close_requested() {
                    debug!("Closing connection {} on downstream leg request", ctx.connection_id);
                    return Ok(());
                }
                down.flush_injected(&mut to_client);

                if status == FilterStatus::Continue && !data.is_empty() {
                    up.on_write(&mut data, eof);
                    to_upstream.extend_from_slice(&data);
                }
                up.flush_injected(&mut to_upstream);

                if eof {
                    debug!("Client closed connection {}", ctx.connection_id);
                    client_open = false;
                }
            }
            read = upstream_read.read_buf(&mut upstream_buf),
                if upstream_open && to_client.len() < MAX_PENDING_WRITE =>
            {
                let n = read?;
                let eof = n == 0;
                stats.bytes_from_upstream += n as u64;
                let mut data = upstream_buf.split();

                let status = up.on_read(&mut data, eof);
                announce(up, ctx);
                if up.close_requested() {
                    debug!("Closing connection {} on upstream leg request", ctx.connection_id);
                    return Ok(());
                }
                up.flush_injected(&mut to_upstream);

                if status == FilterStatus::Continue && !data.is_empty() {
                    down.on_write(&mut data, eof);
                    to_client.extend_from_slice(&data);
                }
                down.flush_injected(&mut to_client);

                if eof {
                    debug!("Upstream closed connection {}", ctx.connection_id);
                    upstream_open = false;
                }
            }
            written = upstream_write.write(&to_upstream), if !to_upstream.is_empty() => {
                let n = written?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                to_upstream.advance(n);
            }
            written = client_write.write(&to_client), if !to_client.is_empty() => {
                let n = written?;
                if n == 0 {
                    return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
                }
                to_client.advance(n);
            }
        }
    }

    Ok(())
}

/// Broadcast peer metadata the leg's filter just published
fn announce(leg: &mut Leg, ctx: &RelayContext) {
    if let Some(metadata) = leg.take_published() {
        info!(
            "Connection {} {} peer: node {} in cluster {}",
            ctx.connection_id, leg.direction, metadata.node_id, metadata.cluster
        );
        // No subscribers is fine
        let _ = ctx.events.send(PeerMetadataEvent {
            connection_id: ctx.connection_id.clone(),
            leg: leg.direction,
            peer_addr: leg.callbacks.remote,
            metadata,
            received_at: chrono::Utc::now(),
        });
    }
}
