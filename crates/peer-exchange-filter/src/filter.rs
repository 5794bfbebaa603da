//! Per-connection metadata exchange state machine
//!
//! ```text
//! NotNegotiated ──► AwaitingPeerFrame ──► Completed
//!       │                  │
//!       └──────► Failed ◄──┘
//! ```
//!
//! The host calls [`MetadataExchangeFilter::on_new_connection`] once, then
//! [`on_data`](MetadataExchangeFilter::on_data) for every inbound buffer and
//! [`on_write`](MetadataExchangeFilter::on_write) for every outbound buffer, and
//! finally [`on_close`](MetadataExchangeFilter::on_close). Callbacks for one
//! connection are never concurrent, so the filter holds no locks.

use crate::config::{ExchangeConfig, WriteTiming};
use bytes::{Bytes, BytesMut};
use peer_exchange_proto::{DecodeResult, FrameCodec, NodeMetadata, HEADER_SIZE};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Exchange progress on one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// Negotiated protocol not checked yet
    NotNegotiated,
    /// Local frame scheduled, waiting for the peer's frame
    AwaitingPeerFrame,
    /// Peer metadata decoded and published
    Completed,
    /// Peer does not speak the exchange, sent a bad frame, or went away
    Failed,
}

impl ExchangePhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExchangePhase::Completed | ExchangePhase::Failed)
    }
}

/// What the host should do with the buffer after a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    /// Forward whatever is left in the buffer
    Continue,
    /// Nothing to forward yet
    StopIteration,
}

/// Connection services the host lends to the filter
pub trait ConnectionCallbacks {
    /// Application protocol negotiated for this connection (e.g. via ALPN)
    fn negotiated_protocol(&self) -> Option<&str>;

    /// Address of the other end of this connection, if known
    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    /// Write bytes to the peer ahead of any pending application bytes
    fn inject_write(&mut self, data: Bytes);

    /// Hand decoded peer metadata to later stages (telemetry, access logs)
    fn publish_peer_metadata(&mut self, metadata: NodeMetadata);

    /// Ask the host to tear the connection down
    fn close_connection(&mut self);
}

/// Metadata exchange filter for one connection leg
pub struct MetadataExchangeFilter {
    config: Arc<ExchangeConfig>,
    phase: ExchangePhase,
    /// Bytes of the peer frame received so far; never longer than `bytes_expected`
    partial: BytesMut,
    /// Total frame length once the header has been read
    bytes_expected: Option<usize>,
    /// Local frame held back until the first outbound buffer
    pending_frame: Option<Bytes>,
    peer_metadata: Option<NodeMetadata>,
}

impl MetadataExchangeFilter {
    pub fn new(config: Arc<ExchangeConfig>) -> Self {
        Self {
            config,
            phase: ExchangePhase::NotNegotiated,
            partial: BytesMut::new(),
            bytes_expected: None,
            pending_frame: None,
            peer_metadata: None,
        }
    }

    pub fn phase(&self) -> ExchangePhase {
        self.phase
    }

    /// Peer metadata, available once the exchange has completed
    pub fn peer_metadata(&self) -> Option<&NodeMetadata> {
        self.peer_metadata.as_ref()
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    /// Connection established: check negotiation and schedule the local frame
    ///
    /// Only the first call has any effect. `on_data` and `on_write` call this
    /// themselves if the host has not.
    pub fn on_new_connection(&mut self, callbacks: &mut dyn ConnectionCallbacks) {
        if self.phase != ExchangePhase::NotNegotiated {
            return;
        }

        let negotiated = callbacks.negotiated_protocol();
        if !self.config.matches_protocol(negotiated) {
            debug!(
                "Negotiated protocol {:?} does not match {}, skipping {} metadata exchange",
                negotiated,
                self.config.protocol(),
                self.config.direction()
            );
            self.phase = ExchangePhase::Failed;
            self.config.stats().alpn_protocol_not_found();
            return;
        }
        self.config.stats().alpn_protocol_found();

        let remote = callbacks.remote_address();
        let local = self.config.exchange_metadata(remote);
        let frame = match FrameCodec::encode(&local) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode local metadata: {}", e);
                self.fail();
                return;
            }
        };

        self.phase = ExchangePhase::AwaitingPeerFrame;

        match self.config.write_timing() {
            WriteTiming::OnConnect => {
                debug!(
                    "Writing local metadata frame ({} bytes) on connect to {:?}",
                    frame.len(),
                    remote
                );
                callbacks.inject_write(frame);
            }
            WriteTiming::OnFirstWrite => {
                trace!("Holding local metadata frame until first write");
                self.pending_frame = Some(frame);
            }
        }
    }

    /// Inbound bytes from the peer
    ///
    /// While the exchange is in progress the frame bytes are drained from `data`;
    /// anything after the frame is left in `data` for the next stage.
    pub fn on_data(
        &mut self,
        data: &mut BytesMut,
        end_stream: bool,
        callbacks: &mut dyn ConnectionCallbacks,
    ) -> FilterStatus {
        self.on_new_connection(callbacks);

        if self.phase != ExchangePhase::AwaitingPeerFrame {
            return FilterStatus::Continue;
        }

        loop {
            let wanted = match self.bytes_expected {
                Some(expected) => expected,
                None => HEADER_SIZE,
            };
            let take = (wanted - self.partial.len()).min(data.len());
            self.partial.extend_from_slice(&data.split_to(take));

            if self.partial.len() < wanted {
                break;
            }

            if self.bytes_expected.is_none() {
                match FrameCodec::frame_len(&self.partial) {
                    Ok(Some(total)) => {
                        trace!("Peer frame header read, expecting {} bytes", total);
                        self.bytes_expected = Some(total);
                        continue;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // The frame boundary is unknown, so nothing buffered can be
                        // forwarded safely
                        warn!("Rejecting peer metadata header: {}", e);
                        data.clear();
                        self.config.stats().initial_header_not_found();
                        self.fail();
                        callbacks.close_connection();
                        return FilterStatus::StopIteration;
                    }
                }
            }

            self.decode_frame(callbacks);
            break;
        }

        if self.phase == ExchangePhase::AwaitingPeerFrame {
            if end_stream {
                debug!("Connection ended before peer metadata arrived");
                self.fail();
                return FilterStatus::Continue;
            }
            return FilterStatus::StopIteration;
        }

        FilterStatus::Continue
    }

    /// Outbound bytes toward the peer
    ///
    /// With [`WriteTiming::OnFirstWrite`] the local frame is prepended to the
    /// first buffer, even if the peer's frame has already been consumed.
    pub fn on_write(
        &mut self,
        data: &mut BytesMut,
        _end_stream: bool,
        callbacks: &mut dyn ConnectionCallbacks,
    ) -> FilterStatus {
        self.on_new_connection(callbacks);

        if let Some(frame) = self.pending_frame.take() {
            debug!(
                "Writing local metadata frame ({} bytes) ahead of {} application bytes",
                frame.len(),
                data.len()
            );
            let mut out = BytesMut::with_capacity(frame.len() + data.len());
            out.extend_from_slice(&frame);
            out.extend_from_slice(data);
            *data = out;
        }

        FilterStatus::Continue
    }

    /// Connection closed by either side
    pub fn on_close(&mut self) {
        if !self.phase.is_terminal() {
            debug!(
                "Connection closed during {} metadata exchange ({} of {:?} bytes buffered)",
                self.config.direction(),
                self.partial.len(),
                self.bytes_expected
            );
            self.fail();
        }
        self.release();
    }

    fn decode_frame(&mut self, callbacks: &mut dyn ConnectionCallbacks) {
        match FrameCodec::try_decode(&self.partial) {
            DecodeResult::Decoded { metadata, consumed } => {
                info!(
                    "Received peer metadata from {} (cluster {}, {} labels, {} bytes)",
                    metadata.node_id,
                    metadata.cluster,
                    metadata.labels.len(),
                    consumed
                );
                self.phase = ExchangePhase::Completed;
                self.release_read_buffer();
                self.config.stats().metadata_added();
                self.peer_metadata = Some(metadata.clone());
                callbacks.publish_peer_metadata(metadata);
            }
            DecodeResult::Malformed { consumed, reason } => {
                warn!(
                    "Discarding malformed peer metadata frame ({} bytes): {}",
                    consumed, reason
                );
                self.fail();
            }
            other => {
                // Only reachable if the buffered length and the header disagree
                warn!("Unexpected decode result for a full frame: {:?}", other);
                self.fail();
            }
        }
    }

    fn fail(&mut self) {
        self.phase = ExchangePhase::Failed;
        self.config.stats().metadata_not_found();
        self.release();
    }

    fn release(&mut self) {
        self.release_read_buffer();
        if self.phase == ExchangePhase::Failed {
            self.pending_frame = None;
        }
    }

    fn release_read_buffer(&mut self) {
        self.partial = BytesMut::new();
        self.bytes_expected = None;
    }
}

impl std::fmt::Debug for MetadataExchangeFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataExchangeFilter")
            .field("direction", &self.config.direction())
            .field("phase", &self.phase)
            .field("buffered", &self.partial.len())
            .field("bytes_expected", &self.bytes_expected)
            .field("pending_frame", &self.pending_frame.is_some())
            .finish()
    }
}
