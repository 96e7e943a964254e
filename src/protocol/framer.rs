//! Frame extraction from the inbound byte stream.
//!
//! The underlying channel may fragment or coalesce frames arbitrarily. The
//! framer peeks the length prefix, waits until the whole frame is buffered,
//! then splits it off and decodes it. A frame that fails to decode is
//! dropped and framing resumes at the next boundary.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::protocol::packet::{
    payload_length, InboundMessage, PacketDecoder, HEADER_SIZE, LENGTH_PREFIX_SIZE,
};

/// Turns a byte stream into application packets.
pub struct PacketFramer<R> {
    reader: R,
    buffer: BytesMut,
    decoder: Arc<dyn PacketDecoder>,
}

impl<R: AsyncRead + Unpin> PacketFramer<R> {
    /// Create a framer over `reader`.
    pub fn new(reader: R, decoder: Arc<dyn PacketDecoder>) -> Self {
        Self {
            reader,
            buffer: BytesMut::with_capacity(1024),
            decoder,
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the stream ends. A partial frame left in the
    /// buffer at end of stream is discarded.
    pub async fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if !self.fill_to(LENGTH_PREFIX_SIZE).await? {
            return Ok(None);
        }

        let total = payload_length(&self.buffer) as usize + HEADER_SIZE;
        if !self.fill_to(total).await? {
            return Ok(None);
        }

        Ok(Some(self.buffer.split_to(total).freeze()))
    }

    /// Read the next frame that decodes, skipping malformed ones.
    pub async fn next_packet(&mut self) -> Result<Option<InboundMessage>> {
        loop {
            let Some(raw) = self.next_frame().await? else {
                return Ok(None);
            };

            match self.decoder.decode(&raw) {
                Ok(packet) => {
                    trace!("Framed packet for {:?}: {} bytes", packet.endpoint, raw.len());
                    return Ok(Some(InboundMessage { packet, raw }));
                }
                Err(e) => {
                    debug!("Dropping malformed frame ({} bytes): {}", raw.len(), e);
                }
            }
        }
    }

    /// Publish packets to `tx` until the stream ends or fails.
    ///
    /// Does not retry; the caller decides what a closed stream means.
    pub async fn run(mut self, tx: broadcast::Sender<InboundMessage>) {
        loop {
            match self.next_packet().await {
                Ok(Some(message)) => {
                    // No receivers is fine, services may not have subscribed yet.
                    let _ = tx.send(message);
                }
                Ok(None) => {
                    debug!("Inbound byte stream ended");
                    break;
                }
                Err(e) => {
                    warn!("Inbound byte stream failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Buffer at least `needed` bytes. Returns false at end of stream.
    async fn fill_to(&mut self, needed: usize) -> Result<bool> {
        while self.buffer.len() < needed {
            self.buffer.reserve(needed - self.buffer.len());
            let read = self.reader.read_buf(&mut self.buffer).await?;
            if read == 0 {
                if !self.buffer.is_empty() {
                    debug!(
                        "Stream ended with {} bytes of partial frame",
                        self.buffer.len()
                    );
                }
                return Ok(false);
            }
        }
        Ok(true)
    }
}
