//! Handshake steps and the token they talk through.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::endpoint::EndPoint;
use crate::core::message::{HeaderMessage, Mode};
use crate::error::{constants, ProtocolError, Result};
use crate::layer::Layer;
use crate::transport::RawConnection;

/// One stage of the pre-traffic negotiation.
///
/// Both ends run the same chain; each step branches on
/// [`HandshakeToken::mode`] to play its side.
#[async_trait]
pub trait Step: Send + Sync {
    /// Short name for diagnostics.
    fn name(&self) -> &'static str;

    /// Run this stage. `Some(layer)` replaces the active layer for the
    /// following steps and for normal traffic; `None` keeps it.
    async fn apply(&self, token: &mut HandshakeToken) -> Result<Option<Box<dyn Layer>>>;
}

/// Send/receive primitives bound to the raw transport and the active layer.
///
/// Handshake payloads travel as control frames (identifier 0).
pub struct HandshakeToken {
    raw: Arc<dyn RawConnection>,
    layer: Box<dyn Layer>,
    mode: Mode,
    max_payload: usize,
}

impl HandshakeToken {
    pub(crate) fn new(raw: Arc<dyn RawConnection>, layer: Box<dyn Layer>, mode: Mode) -> Self {
        Self {
            raw,
            layer,
            mode,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }

    /// Bound the active layer, and every layer switched in later, to
    /// `max_payload`.
    pub(crate) fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.layer.set_max_payload(max_payload);
        self.max_payload = max_payload;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Payload limit of the connection being negotiated.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    pub fn endpoint(&self) -> EndPoint {
        self.raw.endpoint()
    }

    /// Pack `payload` into a control frame with the active layer and send it.
    pub async fn send(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        let bytes = self.layer.pack(&HeaderMessage::control(payload))?;
        self.raw.send(bytes).await
    }

    /// Wait for the next control frame.
    ///
    /// Frames are decoded one at a time so bytes following the frame stay
    /// buffered for whichever layer is active next.
    pub async fn receive(&mut self) -> Result<Bytes> {
        loop {
            if let Some(frame) = self.layer.next_frame()? {
                if !frame.is_control() {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_UNEXPECTED_FRAME.into(),
                    ));
                }
                trace!(len = frame.payload.len(), "Handshake frame received");
                return Ok(frame.payload);
            }
            let chunk = self.raw.receive().await?;
            self.layer.feed(&chunk);
        }
    }

    /// Send a bincode-encoded value.
    pub async fn send_frame<T: Serialize + Sync>(&mut self, value: &T) -> Result<()> {
        let payload = bincode::serialize(value)?;
        self.send(payload).await
    }

    /// Receive and decode a bincode-encoded value.
    pub async fn receive_frame<T: DeserializeOwned>(&mut self) -> Result<T> {
        let payload = self.receive().await?;
        Ok(bincode::deserialize(&payload)?)
    }

    pub(crate) fn switch_layer(&mut self, mut next: Box<dyn Layer>) {
        next.set_max_payload(self.max_payload);
        let remainder = self.layer.take_buffer();
        if !remainder.is_empty() {
            next.feed(&remainder);
        }
        self.layer = next;
    }

    pub(crate) fn into_layer(self) -> Box<dyn Layer> {
        self.layer
    }
}
