//! # Layer Pipeline
//!
//! A [`Layer`] turns [`HeaderMessage`]s into self-delimiting frames and back.
//! Every connection owns exactly one active layer, produced by a
//! [`LayerInitializer`]: a starting layer plus an ordered chain of handshake
//! [`Step`]s that may replace it before normal traffic flows.
//!
//! ## Components
//! - **FramedLayer**: Plain framing with [`FrameCodec`]
//! - **SecureLayer**: Framing with an XChaCha20-Poly1305 sealed payload
//! - **Steps**: [`CertificateStep`] (mutual authentication) and
//!   [`KeyExchangeStep`] (X25519 key agreement, installs a `SecureLayer`)
//!
//! ## Example
//! ```rust
//! use peerwire::layer::{CertificateStep, HmacCertificate, KeyExchangeStep, LayerInitializer};
//! use std::sync::Arc;
//!
//! let factory = LayerInitializer::factory(|| {
//!     LayerInitializer::framed()
//!         .with_step(CertificateStep::new(HmacCertificate::new(b"shared secret".to_vec())))
//!         .with_step(KeyExchangeStep::default())
//! });
//! assert_eq!(factory().step_count(), 2);
//! ```

pub mod certificate;
pub mod key_exchange;
pub mod secure;
pub mod step;

pub use certificate::{Certificate, CertificateStep, HmacCertificate};
pub use key_exchange::KeyExchangeStep;
pub use secure::SecureLayer;
pub use step::{HandshakeToken, Step};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

use crate::core::codec::FrameCodec;
use crate::core::message::{HeaderMessage, Mode};
use crate::error::Result;
use crate::transport::RawConnection;
use crate::utils::timeout::with_timeout_error;

/// Framing of messages over a byte stream.
///
/// Implementations buffer incomplete trailing bytes between calls. A framing
/// error discards whatever was buffered; the caller decides whether that is
/// a fault.
pub trait Layer: Send {
    /// Serialize one message into a complete frame.
    fn pack(&mut self, frame: &HeaderMessage) -> Result<Bytes>;

    /// Append received bytes to the internal buffer.
    fn feed(&mut self, bytes: &[u8]);

    /// Decode the next complete frame from the buffer, if any.
    fn next_frame(&mut self) -> Result<Option<HeaderMessage>>;

    /// Hand over every buffered, not yet decoded byte.
    fn take_buffer(&mut self) -> BytesMut;

    /// Bound the payload size this layer packs and accepts from now on.
    fn set_max_payload(&mut self, max_payload: usize);

    /// Feed `bytes` and return every frame that is now complete.
    fn unpack(&mut self, bytes: &[u8]) -> Result<Vec<HeaderMessage>> {
        self.feed(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// Plain length-prefixed framing.
#[derive(Debug, Default)]
pub struct FramedLayer {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FramedLayer {
    pub fn new(max_payload: usize) -> Self {
        Self {
            codec: FrameCodec::new(max_payload),
            buffer: BytesMut::new(),
        }
    }

    /// Bytes buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Layer for FramedLayer {
    fn pack(&mut self, frame: &HeaderMessage) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.codec.encode(frame, &mut dst)?;
        Ok(dst.freeze())
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    fn next_frame(&mut self) -> Result<Option<HeaderMessage>> {
        match self.codec.decode(&mut self.buffer) {
            Err(e) => {
                self.buffer.clear();
                Err(e)
            }
            decoded => decoded,
        }
    }

    fn take_buffer(&mut self) -> BytesMut {
        self.buffer.split()
    }

    fn set_max_payload(&mut self, max_payload: usize) {
        self.codec = FrameCodec::new(max_payload);
    }
}

/// Produces a fresh [`LayerInitializer`] for every new connection.
pub type LayerFactory = Arc<dyn Fn() -> LayerInitializer + Send + Sync>;

/// Starting layer plus the handshake steps to run on top of it.
pub struct LayerInitializer {
    layer: Box<dyn Layer>,
    steps: Vec<Box<dyn Step>>,
}

impl LayerInitializer {
    pub fn new(layer: impl Layer + 'static) -> Self {
        Self {
            layer: Box::new(layer),
            steps: Vec::new(),
        }
    }

    /// A [`FramedLayer`] and no steps.
    pub fn framed() -> Self {
        Self::new(FramedLayer::default())
    }

    /// Append a step to the chain.
    pub fn with_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Wrap a closure into a [`LayerFactory`].
    pub fn factory<F>(make: F) -> LayerFactory
    where
        F: Fn() -> LayerInitializer + Send + Sync + 'static,
    {
        Arc::new(make)
    }

    /// Run every step against `raw`, sharing one `budget` across the chain.
    ///
    /// Every layer in the chain, the starting one included, is bounded to
    /// `max_payload`. Returns the layer to use for normal traffic. Bytes the
    /// peer sent after its last handshake frame are already buffered in it.
    pub async fn negotiate(
        self,
        raw: Arc<dyn RawConnection>,
        mode: Mode,
        budget: Duration,
        max_payload: usize,
    ) -> Result<Box<dyn Layer>> {
        let LayerInitializer { layer, steps } = self;
        let mut token = HandshakeToken::new(raw, layer, mode).with_max_payload(max_payload);

        with_timeout_error(
            async move {
                for step in &steps {
                    debug!(step = step.name(), mode = %mode, "Applying handshake step");
                    if let Some(next) = step.apply(&mut token).await? {
                        token.switch_layer(next);
                    }
                }
                Ok(token.into_layer())
            },
            budget,
        )
        .await
    }
}

impl Default for LayerInitializer {
    fn default() -> Self {
        Self::framed()
    }
}

impl fmt::Debug for LayerInitializer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerInitializer")
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_unpack_concatenated_and_partial() {
        let mut sender = FramedLayer::default();
        let first = HeaderMessage::new(1, None, &b"first"[..]);
        let second = HeaderMessage::new(3, Some(2), &b"second"[..]);

        let mut stream = sender.pack(&first).unwrap().to_vec();
        let second_bytes = sender.pack(&second).unwrap();
        stream.extend_from_slice(&second_bytes[..7]);

        let mut receiver = FramedLayer::default();
        assert_eq!(receiver.unpack(&stream).unwrap(), vec![first]);
        assert_eq!(receiver.buffered(), 7);
        assert_eq!(receiver.unpack(&second_bytes[7..]).unwrap(), vec![second]);
        assert_eq!(receiver.buffered(), 0);
    }

    #[test]
    fn test_framing_error_discards_buffer() {
        let mut layer = FramedLayer::default();
        assert!(matches!(
            layer.unpack(b"garbage bytes"),
            Err(ProtocolError::InvalidHeader)
        ));
        assert_eq!(layer.buffered(), 0);

        let frame = HeaderMessage::new(5, None, &b"ok"[..]);
        let bytes = FramedLayer::default().pack(&frame).unwrap();
        assert_eq!(layer.unpack(&bytes).unwrap(), vec![frame]);
    }

    #[test]
    fn test_take_buffer_hands_over_remainder() {
        let frame = HeaderMessage::new(7, None, &b"later"[..]);
        let bytes = FramedLayer::default().pack(&frame).unwrap();

        let mut old = FramedLayer::default();
        old.feed(&bytes[..10]);
        let rest = old.take_buffer();
        assert_eq!(old.buffered(), 0);

        let mut new = FramedLayer::default();
        new.feed(&rest);
        assert_eq!(new.unpack(&bytes[10..]).unwrap(), vec![frame]);
    }

    #[test]
    fn test_initializer_counts_steps() {
        let init = LayerInitializer::framed().with_step(KeyExchangeStep::default());
        assert_eq!(init.step_count(), 1);
        assert!(format!("{init:?}").contains("key_exchange"));
    }
}
