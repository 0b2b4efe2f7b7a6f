//! Encrypted framing.
//!
//! Frames keep the plain header so boundaries can be found without the key.
//! The payload becomes `nonce(24) || ciphertext`, with the identifier and
//! request id bound as associated data so a frame cannot be replayed under a
//! different header.

use bytes::{Bytes, BytesMut};
use zeroize::Zeroize;

use crate::core::message::HeaderMessage;
use crate::error::{ProtocolError, Result};
use crate::layer::{FramedLayer, Layer};
use crate::utils::crypto::{Crypto, NONCE_SIZE};

pub struct SecureLayer {
    framing: FramedLayer,
    crypto: Crypto,
}

impl SecureLayer {
    /// Build from a 32-byte session key. The caller's copy is wiped.
    pub fn new(key: &mut [u8; 32], max_payload: usize) -> Self {
        let crypto = Crypto::new(key);
        key.zeroize();
        Self {
            framing: FramedLayer::new(max_payload),
            crypto,
        }
    }
}

fn associated_data(identifier: u64, request_id: u64) -> [u8; 16] {
    let mut aad = [0u8; 16];
    aad[..8].copy_from_slice(&identifier.to_be_bytes());
    aad[8..].copy_from_slice(&request_id.to_be_bytes());
    aad
}

impl Layer for SecureLayer {
    fn pack(&mut self, frame: &HeaderMessage) -> Result<Bytes> {
        let nonce = Crypto::generate_nonce()?;
        let aad = associated_data(frame.identifier, frame.wire_request_id());
        let sealed = self.crypto.encrypt(&frame.payload, &aad, &nonce)?;

        let mut payload = BytesMut::with_capacity(NONCE_SIZE + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);

        self.framing.pack(&HeaderMessage {
            identifier: frame.identifier,
            request_id: frame.request_id,
            payload: payload.freeze(),
        })
    }

    fn feed(&mut self, bytes: &[u8]) {
        self.framing.feed(bytes);
    }

    fn next_frame(&mut self) -> Result<Option<HeaderMessage>> {
        let Some(frame) = self.framing.next_frame()? else {
            return Ok(None);
        };
        if frame.payload.len() < NONCE_SIZE {
            return Err(ProtocolError::DecryptionFailure);
        }

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&frame.payload[..NONCE_SIZE]);
        let aad = associated_data(frame.identifier, frame.wire_request_id());
        let plain = self
            .crypto
            .decrypt(&frame.payload[NONCE_SIZE..], &aad, &nonce)?;

        Ok(Some(HeaderMessage {
            identifier: frame.identifier,
            request_id: frame.request_id,
            payload: Bytes::from(plain),
        }))
    }

    fn take_buffer(&mut self) -> BytesMut {
        self.framing.take_buffer()
    }

    fn set_max_payload(&mut self, max_payload: usize) {
        self.framing.set_max_payload(max_payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_PAYLOAD_SIZE;

    fn layer(key: u8) -> SecureLayer {
        SecureLayer::new(&mut [key; 32], MAX_PAYLOAD_SIZE)
    }

    #[test]
    fn test_matching_keys_unpack() {
        let frame = HeaderMessage::new(9, Some(4), &b"secret payload"[..]);
        let bytes = layer(1).pack(&frame).unwrap();
        assert!(!bytes.windows(14).any(|w| w == b"secret payload"));
        assert_eq!(layer(1).unpack(&bytes).unwrap(), vec![frame]);
    }

    #[test]
    fn test_wrong_key_fails() {
        let bytes = layer(1)
            .pack(&HeaderMessage::new(1, None, &b"x"[..]))
            .unwrap();
        assert!(matches!(
            layer(2).unpack(&bytes),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_rewritten_header_fails() {
        let mut bytes = layer(1)
            .pack(&HeaderMessage::new(1, None, &b"x"[..]))
            .unwrap()
            .to_vec();
        // identifier occupies bytes 5..13
        bytes[12] = 3;
        assert!(layer(1).unpack(&bytes).is_err());
    }

    #[test]
    fn test_key_is_wiped() {
        let mut key = [5u8; 32];
        let _layer = SecureLayer::new(&mut key, MAX_PAYLOAD_SIZE);
        assert_eq!(key, [0u8; 32]);
    }
}
