//! XChaCha20-Poly1305 AEAD used by [`SecureLayer`](crate::layer::SecureLayer).

use crate::error::{ProtocolError, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

/// Nonce length for XChaCha20-Poly1305.
pub const NONCE_SIZE: usize = 24;

/// Authenticated cipher keyed with a 32-byte session key.
pub struct Crypto {
    cipher: XChaCha20Poly1305,
}

impl Crypto {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    /// Random nonce from the OS RNG. 24-byte nonces are safe to pick at random.
    pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
        let mut nonce = [0u8; NONCE_SIZE];
        getrandom::fill(&mut nonce)
            .map_err(|e| ProtocolError::Custom(format!("RNG failure: {e}")))?;
        Ok(nonce)
    }

    pub fn encrypt(&self, data: &[u8], aad: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        self.cipher
            .encrypt(XNonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| ProtocolError::EncryptionFailure)
    }

    pub fn decrypt(&self, data: &[u8], aad: &[u8], nonce: &[u8; NONCE_SIZE]) -> Result<Vec<u8>> {
        self.cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: data, aad })
            .map_err(|_| ProtocolError::DecryptionFailure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tampered_aad_fails() {
        let crypto = Crypto::new(&[7u8; 32]);
        let nonce = Crypto::generate_nonce().unwrap();
        let sealed = crypto.encrypt(b"secret", b"header", &nonce).unwrap();

        assert_eq!(crypto.decrypt(&sealed, b"header", &nonce).unwrap(), b"secret");
        assert!(matches!(
            crypto.decrypt(&sealed, b"other", &nonce),
            Err(ProtocolError::DecryptionFailure)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let nonce = Crypto::generate_nonce().unwrap();
        let sealed = Crypto::new(&[1u8; 32]).encrypt(b"data", b"", &nonce).unwrap();
        assert!(Crypto::new(&[2u8; 32]).decrypt(&sealed, b"", &nonce).is_err());
    }
}
