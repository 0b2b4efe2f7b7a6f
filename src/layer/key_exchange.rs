//! X25519 key agreement with timestamped nonces.
//!
//! ```text
//! initiator                                    responder
//!   Init { pub_i, nonce_i, timestamp }     ->
//!                                          <-  Response { pub_r, nonce_r, sha256(nonce_i) }
//!   Confirm { sha256(nonce_r) }            ->
//! ```
//!
//! Both sides derive `sha256(shared || "client_nonce" || nonce_i ||
//! "server_nonce" || nonce_r)` and switch to a [`SecureLayer`] keyed with it.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};
use x25519_dalek::{EphemeralSecret, PublicKey, SharedSecret};

use crate::core::message::Mode;
use crate::error::{constants, ProtocolError, Result};
use crate::layer::{HandshakeToken, Layer, SecureLayer, Step};

/// Maximum age of the initiator's timestamp.
pub const MAX_HANDSHAKE_AGE_SECS: u64 = 30;

/// Clock skew tolerated for timestamps from the future.
const FUTURE_TOLERANCE_MS: u64 = 2000;

#[derive(Debug, Serialize, Deserialize)]
enum KeyExchangeFrame {
    Init {
        pub_key: [u8; 32],
        nonce: [u8; 16],
        timestamp: u64,
    },
    Response {
        pub_key: [u8; 32],
        nonce: [u8; 16],
        nonce_verification: [u8; 32],
    },
    Confirm {
        nonce_verification: [u8; 32],
    },
}

fn current_timestamp() -> Result<u64> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .map_err(|_| ProtocolError::Custom(constants::ERR_SYSTEM_TIME.into()))
}

fn generate_nonce() -> [u8; 16] {
    let mut nonce = [0u8; 16];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Whether `timestamp` (ms since the epoch) is at most `max_age_seconds` old
/// and no more than two seconds in the future.
pub fn verify_timestamp(timestamp: u64, max_age_seconds: u64) -> bool {
    let Ok(current) = current_timestamp() else {
        return false;
    };

    if timestamp > current + FUTURE_TOLERANCE_MS {
        return false;
    }
    current.saturating_sub(timestamp) <= max_age_seconds * 1000
}

fn hash_nonce(nonce: &[u8]) -> [u8; 32] {
    Sha256::digest(nonce).into()
}

fn derive_session_key(shared: &SharedSecret, client_nonce: &[u8], server_nonce: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared.as_bytes());
    hasher.update(b"client_nonce");
    hasher.update(client_nonce);
    hasher.update(b"server_nonce");
    hasher.update(server_nonce);
    hasher.finalize().into()
}

fn unexpected(frame: KeyExchangeFrame) -> ProtocolError {
    warn!(?frame, "Unexpected key exchange frame");
    ProtocolError::HandshakeError(constants::ERR_UNEXPECTED_FRAME.into())
}

/// Negotiates a session key and installs a [`SecureLayer`].
///
/// The installed layer inherits the connection's payload limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyExchangeStep;

impl KeyExchangeStep {
    pub fn new() -> Self {
        Self
    }

    #[instrument(skip_all, fields(peer = %token.endpoint()))]
    async fn initiate(&self, token: &mut HandshakeToken) -> Result<[u8; 32]> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let client_nonce = generate_nonce();

        token
            .send_frame(&KeyExchangeFrame::Init {
                pub_key: public.to_bytes(),
                nonce: client_nonce,
                timestamp: current_timestamp()?,
            })
            .await?;

        let (server_public, server_nonce, verification) = match token.receive_frame().await? {
            KeyExchangeFrame::Response {
                pub_key,
                nonce,
                nonce_verification,
            } => (pub_key, nonce, nonce_verification),
            other => return Err(unexpected(other)),
        };

        if hash_nonce(&client_nonce) != verification {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_NONCE_VERIFICATION_FAILED.into(),
            ));
        }

        token
            .send_frame(&KeyExchangeFrame::Confirm {
                nonce_verification: hash_nonce(&server_nonce),
            })
            .await?;

        let shared = secret.diffie_hellman(&PublicKey::from(server_public));
        debug!("Initiator derived session key");
        Ok(derive_session_key(&shared, &client_nonce, &server_nonce))
    }

    #[instrument(skip_all, fields(peer = %token.endpoint()))]
    async fn respond(&self, token: &mut HandshakeToken) -> Result<[u8; 32]> {
        let (client_public, client_nonce) = match token.receive_frame().await? {
            KeyExchangeFrame::Init {
                pub_key,
                nonce,
                timestamp,
            } => {
                if !verify_timestamp(timestamp, MAX_HANDSHAKE_AGE_SECS) {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_INVALID_TIMESTAMP.into(),
                    ));
                }
                (pub_key, nonce)
            }
            other => return Err(unexpected(other)),
        };

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let server_nonce = generate_nonce();

        token
            .send_frame(&KeyExchangeFrame::Response {
                pub_key: public.to_bytes(),
                nonce: server_nonce,
                nonce_verification: hash_nonce(&client_nonce),
            })
            .await?;

        match token.receive_frame().await? {
            KeyExchangeFrame::Confirm { nonce_verification } => {
                if hash_nonce(&server_nonce) != nonce_verification {
                    return Err(ProtocolError::HandshakeError(
                        constants::ERR_SERVER_VERIFICATION_FAILED.into(),
                    ));
                }
            }
            other => return Err(unexpected(other)),
        }

        let shared = secret.diffie_hellman(&PublicKey::from(client_public));
        debug!("Responder derived session key");
        Ok(derive_session_key(&shared, &client_nonce, &server_nonce))
    }
}

#[async_trait]
impl Step for KeyExchangeStep {
    fn name(&self) -> &'static str {
        "key_exchange"
    }

    async fn apply(&self, token: &mut HandshakeToken) -> Result<Option<Box<dyn Layer>>> {
        let mut key = match token.mode() {
            Mode::Initiator => self.initiate(token).await?,
            Mode::Responder => self.respond(token).await?,
        };
        Ok(Some(Box::new(SecureLayer::new(&mut key, token.max_payload()))))
    }
}
