//! Mutual challenge/response authentication.
//!
//! ```text
//! initiator                         responder
//!   Hello { challenge_i }      ->
//!                              <-   Reply { sign("responder" || challenge_i || challenge_r), challenge_r }
//!   Proof { sign("initiator" || challenge_r || challenge_i) } ->
//! ```
//!
//! Each side authenticates the other's signature over both challenges,
//! tagged with the signer's role, so a signature obtained on one connection
//! cannot be replayed on another or reflected back to its author.
//! The active layer is left unchanged.

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, warn};

use crate::core::message::Mode;
use crate::error::{constants, ProtocolError, Result};
use crate::layer::{HandshakeToken, Layer, Step};

type HmacSha256 = Hmac<Sha256>;

const TAG_SIZE: usize = 32;

const RESPONDER_TAG: &[u8] = b"responder";
const INITIATOR_TAG: &[u8] = b"initiator";

/// `role || verifier's challenge || signer's challenge`
fn transcript(role: &[u8], verifier: &[u8; 32], signer: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(role.len() + 64);
    data.extend_from_slice(role);
    data.extend_from_slice(verifier);
    data.extend_from_slice(signer);
    data
}

/// Signing primitive consumed by [`CertificateStep`].
pub trait Certificate: Send + Sync {
    /// Produce a signed envelope of `data`.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Verify an envelope produced by the peer's `sign` and return the
    /// original data.
    fn authenticate(&self, signed: &[u8]) -> Result<Vec<u8>>;
}

/// Pre-shared-key certificate: `data || HMAC-SHA256(key, data)`.
pub struct HmacCertificate {
    key: Vec<u8>,
}

impl HmacCertificate {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| ProtocolError::AuthenticationFailed(e.to_string()))
    }
}

impl Drop for HmacCertificate {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.key);
    }
}

impl Certificate for HmacCertificate {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut mac = self.mac()?;
        mac.update(data);
        let mut signed = data.to_vec();
        signed.extend_from_slice(&mac.finalize().into_bytes());
        Ok(signed)
    }

    fn authenticate(&self, signed: &[u8]) -> Result<Vec<u8>> {
        if signed.len() < TAG_SIZE {
            return Err(ProtocolError::AuthenticationFailed("signature truncated".into()));
        }
        let (data, tag) = signed.split_at(signed.len() - TAG_SIZE);
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(tag)
            .map_err(|_| ProtocolError::AuthenticationFailed("signature mismatch".into()))?;
        Ok(data.to_vec())
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum CertificateFrame {
    Hello { challenge: [u8; 32] },
    Reply { signed: Vec<u8>, challenge: [u8; 32] },
    Proof { signed: Vec<u8> },
}

fn unexpected(frame: CertificateFrame) -> ProtocolError {
    warn!(?frame, "Unexpected certificate frame");
    ProtocolError::HandshakeError(constants::ERR_UNEXPECTED_FRAME.into())
}

/// Authenticates both peers with a [`Certificate`].
pub struct CertificateStep<C> {
    certificate: C,
}

impl<C: Certificate> CertificateStep<C> {
    pub fn new(certificate: C) -> Self {
        Self { certificate }
    }

    fn check(&self, signed: &[u8], expected: &[u8]) -> Result<()> {
        if self.certificate.authenticate(signed)? != expected {
            return Err(ProtocolError::AuthenticationFailed(
                constants::ERR_CHALLENGE_MISMATCH.into(),
            ));
        }
        Ok(())
    }

    async fn initiate(&self, token: &mut HandshakeToken) -> Result<()> {
        let challenge: [u8; 32] = rand::random();
        token.send_frame(&CertificateFrame::Hello { challenge }).await?;

        let (signed, theirs) = match token.receive_frame().await? {
            CertificateFrame::Reply { signed, challenge } => (signed, challenge),
            other => return Err(unexpected(other)),
        };
        self.check(&signed, &transcript(RESPONDER_TAG, &challenge, &theirs))?;

        let proof = self
            .certificate
            .sign(&transcript(INITIATOR_TAG, &theirs, &challenge))?;
        token.send_frame(&CertificateFrame::Proof { signed: proof }).await
    }

    async fn respond(&self, token: &mut HandshakeToken) -> Result<()> {
        let theirs = match token.receive_frame().await? {
            CertificateFrame::Hello { challenge } => challenge,
            other => return Err(unexpected(other)),
        };

        let challenge: [u8; 32] = rand::random();
        let signed = self
            .certificate
            .sign(&transcript(RESPONDER_TAG, &theirs, &challenge))?;
        token
            .send_frame(&CertificateFrame::Reply { signed, challenge })
            .await?;

        match token.receive_frame().await? {
            CertificateFrame::Proof { signed } => {
                self.check(&signed, &transcript(INITIATOR_TAG, &challenge, &theirs))
            }
            other => Err(unexpected(other)),
        }
    }
}

#[async_trait]
impl<C: Certificate> Step for CertificateStep<C> {
    fn name(&self) -> &'static str {
        "certificate"
    }

    async fn apply(&self, token: &mut HandshakeToken) -> Result<Option<Box<dyn Layer>>> {
        match token.mode() {
            Mode::Initiator => self.initiate(token).await?,
            Mode::Responder => self.respond(token).await?,
        }
        debug!(peer = %token.endpoint(), "Peer authenticated");
        Ok(None)
    }
}
