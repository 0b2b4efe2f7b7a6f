//! # Error Types
//!
//! Error handling for every layer of the framework.
//!
//! This module defines all error variants that can occur while framing,
//! negotiating, sending, receiving, and driving the server/client state
//! machines.
//!
//! ## Error Categories
//! - **Transport faults**: I/O errors, closed peers, failed accepts/connects
//! - **Framing errors**: Invalid headers, unsupported versions, oversized frames
//! - **Negotiation failures**: Handshake step errors, authentication, timeouts
//! - **Cryptographic errors**: Encryption/decryption failures
//! - **Misuse**: Operations attempted from an invalid lifecycle state
//!
//! Transport faults and framing errors are recovered locally by feeding an
//! instability counter; see [`ProtocolError::is_transport_fault`].
//!
//! ## Example Usage
//! ```rust
//! use peerwire::error::{ProtocolError, Result};
//!
//! fn parse_port(raw: &str) -> Result<u16> {
//!     raw.parse::<u16>()
//!         .map_err(|e| ProtocolError::ConfigError(format!("invalid port: {e}")))
//! }
//!
//! assert!(parse_port("9000").is_ok());
//! assert!(parse_port("ninety").is_err());
//! ```

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Synchronisation errors
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";

    /// Connection errors
    pub const ERR_CONNECTION_REFUSED: &str = "Connection refused";
    pub const ERR_TRANSPORT_NOT_OPEN: &str = "Transport is not open";
    pub const ERR_ALREADY_INITIALISED: &str = "Connection already initialised";

    /// Handshake-specific errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_UNEXPECTED_FRAME: &str = "Unexpected handshake frame";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "Server failed to verify client nonce";
    pub const ERR_SERVER_VERIFICATION_FAILED: &str = "Client failed to verify server nonce";
    pub const ERR_CHALLENGE_MISMATCH: &str = "Signed challenge does not match";
}

// ProtocolError is the primary error type for all framework operations
#[derive(Error, Debug, Serialize, Deserialize)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    #[serde(skip_serializing, skip_deserializing)]
    Serialization(#[from] bincode::Error),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Frame too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("{component} cannot {operation} while {state}")]
    InvalidState {
        component: String,
        state: String,
        operation: String,
    },

    #[error("Connection has not been initialised")]
    NotInitialised,

    #[error("Connection is disabled for sending")]
    ConnectionDisabled,

    #[error("Resource has been disposed")]
    Disposed,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Build an [`ProtocolError::InvalidState`] for a rejected lifecycle transition.
    pub fn invalid_state(
        component: impl Into<String>,
        state: impl std::fmt::Display,
        operation: impl Into<String>,
    ) -> Self {
        ProtocolError::InvalidState {
            component: component.into(),
            state: state.to_string(),
            operation: operation.into(),
        }
    }

    /// Whether this error originates at the raw transport boundary.
    ///
    /// Anything else raised during a handshake is a negotiation failure.
    pub fn is_transport_fault(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_) | ProtocolError::TransportError(_) | ProtocolError::ConnectionClosed
        )
    }

    /// Whether this error is a framing error produced by a layer.
    pub fn is_framing_error(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidHeader
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::OversizedPacket(_)
                | ProtocolError::DecryptionFailure
        )
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;
