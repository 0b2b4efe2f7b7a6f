//! # Transport Layer
//!
//! Raw byte transports the framework runs on.
//!
//! The core never interprets transport errors as programmer errors: every
//! failure crossing this boundary is a fault that feeds an instability
//! counter.
//!
//! ## Implementations
//! - **TCP**: Tokio TCP listener and streams
//! - **Memory**: In-process transport for tests and embedding

pub mod memory;
pub mod tcp;

use crate::core::endpoint::EndPoint;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

/// One peer's raw byte pipe.
///
/// `send` and `receive` may run concurrently from different tasks.
/// `dispose` must interrupt any pending `receive`/`send` promptly.
#[async_trait]
pub trait RawConnection: Send + Sync {
    /// Remote peer identity.
    fn endpoint(&self) -> EndPoint;

    /// Write all of `bytes`.
    async fn send(&self, bytes: Bytes) -> Result<()>;

    /// Wait for the next chunk of bytes. Fails with
    /// [`ProtocolError::ConnectionClosed`](crate::error::ProtocolError::ConnectionClosed)
    /// once the peer has gone away or the connection was disposed.
    async fn receive(&self) -> Result<Bytes>;

    /// Release the underlying resource. Idempotent.
    async fn dispose(&self);
}

/// Listening side of a transport.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Start listening on `endpoint`.
    async fn open(&self, endpoint: &EndPoint) -> Result<()>;

    /// Wait for the next peer. Cancel-safe: dropping the future loses no peer.
    async fn wait_for_client(&self) -> Result<Box<dyn RawConnection>>;

    /// Stop listening. The transport may be opened again.
    async fn close(&self);

    /// Release everything. Called once, after the last `close`.
    async fn dispose(&self) {
        self.close().await;
    }

    /// The endpoint actually bound, when known.
    fn local_endpoint(&self) -> Option<EndPoint> {
        None
    }
}

/// Dialling side of a transport.
#[async_trait]
pub trait ClientTransport: Send + Sync {
    /// Connect to `endpoint`, giving up after `timeout`.
    async fn connect(
        &self,
        name: &str,
        endpoint: &EndPoint,
        timeout: Duration,
    ) -> Result<Box<dyn RawConnection>>;
}
