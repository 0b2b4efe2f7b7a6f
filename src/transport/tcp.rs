//! # TCP Transport
//!
//! Tokio TCP implementation of the transport traits.
//!
//! Each [`TcpRawConnection`] splits its stream so the receive loop and the
//! writer can run concurrently. Disposal cancels both halves.

use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::endpoint::EndPoint;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{ClientTransport, RawConnection, ServerTransport};
use crate::utils::timeout::with_timeout_error;

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// A connected TCP stream.
pub struct TcpRawConnection {
    endpoint: EndPoint,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: CancellationToken,
}

impl TcpRawConnection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        // Frames are small and latency-sensitive
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        Self {
            endpoint: EndPoint::from(peer),
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: CancellationToken::new(),
        }
    }

    async fn write_chunk(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        Ok(())
    }

    async fn read_chunk(&self) -> Result<Bytes> {
        let mut reader = self.reader.lock().await;
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        match reader.read_buf(&mut buf).await? {
            0 => Err(ProtocolError::ConnectionClosed),
            _ => Ok(buf.freeze()),
        }
    }
}

#[async_trait]
impl RawConnection for TcpRawConnection {
    fn endpoint(&self) -> EndPoint {
        self.endpoint.clone()
    }

    async fn send(&self, bytes: Bytes) -> Result<()> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = self.write_chunk(&bytes) => result,
        }
    }

    async fn receive(&self) -> Result<Bytes> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            result = self.read_chunk() => result,
        }
    }

    async fn dispose(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!(peer = %self.endpoint, "TCP connection disposed");
    }
}

/// Listening TCP socket.
#[derive(Default)]
pub struct TcpServerTransport {
    listener: Mutex<Option<TcpListener>>,
    local: StdMutex<Option<EndPoint>>,
}

impl TcpServerTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ServerTransport for TcpServerTransport {
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    async fn open(&self, endpoint: &EndPoint) -> Result<()> {
        let listener = TcpListener::bind(endpoint.to_string()).await?;
        let bound = EndPoint::from(listener.local_addr()?);
        info!(address = %bound, "Listening");

        if let Ok(mut local) = self.local.lock() {
            *local = Some(bound);
        }
        *self.listener.lock().await = Some(listener);
        Ok(())
    }

    async fn wait_for_client(&self) -> Result<Box<dyn RawConnection>> {
        let guard = self.listener.lock().await;
        let listener = guard
            .as_ref()
            .ok_or_else(|| ProtocolError::TransportError(constants::ERR_TRANSPORT_NOT_OPEN.into()))?;
        let (stream, peer) = listener.accept().await?;
        debug!(peer = %peer, "Accepted TCP peer");
        Ok(Box::new(TcpRawConnection::new(stream, peer)))
    }

    async fn close(&self) {
        if self.listener.lock().await.take().is_some() {
            info!("Listener closed");
        }
        if let Ok(mut local) = self.local.lock() {
            *local = None;
        }
    }

    fn local_endpoint(&self) -> Option<EndPoint> {
        self.local.lock().ok().and_then(|local| local.clone())
    }
}

/// Dials TCP endpoints.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpClientTransport;

#[async_trait]
impl ClientTransport for TcpClientTransport {
    #[instrument(skip_all, fields(client = name, endpoint = %endpoint))]
    async fn connect(
        &self,
        name: &str,
        endpoint: &EndPoint,
        timeout: Duration,
    ) -> Result<Box<dyn RawConnection>> {
        let stream = with_timeout_error(
            async {
                TcpStream::connect(endpoint.to_string())
                    .await
                    .map_err(ProtocolError::from)
            },
            timeout,
        )
        .await?;
        let peer = stream.peer_addr()?;
        debug!(peer = %peer, "TCP connection established");
        Ok(Box::new(TcpRawConnection::new(stream, peer)))
    }
}
