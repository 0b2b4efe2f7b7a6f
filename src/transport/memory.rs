//! # In-Process Transport
//!
//! A [`MemoryNetwork`] routes connections between servers and clients living
//! in the same process. Each [`MemoryConnection`] is one end of a pair of
//! unbounded channels; disposing either end makes the other end's `receive`
//! fail with `ConnectionClosed`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::endpoint::EndPoint;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{ClientTransport, RawConnection, ServerTransport};

type Incoming = mpsc::UnboundedSender<MemoryConnection>;

/// Registry of in-process listeners.
#[derive(Default)]
pub struct MemoryNetwork {
    listeners: StdMutex<HashMap<EndPoint, Incoming>>,
    next_port: AtomicU16,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: StdMutex::new(HashMap::new()),
            next_port: AtomicU16::new(40000),
        })
    }

    /// A connected pair: `(a, b)` where `a` sees `b_endpoint` as its peer and
    /// `b` sees `a_endpoint`.
    pub fn pair(a_endpoint: EndPoint, b_endpoint: EndPoint) -> (MemoryConnection, MemoryConnection) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            MemoryConnection::new(b_endpoint, a_tx, a_rx),
            MemoryConnection::new(a_endpoint, b_tx, b_rx),
        )
    }

    fn register(&self, endpoint: &EndPoint, incoming: Incoming) -> Result<()> {
        let mut listeners = self
            .listeners
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        if listeners.contains_key(endpoint) {
            return Err(ProtocolError::TransportError(format!(
                "address already in use: {endpoint}"
            )));
        }
        listeners.insert(endpoint.clone(), incoming);
        Ok(())
    }

    fn unregister(&self, endpoint: &EndPoint) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.remove(endpoint);
        }
    }

    fn dial(&self, endpoint: &EndPoint) -> Result<MemoryConnection> {
        let listeners = self
            .listeners
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        let incoming = listeners
            .get(endpoint)
            .ok_or_else(|| ProtocolError::TransportError(constants::ERR_CONNECTION_REFUSED.into()))?;

        let local = EndPoint::new("memory", self.next_port.fetch_add(1, Ordering::Relaxed));
        let (client, server) = Self::pair(local, endpoint.clone());
        incoming
            .send(server)
            .map_err(|_| ProtocolError::TransportError(constants::ERR_CONNECTION_REFUSED.into()))?;
        Ok(client)
    }
}

/// One end of an in-process connection.
pub struct MemoryConnection {
    peer: EndPoint,
    outgoing: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    incoming: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    closed: CancellationToken,
}

impl MemoryConnection {
    fn new(
        peer: EndPoint,
        outgoing: mpsc::UnboundedSender<Bytes>,
        incoming: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            peer,
            outgoing: StdMutex::new(Some(outgoing)),
            incoming: Mutex::new(incoming),
            closed: CancellationToken::new(),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl RawConnection for MemoryConnection {
    fn endpoint(&self) -> EndPoint {
        self.peer.clone()
    }

    async fn send(&self, bytes: Bytes) -> Result<()> {
        let outgoing = self
            .outgoing
            .lock()
            .map_err(|_| ProtocolError::Custom(constants::ERR_LOCK_POISONED.into()))?;
        outgoing
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?
            .send(bytes)
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    async fn receive(&self) -> Result<Bytes> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(ProtocolError::ConnectionClosed),
            chunk = async { self.incoming.lock().await.recv().await } => {
                chunk.ok_or(ProtocolError::ConnectionClosed)
            }
        }
    }

    async fn dispose(&self) {
        self.closed.cancel();
        if let Ok(mut outgoing) = self.outgoing.lock() {
            if outgoing.take().is_some() {
                debug!(peer = %self.peer, "Memory connection disposed");
            }
        }
    }
}

/// Listening side bound to a [`MemoryNetwork`].
pub struct MemoryServerTransport {
    network: Arc<MemoryNetwork>,
    bound: StdMutex<Option<EndPoint>>,
    incoming: Mutex<Option<mpsc::UnboundedReceiver<MemoryConnection>>>,
}

impl MemoryServerTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self {
            network,
            bound: StdMutex::new(None),
            incoming: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ServerTransport for MemoryServerTransport {
    async fn open(&self, endpoint: &EndPoint) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.network.register(endpoint, tx)?;
        *self.incoming.lock().await = Some(rx);
        if let Ok(mut bound) = self.bound.lock() {
            *bound = Some(endpoint.clone());
        }
        info!(address = %endpoint, "Listening in memory");
        Ok(())
    }

    async fn wait_for_client(&self) -> Result<Box<dyn RawConnection>> {
        let mut guard = self.incoming.lock().await;
        let incoming = guard
            .as_mut()
            .ok_or_else(|| ProtocolError::TransportError(constants::ERR_TRANSPORT_NOT_OPEN.into()))?;
        let connection = incoming.recv().await.ok_or(ProtocolError::ConnectionClosed)?;
        Ok(Box::new(connection))
    }

    async fn close(&self) {
        let bound = self.bound.lock().ok().and_then(|mut bound| bound.take());
        if let Some(endpoint) = bound {
            self.network.unregister(&endpoint);
        }
        self.incoming.lock().await.take();
    }

    fn local_endpoint(&self) -> Option<EndPoint> {
        self.bound.lock().ok().and_then(|bound| bound.clone())
    }
}

/// Dialling side bound to a [`MemoryNetwork`].
pub struct MemoryClientTransport {
    network: Arc<MemoryNetwork>,
}

impl MemoryClientTransport {
    pub fn new(network: Arc<MemoryNetwork>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl ClientTransport for MemoryClientTransport {
    async fn connect(
        &self,
        name: &str,
        endpoint: &EndPoint,
        _timeout: Duration,
    ) -> Result<Box<dyn RawConnection>> {
        let connection = self.network.dial(endpoint)?;
        debug!(client = name, endpoint = %endpoint, "Memory connection established");
        Ok(Box::new(connection))
    }
}
