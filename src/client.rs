//! # Client
//!
//! Keeps one connection to a server alive.
//!
//! `connect()` starts a reconnection loop that dials, negotiates and then
//! waits for the connection to end. Failed attempts and dropped connections
//! feed the client's instability counter and, when automatic reconnection
//! is enabled, are retried after the configured delay. Saturating the
//! counter ends the loop as if `disconnect()` had been called.
//!
//! ## Example
//! ```rust,no_run
//! use peerwire::client::{Client, ClientStatus};
//! use peerwire::config::ClientConfig;
//! use peerwire::layer::LayerInitializer;
//! use peerwire::transport::tcp::TcpClientTransport;
//! use std::time::Duration;
//!
//! # async fn run() -> peerwire::error::Result<()> {
//! let client = Client::new(
//!     ClientConfig::default(),
//!     TcpClientTransport,
//!     LayerInitializer::factory(LayerInitializer::framed),
//! );
//! client.connect().await?;
//! client
//!     .wait_for_status(ClientStatus::Connected, Duration::from_secs(5))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ClientConfig, ConnectionConfig};
use crate::connection::{Connection, ConnectionContext, MessageHandler};
use crate::core::endpoint::EndPoint;
use crate::core::message::Mode;
use crate::error::{ProtocolError, Result};
use crate::events::EventBus;
use crate::layer::LayerFactory;
use crate::transport::ClientTransport;
use crate::utils::healed_counter::HealedCounter;
use crate::utils::timeout::with_timeout_error;

/// Observable connection state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientStatus::Disconnected => f.write_str("disconnected"),
            ClientStatus::Connecting => f.write_str("connecting"),
            ClientStatus::Connected => f.write_str("connected"),
        }
    }
}

type Slot = Arc<StdMutex<Option<Arc<Connection>>>>;

struct Session {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Runtime {
    session: Option<Session>,
    disposed: bool,
}

pub struct Client {
    config: Arc<ClientConfig>,
    connection_config: Arc<ConnectionConfig>,
    transport: Arc<dyn ClientTransport>,
    layers: LayerFactory,
    handler: Option<Arc<dyn MessageHandler>>,
    events: EventBus,
    status: Arc<watch::Sender<ClientStatus>>,
    current: Slot,
    runtime: Mutex<Runtime>,
}

impl Client {
    pub fn new(config: ClientConfig, transport: impl ClientTransport + 'static, layers: LayerFactory) -> Self {
        let (status, _) = watch::channel(ClientStatus::Disconnected);
        Self {
            connection_config: Arc::new(config.connection.clone()),
            config: Arc::new(config),
            transport: Arc::new(transport),
            layers,
            handler: None,
            events: EventBus::default(),
            status: Arc::new(status),
            current: Arc::new(StdMutex::new(None)),
            runtime: Mutex::new(Runtime::default()),
        }
    }

    /// Handler for unsolicited messages from the server.
    pub fn with_message_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ClientStatus> {
        self.status.subscribe()
    }

    /// The live connection, if currently connected.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.current.lock().ok().and_then(|current| current.clone())
    }

    /// Wait until the client reports `status`.
    pub async fn wait_for_status(&self, status: ClientStatus, timeout: Duration) -> Result<()> {
        let mut rx = self.status.subscribe();
        with_timeout_error(
            async move {
                rx.wait_for(|current| *current == status)
                    .await
                    .map(|_| ())
                    .map_err(|_| ProtocolError::Disposed)
            },
            timeout,
        )
        .await
    }

    /// Start connecting in the background. No-op while already connecting or
    /// connected.
    #[instrument(skip_all, fields(client = %self.config.name))]
    pub async fn connect(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.disposed {
            return Err(ProtocolError::invalid_state("client", "disposed", "connect"));
        }
        if let Some(session) = &runtime.session {
            if !session.handle.is_finished() {
                return Ok(());
            }
        }

        let cancel = CancellationToken::new();
        let attempt = Reconnect {
            endpoint: self.config.endpoint()?,
            config: Arc::clone(&self.config),
            connection_config: Arc::clone(&self.connection_config),
            transport: Arc::clone(&self.transport),
            layers: Arc::clone(&self.layers),
            handler: self.handler.clone(),
            events: self.events.clone(),
            status: Arc::clone(&self.status),
            current: Arc::clone(&self.current),
            cancel: cancel.clone(),
        };

        self.status.send_replace(ClientStatus::Connecting);
        runtime.session = Some(Session {
            cancel,
            handle: tokio::spawn(attempt.run()),
        });
        Ok(())
    }

    /// Drop the current connection and stop reconnecting. Returns once the
    /// reconnection loop has finished; `connect()` may be called again.
    #[instrument(skip_all, fields(client = %self.config.name))]
    pub async fn disconnect(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if let Some(session) = runtime.session.take() {
            session.cancel.cancel();
            if let Err(e) = session.handle.await {
                warn!(error = %e, "Reconnection loop ended abnormally");
            }
        }
        self.status.send_replace(ClientStatus::Disconnected);
        Ok(())
    }

    /// Disconnect for good. Later `connect()` calls fail.
    pub async fn dispose(&self) -> Result<()> {
        self.disconnect().await?;
        self.runtime.lock().await.disposed = true;
        info!(client = %self.config.name, "Client disposed");
        Ok(())
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.config.name)
            .field("address", &self.config.address)
            .field("status", &self.status())
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // The loop disposes its current connection on the way out
        if let Some(session) = self.runtime.get_mut().session.take() {
            session.cancel.cancel();
        }
    }
}

struct Reconnect {
    endpoint: EndPoint,
    config: Arc<ClientConfig>,
    connection_config: Arc<ConnectionConfig>,
    transport: Arc<dyn ClientTransport>,
    layers: LayerFactory,
    handler: Option<Arc<dyn MessageHandler>>,
    events: EventBus,
    status: Arc<watch::Sender<ClientStatus>>,
    current: Slot,
    cancel: CancellationToken,
}

impl Reconnect {
    async fn run(self) {
        let counter = {
            let cancel = self.cancel.clone();
            let name = self.config.name.clone();
            HealedCounter::from_config(format!("{name}/client"), &self.config.instability, move || {
                warn!(client = %name, "Client unstable; disconnecting");
                cancel.cancel();
            })
        };

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.status.send_replace(ClientStatus::Connecting);

            match self.establish().await {
                Ok(connection) => {
                    self.set_current(Some(Arc::clone(&connection)));
                    self.status.send_replace(ClientStatus::Connected);
                    info!(client = %self.config.name, connection = %connection.id(), "Connected");

                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = connection.closed() => {
                            warn!(client = %self.config.name, connection = %connection.id(), "Connection dropped");
                            self.set_current(None);
                            counter.increment();
                        }
                    }
                }
                Err(ProtocolError::Disposed) if self.cancel.is_cancelled() => break,
                Err(e) => {
                    warn!(client = %self.config.name, endpoint = %self.endpoint, error = %e, "Connection attempt failed");
                    counter.increment();
                }
            }

            if !self.config.automatic_reconnection {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnection_delay) => {}
            }
        }

        let current = self.current.lock().ok().and_then(|mut current| current.take());
        if let Some(connection) = current {
            connection.dispose().await;
        }
        counter.stop();
        self.status.send_replace(ClientStatus::Disconnected);
        debug!(client = %self.config.name, "Reconnection loop stopped");
    }

    fn set_current(&self, connection: Option<Arc<Connection>>) {
        if let Ok(mut current) = self.current.lock() {
            *current = connection;
        }
    }

    async fn establish(&self) -> Result<Arc<Connection>> {
        let raw = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ProtocolError::Disposed),
            raw = self.transport.connect(
                &self.config.name,
                &self.endpoint,
                self.connection_config.connection_timeout,
            ) => raw?,
        };

        let context = ConnectionContext::new(
            self.config.name.clone(),
            Arc::clone(&self.connection_config),
            self.events.clone(),
        )
        .with_handler(self.handler.clone());
        let connection = Connection::new(raw, Mode::Initiator, (self.layers)(), context);

        let initialised = tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Disposed),
            initialised = connection.initialise() => initialised,
        };
        match initialised {
            Ok(true) => Ok(connection),
            Ok(false) => {
                connection.dispose().await;
                Err(ProtocolError::HandshakeError("negotiation failed".into()))
            }
            Err(e) => {
                connection.dispose().await;
                Err(e)
            }
        }
    }
}
