//! # Server
//!
//! Lifecycle state machine plus the accept loop.
//!
//! ```text
//!   Closed --open--> Opened --close--> Closed --dispose--> Disposed
//! ```
//!
//! While Opened, two tasks run:
//! - the **accept loop** waits for peers, validates them and negotiates each
//!   one in its own task, then tracks the connection and publishes
//!   [`Event::NewClient`];
//! - the **watcher** subscribes to the event bus and untracks connections
//!   once they are lost, unstable or disposed.
//!
//! Accept and negotiation faults feed the server's instability counter.
//! When it saturates the accept loop stops and [`Event::ServerUnstable`] is
//! published once; the server stays Opened until someone calls `close()`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConnectionConfig, ServerConfig};
use crate::connection::{Connection, ConnectionContext, ConnectionId, MessageHandler};
use crate::core::endpoint::EndPoint;
use crate::core::message::Mode;
use crate::error::{constants, ProtocolError, Result};
use crate::events::{Event, EventBus};
use crate::layer::LayerFactory;
use crate::transport::{RawConnection, ServerTransport};
use crate::utils::healed_counter::HealedCounter;
use crate::utils::metrics::global_metrics;

/// Lifecycle state of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Closed,
    Opened,
    Disposed,
}

/// Requested lifecycle change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerTransition {
    Open,
    Close,
    Dispose,
}

impl ServerState {
    /// The state reached by applying `transition`, or `InvalidState`.
    pub fn transition(self, transition: ServerTransition) -> Result<ServerState> {
        use ServerState::*;
        use ServerTransition::*;

        match (self, transition) {
            (Closed, Open) => Ok(Opened),
            (Opened, Close) => Ok(Closed),
            (Closed, Dispose) => Ok(Disposed),
            (Closed, Close) | (Opened, Open) | (Opened, Dispose) | (Disposed, _) => {
                Err(ProtocolError::invalid_state("server", self, transition.to_string()))
            }
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Closed => f.write_str("closed"),
            ServerState::Opened => f.write_str("opened"),
            ServerState::Disposed => f.write_str("disposed"),
        }
    }
}

impl fmt::Display for ServerTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerTransition::Open => f.write_str("open"),
            ServerTransition::Close => f.write_str("close"),
            ServerTransition::Dispose => f.write_str("dispose"),
        }
    }
}

/// Decides whether an accepted peer may become a connection.
pub trait ClientValidator: Send + Sync {
    fn is_valid(&self, endpoint: &EndPoint) -> bool;
}

impl<F> ClientValidator for F
where
    F: Fn(&EndPoint) -> bool + Send + Sync,
{
    fn is_valid(&self, endpoint: &EndPoint) -> bool {
        self(endpoint)
    }
}

type Tracked = Arc<StdMutex<HashMap<ConnectionId, Arc<Connection>>>>;

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Server task ended abnormally");
        }
    }
}

struct Runtime {
    state: ServerState,
    accept: Option<Worker>,
    watcher: Option<Worker>,
}

/// Accepts peers over a [`ServerTransport`] and tracks their connections.
pub struct Server {
    config: Arc<ServerConfig>,
    connection_config: Arc<ConnectionConfig>,
    transport: Arc<dyn ServerTransport>,
    layers: LayerFactory,
    validator: Option<Arc<dyn ClientValidator>>,
    handler: Option<Arc<dyn MessageHandler>>,
    events: EventBus,
    runtime: Mutex<Runtime>,
    state: StdMutex<ServerState>,
    connections: Tracked,
}

impl Server {
    pub fn new(config: ServerConfig, transport: impl ServerTransport + 'static, layers: LayerFactory) -> Self {
        Self {
            connection_config: Arc::new(config.connection.clone()),
            config: Arc::new(config),
            transport: Arc::new(transport),
            layers,
            validator: None,
            handler: None,
            events: EventBus::default(),
            runtime: Mutex::new(Runtime {
                state: ServerState::Closed,
                accept: None,
                watcher: None,
            }),
            state: StdMutex::new(ServerState::Closed),
            connections: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn with_validator(mut self, validator: impl ClientValidator + 'static) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Handler for unsolicited messages on every accepted connection.
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

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn state(&self) -> ServerState {
        self.state.lock().map(|state| *state).unwrap_or(ServerState::Disposed)
    }

    /// The endpoint the transport actually bound, while Opened.
    pub fn local_endpoint(&self) -> Option<EndPoint> {
        self.transport.local_endpoint()
    }

    /// Snapshot of the tracked connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .map(|tracked| tracked.values().cloned().collect())
            .unwrap_or_default()
    }

    fn set_state(&self, runtime: &mut Runtime, state: ServerState) {
        runtime.state = state;
        if let Ok(mut mirror) = self.state.lock() {
            *mirror = state;
        }
    }

    /// Start listening. Valid only from Closed; on failure nothing changes.
    #[instrument(skip_all, fields(server = %self.config.name))]
    pub async fn open(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let next = runtime.state.transition(ServerTransition::Open)?;

        let endpoint = self.config.endpoint()?;
        self.transport.open(&endpoint).await?;

        // Subscribe before accepting so no lifecycle event is missed
        let watcher_cancel = CancellationToken::new();
        let watcher = Watcher {
            events: self.events.subscribe(),
            connections: Arc::clone(&self.connections),
            cancel: watcher_cancel.clone(),
        };
        runtime.watcher = Some(Worker {
            cancel: watcher_cancel,
            handle: tokio::spawn(watcher.run()),
        });

        let accept_cancel = CancellationToken::new();
        let counter = {
            let cancel = accept_cancel.clone();
            let events = self.events.clone();
            let server = self.config.name.clone();
            HealedCounter::from_config(format!("{server}/accept"), &self.config.instability, move || {
                warn!(server = %server, "Server unstable; accept loop stopping");
                cancel.cancel();
                events.publish(Event::ServerUnstable {
                    server: server.clone(),
                });
            })
        };
        let accept = AcceptLoop {
            server: self.config.name.clone(),
            transport: Arc::clone(&self.transport),
            layers: Arc::clone(&self.layers),
            validator: self.validator.clone(),
            handler: self.handler.clone(),
            events: self.events.clone(),
            connection_config: Arc::clone(&self.connection_config),
            connections: Arc::clone(&self.connections),
            cancel: accept_cancel.clone(),
            counter,
        };
        runtime.accept = Some(Worker {
            cancel: accept_cancel,
            handle: tokio::spawn(accept.run()),
        });

        self.set_state(&mut runtime, next);
        info!(address = %self.local_endpoint().unwrap_or(endpoint), "Server opened");
        Ok(())
    }

    /// Stop accepting and dispose every tracked connection. Valid only from
    /// Opened. Returns once both server tasks have finished.
    #[instrument(skip_all, fields(server = %self.config.name))]
    pub async fn close(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let next = runtime.state.transition(ServerTransition::Close)?;

        if let Some(accept) = runtime.accept.take() {
            accept.stop().await;
        }
        if let Some(watcher) = runtime.watcher.take() {
            watcher.stop().await;
        }
        self.transport.close().await;

        let drained: Vec<Arc<Connection>> = match self.connections.lock() {
            Ok(mut tracked) => tracked.drain().map(|(_, connection)| connection).collect(),
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        join_all(drained.iter().map(|connection| connection.dispose())).await;

        self.set_state(&mut runtime, next);
        self.events.publish(Event::ServerClosed {
            server: self.config.name.clone(),
        });
        info!(disposed = count, "Server closed");
        Ok(())
    }

    /// Release the transport. Valid only from Closed; irreversible.
    #[instrument(skip_all, fields(server = %self.config.name))]
    pub async fn dispose(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        let next = runtime.state.transition(ServerTransition::Dispose)?;
        self.transport.dispose().await;
        self.set_state(&mut runtime, next);
        info!("Server disposed");
        Ok(())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.name)
            .field("address", &self.config.address)
            .field("state", &self.state())
            .finish()
    }
}

struct Watcher {
    events: tokio::sync::broadcast::Receiver<Event>,
    connections: Tracked,
    cancel: CancellationToken,
}

impl Watcher {
    async fn run(mut self) {
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.events.recv() => received,
            };
            match received {
                Ok(
                    Event::ConnectionLost { connection, .. }
                    | Event::ConnectionUnstable { connection, .. }
                    | Event::ConnectionDisposed { connection, .. },
                ) => self.untrack(connection),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event watcher lagged; pruning disposed connections");
                    if let Ok(mut tracked) = self.connections.lock() {
                        tracked.retain(|_, connection| !connection.is_disposed());
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fn untrack(&self, id: ConnectionId) {
        let removed = self
            .connections
            .lock()
            .map(|mut tracked| tracked.remove(&id).is_some())
            .unwrap_or(false);
        if removed {
            debug!(connection = %id, "Connection untracked");
        }
    }
}

struct AcceptLoop {
    server: String,
    transport: Arc<dyn ServerTransport>,
    layers: LayerFactory,
    validator: Option<Arc<dyn ClientValidator>>,
    handler: Option<Arc<dyn MessageHandler>>,
    events: EventBus,
    connection_config: Arc<ConnectionConfig>,
    connections: Tracked,
    cancel: CancellationToken,
    counter: HealedCounter,
}

impl AcceptLoop {
    async fn run(self) {
        let mut negotiations: JoinSet<bool> = JoinSet::new();
        debug!(server = %self.server, "Accept loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(joined) = negotiations.join_next(), if !negotiations.is_empty() => {
                    self.settle(joined);
                }
                accepted = self.transport.wait_for_client() => match accepted {
                    Ok(raw) => self.admit(raw, &mut negotiations).await,
                    Err(e) => {
                        warn!(server = %self.server, error = %e, "Accept failed");
                        global_metrics().transport_fault();
                        self.counter.increment();
                    }
                },
            }
        }

        // Negotiations observe the same token and dispose their connection
        while let Some(joined) = negotiations.join_next().await {
            if let Err(e) = joined {
                warn!(server = %self.server, error = %e, "Negotiation task failed");
            }
        }
        self.counter.stop();
        debug!(server = %self.server, "Accept loop stopped");
    }

    fn settle(&self, joined: std::result::Result<bool, JoinError>) {
        match joined {
            Ok(false) => {}
            Ok(true) => {
                self.counter.increment();
            }
            Err(e) => {
                warn!(server = %self.server, error = %e, "Negotiation task failed");
                self.counter.increment();
            }
        }
    }

    async fn admit(&self, raw: Box<dyn RawConnection>, negotiations: &mut JoinSet<bool>) {
        let endpoint = raw.endpoint();
        if let Some(validator) = &self.validator {
            if !validator.is_valid(&endpoint) {
                info!(server = %self.server, peer = %endpoint, "Peer rejected by validator");
                global_metrics().validation_rejected();
                raw.dispose().await;
                return;
            }
        }

        let context = ConnectionContext::new(
            self.server.clone(),
            Arc::clone(&self.connection_config),
            self.events.clone(),
        )
        .with_handler(self.handler.clone());
        let connection = Connection::new(raw, Mode::Responder, (self.layers)(), context);

        negotiations.spawn(negotiate(
            self.server.clone(),
            connection,
            self.cancel.clone(),
            Arc::clone(&self.connections),
            self.events.clone(),
        ));
    }
}

/// Negotiate one accepted peer. Returns whether the attempt was a fault.
async fn negotiate(
    server: String,
    connection: Arc<Connection>,
    cancel: CancellationToken,
    connections: Tracked,
    events: EventBus,
) -> bool {
    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            connection.dispose().await;
            return false;
        }
        outcome = connection.initialise() => outcome,
    };

    match outcome {
        Ok(true) => {
            // A dispose that lands after this check publishes its event after
            // the insert, so the watcher still untracks the connection
            let tracked = match connections.lock() {
                Ok(mut tracked) if !cancel.is_cancelled() && !connection.is_disposed() => {
                    tracked.insert(connection.id(), Arc::clone(&connection));
                    true
                }
                Ok(_) => false,
                Err(_) => {
                    warn!(server = %server, "{}", constants::ERR_LOCK_POISONED);
                    false
                }
            };
            if !tracked {
                connection.dispose().await;
                return false;
            }

            info!(server = %server, connection = %connection.id(), peer = %connection.endpoint(), "New client");
            events.publish(Event::NewClient { server, connection });
            false
        }
        Ok(false) => {
            warn!(server = %server, peer = %connection.endpoint(), "Negotiation failed");
            connection.dispose().await;
            true
        }
        Err(e) => {
            warn!(server = %server, peer = %connection.endpoint(), error = %e, "Connection failed during negotiation");
            connection.dispose().await;
            true
        }
    }
}
