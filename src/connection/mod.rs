//! # Connection
//!
//! One peer's transport plus its active [`Layer`].
//!
//! ## Lifecycle
//! 1. Created by the server accept loop ([`Mode::Responder`]) or by a client
//!    ([`Mode::Initiator`]).
//! 2. [`Connection::initialise`] runs the handshake chain and starts the
//!    receive and writer tasks.
//! 3. `send`, `answer` and `send_with_callback` are usable while enabled.
//! 4. Disposal is terminal. It is triggered by [`Connection::dispose`], by
//!    the peer closing the transport, or by the instability counter
//!    saturating, whichever happens first.
//!
//! ## Events
//! | Cause | Published |
//! |---|---|
//! | `dispose()` | `ConnectionDisposed` |
//! | peer closed | `ConnectionLost`, `ConnectionDisposed` |
//! | saturation | `ConnectionUnstable`, `ConnectionDisposed` |

pub mod callback;

pub use callback::{Callback, CallbackOutcome, CallbackTable};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::ConnectionConfig;
use crate::core::endpoint::EndPoint;
use crate::core::message::{HeaderMessage, IdAllocator, Message, MessageId, Mode};
use crate::error::{constants, ProtocolError, Result};
use crate::events::{Event, EventBus};
use crate::layer::{Layer, LayerInitializer};
use crate::transport::RawConnection;
use crate::utils::healed_counter::HealedCounter;
use crate::utils::metrics::global_metrics;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-wide unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Receives every incoming message that is not an awaited answer.
///
/// Runs on the connection's receive task; long work should be spawned.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, connection: &Arc<Connection>, message: HeaderMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&Arc<Connection>, HeaderMessage) + Send + Sync,
{
    fn handle(&self, connection: &Arc<Connection>, message: HeaderMessage) {
        self(connection, message)
    }
}

/// What a connection borrows from its owner.
#[derive(Clone)]
pub struct ConnectionContext {
    pub name: String,
    pub config: Arc<ConnectionConfig>,
    pub events: EventBus,
    pub handler: Option<Arc<dyn MessageHandler>>,
}

impl ConnectionContext {
    pub fn new(name: impl Into<String>, config: Arc<ConnectionConfig>, events: EventBus) -> Self {
        Self {
            name: name.into(),
            config,
            events,
            handler: None,
        }
    }

    pub fn with_handler(mut self, handler: Option<Arc<dyn MessageHandler>>) -> Self {
        self.handler = handler;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DisposeReason {
    Requested,
    Lost,
    Unstable,
}

fn poisoned<T>(_: T) -> ProtocolError {
    ProtocolError::Custom(constants::ERR_LOCK_POISONED.into())
}

pub struct Connection {
    id: ConnectionId,
    name: String,
    endpoint: EndPoint,
    mode: Mode,
    raw: Arc<dyn RawConnection>,
    config: Arc<ConnectionConfig>,
    events: EventBus,
    handler: Option<Arc<dyn MessageHandler>>,
    ids: IdAllocator,
    initializer: Mutex<Option<LayerInitializer>>,
    layer: Mutex<Option<Box<dyn Layer>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    callbacks: CallbackTable,
    counter: HealedCounter,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialised: AtomicBool,
    enabled: AtomicBool,
    disposed: AtomicBool,
    unstable: AtomicBool,
    // Stops the receive and writer tasks
    cancel: CancellationToken,
    // Fires once disposal has completed
    closed: CancellationToken,
}

impl Connection {
    /// Wrap `raw`. Must be called within a Tokio runtime.
    pub fn new(
        raw: Box<dyn RawConnection>,
        mode: Mode,
        initializer: LayerInitializer,
        context: ConnectionContext,
    ) -> Arc<Self> {
        let raw: Arc<dyn RawConnection> = Arc::from(raw);
        let id = ConnectionId::next();
        let endpoint = raw.endpoint();

        Arc::new_cyclic(|this: &Weak<Connection>| {
            let this = this.clone();
            let counter = HealedCounter::from_config(
                format!("{}/{}", context.name, id),
                &context.config.instability,
                move || {
                    if let Some(connection) = this.upgrade() {
                        connection.unstable.store(true, Ordering::SeqCst);
                        connection.cancel.cancel();
                    }
                },
            );

            Self {
                id,
                name: context.name,
                endpoint,
                mode,
                raw,
                config: context.config,
                events: context.events,
                handler: context.handler,
                ids: IdAllocator::new(mode),
                initializer: Mutex::new(Some(initializer)),
                layer: Mutex::new(None),
                outgoing: Mutex::new(None),
                callbacks: CallbackTable::new(),
                counter,
                tasks: Mutex::new(Vec::new()),
                initialised: AtomicBool::new(false),
                enabled: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                unstable: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                closed: CancellationToken::new(),
            }
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> EndPoint {
        self.endpoint.clone()
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Toggle whether outgoing sends are accepted. Receiving is unaffected.
    pub fn set_enabled(&self, enabled: bool) {
        if !self.is_disposed() {
            self.enabled.store(enabled, Ordering::SeqCst);
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.pending()
    }

    /// Current value of the connection's instability counter.
    pub fn instability(&self) -> u32 {
        self.counter.value()
    }

    /// Resolves once the connection has been disposed, for whatever reason.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Run the handshake chain and start the connection's tasks.
    ///
    /// `Ok(false)` means negotiation failed (step error, timeout, framing);
    /// `Err` is a transport fault or misuse. Either way the connection is not
    /// usable and should be disposed.
    #[instrument(skip_all, fields(connection = %self.id, endpoint = %self.endpoint, mode = %self.mode))]
    pub async fn initialise(self: &Arc<Self>) -> Result<bool> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        let initializer = self
            .initializer
            .lock()
            .map_err(poisoned)?
            .take()
            .ok_or_else(|| ProtocolError::Custom(constants::ERR_ALREADY_INITIALISED.into()))?;

        global_metrics().handshake_attempt();
        let negotiated = tokio::select! {
            _ = self.cancel.cancelled() => Err(ProtocolError::Disposed),
            negotiated = initializer.negotiate(
                Arc::clone(&self.raw),
                self.mode,
                self.config.connection_timeout,
                self.config.max_payload_size,
            ) => negotiated,
        };

        let layer = match negotiated {
            Ok(layer) => layer,
            Err(e) if e.is_transport_fault() || matches!(e, ProtocolError::Disposed) => {
                global_metrics().handshake_failed();
                warn!(error = %e, "Transport failed during negotiation");
                return Err(e);
            }
            Err(e) => {
                global_metrics().handshake_failed();
                warn!(error = %e, "Negotiation failed");
                return Ok(false);
            }
        };

        *self.layer.lock().map_err(poisoned)? = Some(layer);
        let (tx, rx) = mpsc::unbounded_channel();
        *self.outgoing.lock().map_err(poisoned)? = Some(tx);

        {
            let mut tasks = self.tasks.lock().map_err(poisoned)?;
            if self.is_disposed() {
                return Err(ProtocolError::Disposed);
            }
            tasks.push(tokio::spawn(Arc::clone(self).write_loop(rx)));
            tasks.push(tokio::spawn(Arc::clone(self).receive_loop()));
        }

        self.initialised.store(true, Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);
        global_metrics().handshake_success();
        global_metrics().connection_established();
        info!("Connection initialised");
        Ok(true)
    }

    /// Send `message` without expecting an answer.
    pub fn send(&self, message: Message) -> Result<MessageId> {
        self.ensure_ready()?;
        let id = self.ids.next_id();
        self.transmit(&HeaderMessage::new(id, message.request_id, message.payload))?;
        Ok(id)
    }

    /// Answer the peer's request `request_id`.
    pub fn answer(&self, request_id: MessageId, payload: impl Into<Bytes>) -> Result<MessageId> {
        self.send(Message::answering(request_id, payload))
    }

    /// Send `message` and run `handler` with exactly one outcome.
    ///
    /// Once this returns `Ok`, `handler` is guaranteed to run: with the
    /// answer, after `timeout`, or with connection loss. On `Err` it never
    /// runs. Must be called within a Tokio runtime.
    pub fn send_with_callback<F>(&self, message: Message, timeout: Duration, handler: F) -> Result<MessageId>
    where
        F: FnOnce(CallbackOutcome) + Send + 'static,
    {
        self.ensure_ready()?;
        let id = self.ids.next_id();
        let bytes = self.pack(&HeaderMessage::new(id, message.request_id, message.payload))?;

        self.callbacks.register(id, timeout, Box::new(handler))?;
        if self.enqueue(bytes).is_err() {
            // Disposal is under way; it resolves the callback as lost
            debug!(connection = %self.id, request_id = id, "Request raced with disposal");
        }
        Ok(id)
    }

    /// Send `message` and wait for its answer.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<HeaderMessage> {
        let (tx, rx) = oneshot::channel();
        self.send_with_callback(message, timeout, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        match rx.await {
            Ok(CallbackOutcome::Response(frame)) => Ok(frame),
            Ok(CallbackOutcome::Timeout) => Err(ProtocolError::Timeout),
            Ok(CallbackOutcome::ConnectionLost) | Err(_) => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Release the connection. Idempotent; returns once disposal completed.
    #[instrument(skip_all, fields(connection = %self.id))]
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            self.closed.cancelled().await;
            return;
        }
        self.cancel.cancel();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for task in tasks {
            let _ = task.await;
        }
        self.release(DisposeReason::Requested).await;
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ProtocolError::Disposed);
        }
        if !self.is_initialised() {
            return Err(ProtocolError::NotInitialised);
        }
        if !self.is_enabled() {
            return Err(ProtocolError::ConnectionDisabled);
        }
        Ok(())
    }

    fn pack(&self, frame: &HeaderMessage) -> Result<Bytes> {
        let mut layer = self.layer.lock().map_err(poisoned)?;
        layer
            .as_mut()
            .ok_or(ProtocolError::NotInitialised)?
            .pack(frame)
    }

    fn enqueue(&self, bytes: Bytes) -> Result<()> {
        let outgoing = self.outgoing.lock().map_err(poisoned)?;
        outgoing
            .as_ref()
            .ok_or(ProtocolError::Disposed)?
            .send(bytes)
            .map_err(|_| ProtocolError::Disposed)
    }

    fn transmit(&self, frame: &HeaderMessage) -> Result<()> {
        let bytes = self.pack(frame)?;
        self.enqueue(bytes)
    }

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        loop {
            let bytes = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(bytes) => bytes,
                    None => break,
                },
            };

            let len = bytes.len() as u64;
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => break,
                sent = self.raw.send(bytes) => sent,
            };
            match sent {
                Ok(()) => global_metrics().message_sent(len),
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Send failed");
                    global_metrics().transport_fault();
                    self.counter.increment();
                }
            }
        }
        trace!(connection = %self.id, "Writer stopped");
    }

    async fn receive_loop(self: Arc<Self>) {
        let reason = loop {
            if let Err(e) = self.ingest(None) {
                self.framing_fault(e);
            }

            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    break if self.unstable.load(Ordering::SeqCst) {
                        DisposeReason::Unstable
                    } else {
                        DisposeReason::Requested
                    };
                }
                received = self.raw.receive() => received,
            };

            match received {
                Ok(chunk) => {
                    global_metrics().bytes_received(chunk.len() as u64);
                    if let Err(e) = self.ingest(Some(&chunk)) {
                        self.framing_fault(e);
                    }
                }
                Err(ProtocolError::ConnectionClosed) => break DisposeReason::Lost,
                Err(e) => {
                    warn!(connection = %self.id, error = %e, "Receive failed");
                    global_metrics().transport_fault();
                    self.counter.increment();
                }
            }
        };

        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.release(reason).await;
        }
    }

    fn framing_fault(&self, error: ProtocolError) {
        warn!(connection = %self.id, error = %error, "Discarding malformed input");
        global_metrics().framing_error();
        self.counter.increment();
    }

    /// Decode what is buffered (plus `chunk`) and dispatch every frame.
    fn ingest(self: &Arc<Self>, chunk: Option<&[u8]>) -> Result<()> {
        let (frames, outcome) = {
            let mut guard = self.layer.lock().map_err(poisoned)?;
            let layer = guard.as_mut().ok_or(ProtocolError::NotInitialised)?;
            if let Some(chunk) = chunk {
                layer.feed(chunk);
            }
            let mut frames = Vec::new();
            let outcome = loop {
                match layer.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            (frames, outcome)
        };

        for frame in frames {
            self.dispatch(frame);
        }
        outcome
    }

    fn dispatch(self: &Arc<Self>, frame: HeaderMessage) {
        global_metrics().message_received();
        let Some(frame) = self.callbacks.resolve(frame) else {
            return;
        };
        match &self.handler {
            Some(handler) => handler.handle(self, frame),
            None => debug!(
                connection = %self.id,
                identifier = frame.identifier,
                "Dropping unsolicited message"
            ),
        }
    }

    async fn release(&self, reason: DisposeReason) {
        self.enabled.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Ok(mut outgoing) = self.outgoing.lock() {
            outgoing.take();
        }

        let lost = self.callbacks.fail_all();
        self.raw.dispose().await;
        self.counter.stop();
        if self.is_initialised() {
            global_metrics().connection_closed();
        }

        let endpoint = self.endpoint();
        match reason {
            DisposeReason::Lost => {
                info!(connection = %self.id, endpoint = %endpoint, "Connection lost");
                self.events.publish(Event::ConnectionLost {
                    connection: self.id,
                    endpoint: endpoint.clone(),
                });
            }
            DisposeReason::Unstable => {
                warn!(connection = %self.id, endpoint = %endpoint, "Connection unstable");
                self.events.publish(Event::ConnectionUnstable {
                    connection: self.id,
                    endpoint: endpoint.clone(),
                });
            }
            DisposeReason::Requested => {}
        }
        self.events.publish(Event::ConnectionDisposed {
            connection: self.id,
            endpoint,
        });

        debug!(connection = %self.id, ?reason, failed_callbacks = lost, "Connection disposed");
        self.closed.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("mode", &self.mode)
            .field("enabled", &self.is_enabled())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstabilityConfig;
    use crate::transport::memory::MemoryNetwork;

    fn context(events: &EventBus) -> ConnectionContext {
        ConnectionContext::new("test", Arc::new(ConnectionConfig::default()), events.clone())
    }

    fn pair(events: &EventBus) -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = MemoryNetwork::pair(EndPoint::new("a", 1), EndPoint::new("b", 2));
        (
            Connection::new(Box::new(a), Mode::Initiator, LayerInitializer::framed(), context(events)),
            Connection::new(Box::new(b), Mode::Responder, LayerInitializer::framed(), context(events)),
        )
    }

    #[tokio::test]
    async fn test_send_before_initialise_fails() {
        let events = EventBus::default();
        let (left, _right) = pair(&events);
        assert!(matches!(
            left.send(Message::new(&b"x"[..])),
            Err(ProtocolError::NotInitialised)
        ));
    }

    #[tokio::test]
    async fn test_ids_follow_mode() {
        let events = EventBus::default();
        let (left, right) = pair(&events);
        let (l, r) = tokio::join!(left.initialise(), right.initialise());
        assert!(l.unwrap() && r.unwrap());

        assert_eq!(left.send(Message::new(&b"a"[..])).unwrap(), 1);
        assert_eq!(left.send(Message::new(&b"b"[..])).unwrap(), 3);
        assert_eq!(right.send(Message::new(&b"c"[..])).unwrap(), 2);

        left.dispose().await;
        right.dispose().await;
    }

    #[tokio::test]
    async fn test_disabled_connection_rejects_sends() {
        let events = EventBus::default();
        let (left, right) = pair(&events);
        let _ = tokio::join!(left.initialise(), right.initialise());

        left.set_enabled(false);
        assert!(matches!(
            left.send(Message::new(&b"x"[..])),
            Err(ProtocolError::ConnectionDisabled)
        ));
        left.set_enabled(true);
        assert!(left.send(Message::new(&b"x"[..])).is_ok());

        left.dispose().await;
        right.dispose().await;
    }

    #[tokio::test]
    async fn test_second_initialise_is_rejected() {
        let events = EventBus::default();
        let (left, right) = pair(&events);
        let _ = tokio::join!(left.initialise(), right.initialise());
        assert!(left.initialise().await.is_err());
        left.dispose().await;
        right.dispose().await;
    }

    #[tokio::test]
    async fn test_peer_close_publishes_lost_then_disposed() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (left, right) = pair(&events);
        let _ = tokio::join!(left.initialise(), right.initialise());

        right.dispose().await;
        left.closed().await;
        assert!(left.is_disposed());

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.connection_id() == Some(left.id()) {
                seen.push(format!("{event:?}"));
            }
        }
        assert_eq!(seen.len(), 2);
        assert!(seen[0].starts_with("connection_lost"));
        assert!(seen[1].starts_with("connection_disposed"));
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (left, right) = pair(&events);
        let _ = tokio::join!(left.initialise(), right.initialise());

        tokio::join!(left.dispose(), left.dispose());
        left.dispose().await;

        let mut disposed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::ConnectionDisposed { connection, .. } if connection == left.id()) {
                disposed += 1;
            }
        }
        assert_eq!(disposed, 1);
        right.dispose().await;
    }

    #[tokio::test]
    async fn test_garbage_saturates_counter() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let (a, b) = MemoryNetwork::pair(EndPoint::new("a", 1), EndPoint::new("b", 2));
        let config = ConnectionConfig {
            instability: InstabilityConfig::new(2, Duration::from_secs(60)),
            ..ConnectionConfig::default()
        };
        let victim = Connection::new(
            Box::new(b),
            Mode::Responder,
            LayerInitializer::framed(),
            ConnectionContext::new("victim", Arc::new(config), events.clone()),
        );
        assert!(victim.initialise().await.unwrap());

        a.send(Bytes::from_static(b"not a frame")).await.unwrap();
        a.send(Bytes::from_static(b"still not a frame")).await.unwrap();
        victim.closed().await;

        let mut unstable = false;
        while let Ok(event) = rx.try_recv() {
            if let Event::ConnectionUnstable { connection, .. } = event {
                unstable |= connection == victim.id();
            }
        }
        assert!(unstable);
    }
}
