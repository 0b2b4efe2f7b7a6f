//! Lifecycle events and the broadcast bus that carries them.
//!
//! Servers, clients and connections publish onto an [`EventBus`] handed to
//! them at construction; every component that holds a clone of the bus can
//! subscribe. Subscriptions live exactly as long as the returned receiver.

use std::fmt;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::trace;

use crate::connection::{Connection, ConnectionId};
use crate::core::endpoint::EndPoint;

/// Default number of events a lagging subscriber may fall behind.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Something observable happened to a server or connection.
#[derive(Clone)]
pub enum Event {
    /// An accepted peer passed validation and negotiation.
    NewClient {
        server: String,
        connection: Arc<Connection>,
    },
    /// The remote end closed the connection.
    ConnectionLost {
        connection: ConnectionId,
        endpoint: EndPoint,
    },
    /// The connection's instability counter saturated.
    ConnectionUnstable {
        connection: ConnectionId,
        endpoint: EndPoint,
    },
    /// The connection has been released. Always the last event for it.
    ConnectionDisposed {
        connection: ConnectionId,
        endpoint: EndPoint,
    },
    /// The server's accept loop stopped after repeated faults.
    ServerUnstable { server: String },
    ServerClosed { server: String },
}

impl Event {
    /// Connection this event concerns, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Event::NewClient { connection, .. } => Some(connection.id()),
            Event::ConnectionLost { connection, .. }
            | Event::ConnectionUnstable { connection, .. }
            | Event::ConnectionDisposed { connection, .. } => Some(*connection),
            Event::ServerUnstable { .. } | Event::ServerClosed { .. } => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Event::NewClient { .. } => "new_client",
            Event::ConnectionLost { .. } => "connection_lost",
            Event::ConnectionUnstable { .. } => "connection_unstable",
            Event::ConnectionDisposed { .. } => "connection_disposed",
            Event::ServerUnstable { .. } => "server_unstable",
            Event::ServerClosed { .. } => "server_closed",
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct(self.kind());
        match self {
            Event::NewClient { server, connection } => out
                .field("server", server)
                .field("connection", &connection.id())
                .field("endpoint", &connection.endpoint()),
            Event::ConnectionLost { connection, endpoint }
            | Event::ConnectionUnstable { connection, endpoint }
            | Event::ConnectionDisposed { connection, endpoint } => out
                .field("connection", connection)
                .field("endpoint", endpoint),
            Event::ServerUnstable { server } | Event::ServerClosed { server } => {
                out.field("server", server)
            }
        };
        out.finish()
    }
}

/// Cloneable publish/subscribe dispatcher.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Deliver `event` to every current subscriber.
    ///
    /// Returns the number of subscribers reached; publishing with nobody
    /// listening is not an error.
    pub fn publish(&self, event: Event) -> usize {
        trace!(event = event.kind(), "Publishing event");
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
