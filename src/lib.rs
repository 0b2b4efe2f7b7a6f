//! # peerwire
//!
//! Bidirectional networking framework: a [`Server`] accepts and validates
//! peers, a [`Client`] keeps a connection to a server alive, and both ends
//! exchange framed, optionally authenticated and encrypted messages with
//! request/response correlation.
//!
//! ## Architecture
//! - **Transport**: raw byte pipes ([`transport::tcp`], [`transport::memory`])
//! - **Layer**: framing plus a handshake chain negotiated per connection
//! - **Connection**: receive loop, writer task and callback table
//! - **Server / Client**: lifecycle state machines driving connections
//! - **HealedCounter**: decaying fault counters turning sustained
//!   instability into a policy action
//!
//! ## Example
//! ```rust,no_run
//! use peerwire::config::ServerConfig;
//! use peerwire::events::Event;
//! use peerwire::layer::{KeyExchangeStep, LayerInitializer};
//! use peerwire::transport::tcp::TcpServerTransport;
//! use peerwire::Server;
//!
//! # async fn run() -> peerwire::Result<()> {
//! let layers = LayerInitializer::factory(|| {
//!     LayerInitializer::framed().with_step(KeyExchangeStep::default())
//! });
//! let server = Server::new(ServerConfig::default(), TcpServerTransport::new(), layers)
//!     .with_message_handler(|connection: &std::sync::Arc<peerwire::Connection>, message: peerwire::HeaderMessage| {
//!         let _ = connection.answer(message.identifier, message.payload);
//!     });
//!
//! let mut events = server.events().subscribe();
//! server.open().await?;
//! while let Ok(event) = events.recv().await {
//!     if let Event::ServerUnstable { .. } = event {
//!         server.close().await?;
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod core;
pub mod error;
pub mod events;
pub mod layer;
pub mod server;
pub mod transport;
pub mod utils;

pub use client::{Client, ClientStatus};
pub use config::{ClientConfig, ConnectionConfig, InstabilityConfig, NetworkConfig, ServerConfig};
pub use connection::{CallbackOutcome, Connection, ConnectionId, MessageHandler};
pub use crate::core::endpoint::EndPoint;
pub use crate::core::message::{HeaderMessage, Message, MessageId, Mode};
pub use error::{ProtocolError, Result};
pub use events::{Event, EventBus};
pub use layer::{Layer, LayerFactory, LayerInitializer};
pub use server::{ClientValidator, Server, ServerState};
pub use utils::healed_counter::HealedCounter;
