//! Shared helpers for integration tests

#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use async_trait::async_trait;
use peerwire::config::{ClientConfig, ConnectionConfig, InstabilityConfig, ServerConfig};
use peerwire::events::Event;
use peerwire::layer::{LayerFactory, LayerInitializer};
use peerwire::transport::{RawConnection, ServerTransport};
use peerwire::{EndPoint, ProtocolError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn framed() -> LayerFactory {
    LayerInitializer::factory(LayerInitializer::framed)
}

pub fn connection_config() -> ConnectionConfig {
    ConnectionConfig {
        connection_timeout: Duration::from_secs(2),
        ..ConnectionConfig::default()
    }
}

pub fn server_config(address: &str) -> ServerConfig {
    ServerConfig {
        name: "test-server".into(),
        address: address.into(),
        connection: connection_config(),
        instability: InstabilityConfig::new(5, Duration::from_secs(60)),
    }
}

pub fn client_config(address: &str) -> ClientConfig {
    ClientConfig {
        name: "test-client".into(),
        address: address.into(),
        reconnection_delay: Duration::from_millis(50),
        automatic_reconnection: true,
        connection: connection_config(),
        instability: InstabilityConfig::new(100, Duration::from_secs(60)),
    }
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<Event>, pred: F) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Drain whatever is already queued on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn is_new_client(event: &Event) -> bool {
    matches!(event, Event::NewClient { .. })
}

/// Listener whose every accept fails.
#[derive(Default)]
pub struct FailingServerTransport {
    pub accepts: Arc<AtomicUsize>,
}

impl FailingServerTransport {
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.accepts)
    }
}

#[async_trait]
impl ServerTransport for FailingServerTransport {
    async fn open(&self, _endpoint: &EndPoint) -> Result<()> {
        Ok(())
    }

    async fn wait_for_client(&self) -> Result<Box<dyn RawConnection>> {
        self.accepts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        Err(ProtocolError::TransportError("accept failed".into()))
    }

    async fn close(&self) {}
}
