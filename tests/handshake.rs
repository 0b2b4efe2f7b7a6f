//! Handshake chains negotiated over live connections

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::*;
use peerwire::config::ConnectionConfig;
use peerwire::connection::ConnectionContext;
use peerwire::events::{Event, EventBus};
use peerwire::layer::{CertificateStep, HmacCertificate, KeyExchangeStep, LayerInitializer};
use peerwire::transport::memory::{MemoryClientTransport, MemoryNetwork, MemoryServerTransport};
use peerwire::transport::tcp::{TcpClientTransport, TcpServerTransport};
use peerwire::{
    Client, ClientStatus, Connection, EndPoint, HeaderMessage, LayerFactory, Message, Mode,
    ProtocolError, Server,
};
use serial_test::serial;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn secured(key: &'static [u8]) -> LayerInitializer {
    LayerInitializer::framed()
        .with_step(CertificateStep::new(HmacCertificate::new(key.to_vec())))
        .with_step(KeyExchangeStep::default())
}

fn secured_factory(key: &'static [u8]) -> LayerFactory {
    LayerInitializer::factory(move || secured(key))
}

fn connection_pair(
    config: ConnectionConfig,
    initiator: LayerInitializer,
    responder: LayerInitializer,
) -> (Arc<Connection>, Arc<Connection>) {
    let (left, right) = MemoryNetwork::pair(EndPoint::new("server", 1), EndPoint::new("client", 2));
    let config = Arc::new(config);
    let events = EventBus::default();

    let client = Connection::new(
        Box::new(left),
        Mode::Initiator,
        initiator,
        ConnectionContext::new("client", Arc::clone(&config), events.clone()),
    );
    let echo = |connection: &Arc<Connection>, message: HeaderMessage| {
        let _ = connection.answer(message.identifier, message.payload);
    };
    let server = Connection::new(
        Box::new(right),
        Mode::Responder,
        responder,
        ConnectionContext::new("server", config, events).with_handler(Some(Arc::new(echo))),
    );
    (client, server)
}

#[tokio::test]
async fn test_secured_chain_carries_requests() {
    let (client, server) = connection_pair(connection_config(), secured(b"shared"), secured(b"shared"));

    let (initiated, responded) = tokio::join!(client.initialise(), server.initialise());
    assert!(initiated.unwrap());
    assert!(responded.unwrap());

    for round in 0..10u8 {
        let answer = client
            .request(Message::new(vec![round; 64]), WAIT)
            .await
            .unwrap();
        assert_eq!(&answer.payload[..], &[round; 64][..]);
    }

    client.dispose().await;
    server.dispose().await;
}

#[tokio::test]
async fn test_payload_limit_applies_to_every_layer() {
    let limited = || ConnectionConfig {
        max_payload_size: 2048,
        ..connection_config()
    };

    for (initiator, responder) in [
        (LayerInitializer::framed(), LayerInitializer::framed()),
        (secured(b"shared"), secured(b"shared")),
    ] {
        let (client, server) = connection_pair(limited(), initiator, responder);
        let (initiated, responded) = tokio::join!(client.initialise(), server.initialise());
        assert!(initiated.unwrap());
        assert!(responded.unwrap());

        assert!(matches!(
            client.send(Message::new(vec![0u8; 8192])),
            Err(ProtocolError::OversizedPacket(_))
        ));
        let answer = client
            .request(Message::new(vec![1u8; 1024]), WAIT)
            .await
            .unwrap();
        assert_eq!(answer.payload.len(), 1024);

        client.dispose().await;
        server.dispose().await;
    }
}

#[tokio::test]
async fn test_mismatched_certificates_fail_negotiation() {
    let (client, server) = connection_pair(connection_config(), secured(b"alpha"), secured(b"beta"));

    let responder = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.initialise().await }
    });

    assert!(!client.initialise().await.unwrap());
    assert!(!client.is_initialised());
    client.dispose().await;

    // The responder never completes successfully
    let responded = tokio::time::timeout(WAIT, responder).await.unwrap().unwrap();
    assert!(!matches!(responded, Ok(true)));
    assert!(!server.is_initialised());
    server.dispose().await;
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let config = ConnectionConfig {
        connection_timeout: Duration::from_millis(100),
        ..ConnectionConfig::default()
    };
    let (client, server) = connection_pair(config, secured(b"k"), secured(b"k"));

    // Only the responder runs; it waits for a hello that never comes
    let started = Instant::now();
    assert!(!server.initialise().await.unwrap());
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));

    server.dispose().await;
    client.dispose().await;
}

#[tokio::test]
async fn test_dispose_during_negotiation_interrupts_it() {
    let (client, server) = connection_pair(connection_config(), secured(b"k"), secured(b"k"));

    let pending = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.initialise().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    server.dispose().await;

    let outcome = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(outcome.is_err());
    client.dispose().await;
}

#[tokio::test]
async fn test_secured_server_and_client_over_memory() {
    let network = MemoryNetwork::new();
    let server = Server::new(
        server_config("hs:1"),
        MemoryServerTransport::new(Arc::clone(&network)),
        secured_factory(b"fleet"),
    )
    .with_message_handler(|connection: &Arc<Connection>, message: HeaderMessage| {
        let _ = connection.answer(message.identifier, message.payload);
    });
    let mut events = server.events().subscribe();
    server.open().await.unwrap();

    let client = Client::new(
        client_config("hs:1"),
        MemoryClientTransport::new(network),
        secured_factory(b"fleet"),
    );
    client.connect().await.unwrap();
    client.wait_for_status(ClientStatus::Connected, WAIT).await.unwrap();
    assert!(matches!(
        wait_for_event(&mut events, is_new_client).await,
        Some(Event::NewClient { .. })
    ));

    let answer = client
        .connection()
        .unwrap()
        .request(Message::new(&b"sealed"[..]), WAIT)
        .await
        .unwrap();
    assert_eq!(&answer.payload[..], b"sealed");

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_secured_server_and_client_over_tcp() {
    let server = Server::new(
        server_config("127.0.0.1:0"),
        TcpServerTransport::new(),
        secured_factory(b"fleet"),
    )
    .with_message_handler(|connection: &Arc<Connection>, message: HeaderMessage| {
        let _ = connection.answer(message.identifier, message.payload);
    });
    server.open().await.unwrap();
    let bound = server.local_endpoint().unwrap();

    let client = Client::new(
        client_config(&bound.to_string()),
        TcpClientTransport,
        secured_factory(b"fleet"),
    );
    client.connect().await.unwrap();
    client.wait_for_status(ClientStatus::Connected, WAIT).await.unwrap();

    let payload = vec![0xA5u8; 32 * 1024];
    let answer = client
        .connection()
        .unwrap()
        .request(Message::new(payload.clone()), WAIT)
        .await
        .unwrap();
    assert_eq!(&answer.payload[..], &payload[..]);

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}
