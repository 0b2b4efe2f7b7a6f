//! Request/response correlation over live connections

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod common;

use common::*;
use peerwire::events::Event;
use peerwire::transport::memory::{MemoryClientTransport, MemoryNetwork, MemoryServerTransport};
use peerwire::{
    CallbackOutcome, Client, ClientStatus, Connection, HeaderMessage, Message, ProtocolError, Server,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Open `server`, connect a client to it and return the client's connection.
async fn connect(network: &Arc<MemoryNetwork>, server: &Server, address: &str) -> (Client, Arc<Connection>) {
    let mut events = server.events().subscribe();
    server.open().await.unwrap();

    let client = Client::new(
        client_config(address),
        MemoryClientTransport::new(Arc::clone(network)),
        framed(),
    );
    client.connect().await.unwrap();
    client
        .wait_for_status(ClientStatus::Connected, WAIT)
        .await
        .unwrap();
    wait_for_event(&mut events, is_new_client).await.expect("server side accepted");

    let connection = client.connection().unwrap();
    (client, connection)
}

fn echo_server(network: &Arc<MemoryNetwork>, address: &str) -> Server {
    Server::new(
        server_config(address),
        MemoryServerTransport::new(Arc::clone(network)),
        framed(),
    )
    .with_message_handler(|connection: &Arc<Connection>, message: HeaderMessage| {
        let _ = connection.answer(message.identifier, message.payload);
    })
}

#[tokio::test]
async fn test_request_times_out_when_peer_is_silent() {
    let network = MemoryNetwork::new();
    let server = Server::new(
        server_config("cb:1"),
        MemoryServerTransport::new(Arc::clone(&network)),
        framed(),
    );
    let (client, connection) = connect(&network, &server, "cb:1").await;

    let (tx, rx) = oneshot::channel();
    let started = Instant::now();
    connection
        .send_with_callback(Message::new(&b"hello"[..]), Duration::from_millis(50), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();

    let outcome = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(outcome.is_timeout());
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_secs(2));
    assert_eq!(connection.pending_callbacks(), 0);

    // A timeout does not hurt the connection
    assert!(!connection.is_disposed());

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_request_receives_answer() {
    let network = MemoryNetwork::new();
    let server = echo_server(&network, "cb:2");
    let (client, connection) = connect(&network, &server, "cb:2").await;

    let answer = connection
        .request(Message::new(&b"ping"[..]), WAIT)
        .await
        .unwrap();
    assert_eq!(&answer.payload[..], b"ping");
    assert!(answer.request_id.is_some());
    assert_eq!(connection.pending_callbacks(), 0);

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_requests_each_resolve_once() {
    let network = MemoryNetwork::new();
    let server = echo_server(&network, "cb:3");
    let (client, connection) = connect(&network, &server, "cb:3").await;

    let fired = Arc::new(AtomicUsize::new(0));
    let mut waiters = Vec::new();
    for i in 0..100u32 {
        let (tx, rx) = oneshot::channel();
        let fired = Arc::clone(&fired);
        connection
            .send_with_callback(Message::new(i.to_be_bytes().to_vec()), WAIT, move |outcome| {
                fired.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send((i, outcome));
            })
            .unwrap();
        waiters.push(rx);
    }

    for rx in waiters {
        let (i, outcome) = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        let response = outcome.response().expect("answered");
        assert_eq!(&response.payload[..], &i.to_be_bytes()[..]);
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 100);
    assert_eq!(connection.pending_callbacks(), 0);

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_pending_request_fails_when_connection_is_lost() {
    let network = MemoryNetwork::new();
    let server = Server::new(
        server_config("cb:4"),
        MemoryServerTransport::new(Arc::clone(&network)),
        framed(),
    );
    let (client, connection) = connect(&network, &server, "cb:4").await;

    let (tx, rx) = oneshot::channel();
    connection
        .send_with_callback(Message::new(&b"never"[..]), Duration::from_secs(30), move |outcome| {
            let _ = tx.send(outcome);
        })
        .unwrap();
    assert_eq!(connection.pending_callbacks(), 1);

    server.close().await.unwrap();

    let outcome = tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
    assert!(matches!(outcome, CallbackOutcome::ConnectionLost));

    client.dispose().await.unwrap();
}

#[tokio::test]
async fn test_send_after_dispose_is_rejected() {
    let network = MemoryNetwork::new();
    let server = echo_server(&network, "cb:5");
    let mut events = server.events().subscribe();
    let (client, connection) = connect(&network, &server, "cb:5").await;

    connection.dispose().await;
    assert!(matches!(
        connection.send(Message::new(&b"late"[..])),
        Err(ProtocolError::Disposed)
    ));
    assert!(connection
        .send_with_callback(Message::new(&b"late"[..]), WAIT, |_| {})
        .is_err());

    // The server side observes the loss
    let lost = wait_for_event(&mut events, |e| matches!(e, Event::ConnectionLost { .. })).await;
    assert!(lost.is_some());

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test]
async fn test_unsolicited_message_reaches_client_handler() {
    let network = MemoryNetwork::new();
    let server = Server::new(
        server_config("cb:6"),
        MemoryServerTransport::new(Arc::clone(&network)),
        framed(),
    );
    let mut events = server.events().subscribe();
    server.open().await.unwrap();

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let client = Client::new(
        client_config("cb:6"),
        MemoryClientTransport::new(Arc::clone(&network)),
        framed(),
    )
    .with_message_handler(move |_: &Arc<Connection>, message: HeaderMessage| {
        let _ = tx.send(message);
    });
    client.connect().await.unwrap();

    let Some(Event::NewClient { connection, .. }) = wait_for_event(&mut events, is_new_client).await
    else {
        panic!("no new client");
    };
    let id = connection.send(Message::new(&b"push"[..])).unwrap();
    assert_eq!(id % 2, 0, "responder ids are even");

    let pushed = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(pushed.identifier, id);
    assert_eq!(&pushed.payload[..], b"push");

    client.dispose().await.unwrap();
    server.close().await.unwrap();
}
