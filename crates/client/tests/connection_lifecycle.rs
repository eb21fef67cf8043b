//! Connection lifecycle: connect, disconnect, outbound queue and
//! reconnection, driven over the in-memory transport.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use serde_json::json;
use tether_client::transport::{CloseInfo, TransportError};
use tether_client::{
    ConnectionError, ConnectionEvent, ConnectionOptions, ConnectionState, Dispatch, EventKind,
    Frame,
};

use common::{connect, memory_connection, quiet_options, wait_for};

// ---------------------------------------------------------------------------
// Test: connect opens the socket and emits a connect event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_opens_socket_and_emits_event() {
    let (conn, _connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();

    let peer = connect(&conn, &mut listener).await;

    assert_eq!(peer.url, "mem://a");
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.is_connected());
    assert!(conn.has_active_session());
    assert_matches!(
        wait_for(&mut events, EventKind::Connect).await,
        ConnectionEvent::Connected { connection } if connection == "a"
    );
}

// ---------------------------------------------------------------------------
// Test: sub-protocols are offered to the server
// ---------------------------------------------------------------------------

#[tokio::test]
async fn protocols_are_offered() {
    let options = ConnectionOptions {
        protocols: vec!["chat.v1".into()],
        ..quiet_options()
    };
    let (conn, _connector, mut listener) = memory_connection("a", options);

    let peer = connect(&conn, &mut listener).await;

    assert_eq!(peer.protocols, vec!["chat.v1".to_string()]);
}

// ---------------------------------------------------------------------------
// Test: connect while connected is a no-op
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_is_idempotent() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let _peer = connect(&conn, &mut listener).await;

    conn.connect().await.unwrap();
    conn.connect().await.unwrap();

    assert_eq!(connector.attempts(), 1);
    assert!(listener.try_accept().is_none());
}

// ---------------------------------------------------------------------------
// Test: messages sent before connect are flushed in FIFO order
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_messages_flush_in_order() {
    let (conn, _connector, mut listener) = memory_connection("a", quiet_options());

    assert_eq!(conn.send_text("first"), Dispatch::Queued);
    assert_eq!(conn.send_text("second"), Dispatch::Queued);
    assert_eq!(conn.queued_len(), 2);

    let mut peer = connect(&conn, &mut listener).await;
    assert_eq!(conn.send_text("third"), Dispatch::Immediate);

    assert_eq!(peer.recv().await, Some(Frame::Text("first".into())));
    assert_eq!(peer.recv().await, Some(Frame::Text("second".into())));
    assert_eq!(peer.recv().await, Some(Frame::Text("third".into())));
    assert_eq!(conn.queued_len(), 0);
}

// ---------------------------------------------------------------------------
// Test: send helpers serialize envelopes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn emit_and_send_json_serialize() {
    let (conn, _connector, mut listener) = memory_connection("a", quiet_options());
    let mut peer = connect(&conn, &mut listener).await;

    conn.emit("chat", json!({"text": "hi"})).unwrap();
    conn.send_json(&json!({"raw": true})).unwrap();

    let chat = peer.recv_envelope().await.unwrap();
    assert_eq!(chat.tag(), Some("chat"));
    assert_eq!(chat.payload["text"], "hi");

    let raw = peer.recv_envelope().await.unwrap();
    assert!(raw.kind.is_none());
    assert_eq!(raw.payload["raw"], true);
}

// ---------------------------------------------------------------------------
// Test: disconnect closes normally and stops the session
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn disconnect_closes_normally_without_reconnect() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    let mut peer = connect(&conn, &mut listener).await;

    conn.disconnect().await;

    assert_eq!(conn.state(), ConnectionState::Closed);
    assert!(!conn.has_active_session());
    assert_eq!(
        peer.recv().await,
        Some(Frame::Close(Some(CloseInfo {
            code: 1000,
            reason: "client disconnect".into(),
        })))
    );
    assert_matches!(
        wait_for(&mut events, EventKind::Disconnect).await,
        ConnectionEvent::Disconnected { clean: true, code: Some(1000), .. }
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.attempts(), 1);
}

// ---------------------------------------------------------------------------
// Test: connect works again after disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_after_disconnect() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let _first = connect(&conn, &mut listener).await;
    conn.disconnect().await;

    let _second = connect(&conn, &mut listener).await;

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), 2);
}

// ---------------------------------------------------------------------------
// Test: an abrupt loss reconnects after the interval
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn abrupt_loss_reconnects() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    let peer = connect(&conn, &mut listener).await;

    drop(peer);

    assert_matches!(
        wait_for(&mut events, EventKind::Disconnect).await,
        ConnectionEvent::Disconnected { clean: false, code: None, .. }
    );
    assert_matches!(
        wait_for(&mut events, EventKind::ReconnectAttempt).await,
        ConnectionEvent::ReconnectAttempt { attempt: 1, max_attempts: 5, .. }
    );

    let _peer = listener.accept().await.unwrap();
    wait_for(&mut events, EventKind::Connect).await;

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_attempts(), 0);
    assert_eq!(connector.attempts(), 2);
}

// ---------------------------------------------------------------------------
// Test: a non-1000 close code is treated as a loss
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn abnormal_close_code_reconnects() {
    let (conn, _connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    let peer = connect(&conn, &mut listener).await;

    peer.close(1011, "server error");

    assert_matches!(
        wait_for(&mut events, EventKind::Disconnect).await,
        ConnectionEvent::Disconnected { clean: false, code: Some(1011), reason, .. } if reason == "server error"
    );
    wait_for(&mut events, EventKind::ReconnectAttempt).await;
    assert!(listener.accept().await.is_some());
}

// ---------------------------------------------------------------------------
// Test: a normal close from the peer does not reconnect
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn normal_close_from_peer_does_not_reconnect() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    let peer = connect(&conn, &mut listener).await;

    peer.close(1000, "bye");

    assert_matches!(
        wait_for(&mut events, EventKind::Disconnect).await,
        ConnectionEvent::Disconnected { clean: true, code: Some(1000), .. }
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 1);
    assert!(!conn.has_active_session());
}

// ---------------------------------------------------------------------------
// Test: reconnection stops after the configured maximum
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn reconnect_attempts_are_bounded() {
    let options = ConnectionOptions {
        max_reconnect_attempts: 2,
        ..quiet_options()
    };
    let (conn, connector, mut listener) = memory_connection("a", options);

    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);
    conn.on(EventKind::ReconnectAttempt, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let peer = connect(&conn, &mut listener).await;
    connector.refuse_connections(true);
    drop(peer);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(connector.attempts(), 3);
    assert_eq!(conn.state(), ConnectionState::Disconnected);
    assert!(!conn.has_active_session());

    // No further automatic retries.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 3);
}

// ---------------------------------------------------------------------------
// Test: a failed first attempt returns the error and keeps retrying
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_connect_retries_in_background() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    connector.refuse_connections(true);

    let err = conn.connect().await.unwrap_err();
    assert_matches!(err, ConnectionError::Transport(TransportError::Connect(_)));
    assert_matches!(
        wait_for(&mut events, EventKind::Error).await,
        ConnectionEvent::Error { .. }
    );

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(conn.state(), ConnectionState::Reconnecting);
    assert_eq!(connector.attempts(), 1);

    connector.refuse_connections(false);
    let _peer = listener.accept().await.unwrap();
    wait_for(&mut events, EventKind::Connect).await;
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), 2);
}

// ---------------------------------------------------------------------------
// Test: connect() during the reconnect delay attempts at once
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn connect_while_reconnecting_attempts_immediately() {
    let options = ConnectionOptions {
        reconnect_interval: Duration::from_secs(60),
        ..quiet_options()
    };
    let (conn, connector, mut listener) = memory_connection("a", options);
    connector.refuse_connections(true);

    assert!(conn.connect().await.is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(conn.state(), ConnectionState::Reconnecting);
    assert_eq!(conn.reconnect_attempts(), 1);

    connector.refuse_connections(false);
    conn.connect().await.unwrap();

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(conn.reconnect_attempts(), 0);
    assert_eq!(connector.attempts(), 2);
    let _peer = listener.try_accept().expect("socket opened");

    // The abandoned retry never fires.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 2);
    assert!(listener.try_accept().is_none());
    assert!(conn.is_connected());
}

// ---------------------------------------------------------------------------
// Test: sends during reconnection are queued and flushed afterwards
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn sends_during_reconnect_are_flushed() {
    let (conn, connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    let peer = connect(&conn, &mut listener).await;

    connector.refuse_connections(true);
    drop(peer);
    wait_for(&mut events, EventKind::ReconnectAttempt).await;

    assert_eq!(conn.send_text("one"), Dispatch::Queued);
    assert_eq!(conn.send_text("two"), Dispatch::Queued);

    connector.refuse_connections(false);
    let mut peer = listener.accept().await.unwrap();

    assert_eq!(peer.recv().await, Some(Frame::Text("one".into())));
    assert_eq!(peer.recv().await, Some(Frame::Text("two".into())));
}

// ---------------------------------------------------------------------------
// Test: a panicking handler does not break the session
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_handler_is_isolated() {
    let (conn, _connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    conn.on(EventKind::Message, |_, _| panic!("handler bug"));

    let peer = connect(&conn, &mut listener).await;
    peer.send_text(r#"{"type":"chat","payload":1}"#);
    peer.send_text(r#"{"type":"chat","payload":2}"#);

    let first = wait_for(&mut events, EventKind::Message).await;
    let second = wait_for(&mut events, EventKind::Message).await;
    assert_eq!(first.envelope().unwrap().payload, json!(1));
    assert_eq!(second.envelope().unwrap().payload, json!(2));
    assert!(conn.is_connected());
}

// ---------------------------------------------------------------------------
// Test: off() removes a handler
// ---------------------------------------------------------------------------

#[tokio::test]
async fn off_removes_handler() {
    let (conn, _connector, mut listener) = memory_connection("a", quiet_options());
    let mut events = conn.subscribe();
    let hits = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&hits);
    let id = conn.on(EventKind::Message, move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let peer = connect(&conn, &mut listener).await;
    peer.send_text("one");
    wait_for(&mut events, EventKind::Message).await;

    assert!(conn.off(id));
    peer.send_text("two");
    wait_for(&mut events, EventKind::Message).await;

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
