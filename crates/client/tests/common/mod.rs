#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tether_client::transport::{MemoryConnector, MemoryListener, MemoryPeer};
use tether_client::{Connection, ConnectionEvent, ConnectionOptions, Envelope, EventKind, MessageKind, Registry};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Options with the heartbeat off and a short reconnect interval.
pub fn quiet_options() -> ConnectionOptions {
    ConnectionOptions {
        reconnect_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::ZERO,
        ..Default::default()
    }
}

/// A standalone connection over a fresh in-memory transport.
pub fn memory_connection(
    name: &str,
    options: ConnectionOptions,
) -> (Connection, MemoryConnector, MemoryListener) {
    let (connector, listener) = MemoryConnector::pair();
    let conn = Connection::new(
        name,
        format!("mem://{name}"),
        options,
        Arc::new(connector.clone()),
    );
    (conn, connector, listener)
}

/// A registry over a fresh in-memory transport.
pub fn memory_registry() -> (Arc<Registry>, MemoryConnector, MemoryListener) {
    let (connector, listener) = MemoryConnector::pair();
    let registry = Arc::new(Registry::with_connector(Arc::new(connector.clone())));
    (registry, connector, listener)
}

/// Connect and return the server end of the new socket.
pub async fn connect(conn: &Connection, listener: &mut MemoryListener) -> MemoryPeer {
    conn.connect().await.expect("connect");
    listener.accept().await.expect("accepted peer")
}

/// Wait for the next event of `kind`, skipping others.
pub async fn wait_for(
    events: &mut broadcast::Receiver<ConnectionEvent>,
    kind: EventKind,
) -> ConnectionEvent {
    let wait = async {
        loop {
            let event = events.recv().await.expect("event stream open");
            if event.kind() == kind {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(30), wait)
        .await
        .expect("event arrived in time")
}

/// Every event currently buffered.
pub fn drain(events: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<ConnectionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

/// Serve auth requests on `peer`: acknowledge every `request` envelope,
/// accepting tokens for which `accept` returns true.
pub fn spawn_auth_server<F>(mut peer: MemoryPeer, accept: F) -> JoinHandle<Vec<Value>>
where
    F: Fn(&str) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(envelope) = peer.recv_envelope().await {
            if envelope.kind != Some(MessageKind::Request) {
                seen.push(json!({"type": envelope.tag()}));
                continue;
            }
            let Some(id) = envelope.id.clone() else { continue };
            let token = envelope.payload["token"].as_str().unwrap_or_default().to_string();
            let reply = if accept(&token) {
                json!({"success": true, "user": {"id": "u1"}, "permissions": ["read"]})
            } else {
                json!({"success": false, "message": "invalid token"})
            };
            seen.push(envelope.payload.clone());
            peer.send_envelope(&Envelope::ack(id, reply));
        }
        seen
    })
}
