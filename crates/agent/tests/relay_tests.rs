//! Room relay routing, driven over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tether_agent::relay::{self, ROOM_MESSAGE};
use tether_client::transport::{MemoryConnector, MemoryListener, MemoryPeer};
use tether_client::{ConnectionOptions, Envelope, EventKind, Registry, RoomManager};

fn options() -> ConnectionOptions {
    ConnectionOptions {
        heartbeat_interval: Duration::ZERO,
        ..Default::default()
    }
}

async fn open(registry: &Registry, listener: &mut MemoryListener, name: &str) -> MemoryPeer {
    let conn = registry
        .create(name, format!("mem://{name}"), options())
        .unwrap();
    conn.connect().await.unwrap();
    listener.accept().await.unwrap()
}

// ---------------------------------------------------------------------------
// Test: room.message is relayed to the other members only
// ---------------------------------------------------------------------------

#[tokio::test]
async fn room_message_is_relayed_to_other_members() {
    let (connector, mut listener) = MemoryConnector::pair();
    let registry = Arc::new(Registry::with_connector(Arc::new(connector)));
    let rooms = Arc::new(RoomManager::new(Arc::clone(&registry)));
    let router = Arc::new(relay::router(Arc::clone(&rooms)));
    registry.add_global_handler(EventKind::Message, router.event_handler(), false);

    let peer_a = open(&registry, &mut listener, "a").await;
    let mut peer_b = open(&registry, &mut listener, "b").await;
    let mut peer_c = open(&registry, &mut listener, "c").await;
    rooms.join("a", "lobby").unwrap();
    rooms.join("b", "lobby").unwrap();

    peer_a.send_envelope(&Envelope::typed(
        ROOM_MESSAGE,
        json!({"room": "lobby", "data": {"text": "hello"}}),
    ));

    let relayed = peer_b.recv_envelope().await.unwrap();
    assert_eq!(relayed.tag(), Some(ROOM_MESSAGE));
    assert_eq!(relayed.payload, json!({"text": "hello"}));

    // Not a member of the room.
    let nothing = tokio::time::timeout(Duration::from_millis(50), peer_c.recv()).await;
    assert!(nothing.is_err());

    registry.disconnect_all().await;
}

// ---------------------------------------------------------------------------
// Test: a malformed room.message does not disturb the connection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_room_message_is_dropped() {
    let (connector, mut listener) = MemoryConnector::pair();
    let registry = Arc::new(Registry::with_connector(Arc::new(connector)));
    let rooms = Arc::new(RoomManager::new(Arc::clone(&registry)));
    let router = Arc::new(relay::router(Arc::clone(&rooms)));
    registry.add_global_handler(EventKind::Message, router.event_handler(), false);

    let peer_a = open(&registry, &mut listener, "a").await;
    let mut peer_b = open(&registry, &mut listener, "b").await;
    rooms.join("a", "lobby").unwrap();
    rooms.join("b", "lobby").unwrap();

    peer_a.send_envelope(&Envelope::typed(ROOM_MESSAGE, json!({"data": 1})));
    peer_a.send_envelope(&Envelope::typed(ROOM_MESSAGE, json!({"room": "lobby", "data": 2})));

    let relayed = peer_b.recv_envelope().await.unwrap();
    assert_eq!(relayed.payload, json!(2));
    assert!(registry.get("a").unwrap().is_connected());

    registry.disconnect_all().await;
}
