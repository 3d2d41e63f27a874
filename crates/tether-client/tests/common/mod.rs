//! Shared helpers for client integration tests

#![allow(dead_code)]

use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;

use tether_client::{MemoryListener, MemoryPeer, TransportStatus};
use tether_core::{Body, Envelope};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);
pub const TEST_URL: &str = "ws://tether.test/realtime";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub async fn accept(listener: &mut MemoryListener) -> MemoryPeer {
    timeout(TEST_TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

pub async fn next_envelope(peer: &mut MemoryPeer) -> Envelope {
    let bytes = timeout(TEST_TIMEOUT, peer.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("client closed the socket");
    Envelope::decode(&bytes).expect("client sent a malformed frame")
}

pub fn send(peer: &MemoryPeer, id: u64, body: Body) {
    let bytes = Envelope::new(id, body).encode().expect("encode");
    assert!(peer.send(bytes), "client end is gone");
}

/// Accept a connection and complete the handshake; returns the peer and the
/// init envelope
pub async fn accept_session(listener: &mut MemoryListener) -> (MemoryPeer, Envelope) {
    let mut peer = accept(listener).await;
    let init = next_envelope(&mut peer).await;
    assert!(
        matches!(init.body, Body::ConnectionInit { .. }),
        "expected connection init, got {:?}",
        init.body
    );
    send(&peer, 1, Body::ConnectionOpen);
    (peer, init)
}

/// Wait until the socket end is released by the client
pub async fn wait_closed(peer: &mut MemoryPeer) {
    let closed = timeout(TEST_TIMEOUT, async {
        while peer.recv().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "client never closed the socket");
}

pub async fn wait_status<F>(rx: &mut watch::Receiver<TransportStatus>, predicate: F) -> TransportStatus
where
    F: Fn(&TransportStatus) -> bool,
{
    let status = timeout(TEST_TIMEOUT, rx.wait_for(|s| predicate(s)))
        .await
        .expect("timed out waiting for transport status")
        .expect("transport dropped");
    *status
}
