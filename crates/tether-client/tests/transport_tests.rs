//! Transport state machine tests over the in-process network

mod common;

use async_trait::async_trait;
use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use common::*;
use tether_client::{
    lifecycle_channel, memory_network, ConnectionState, Connector, SocketFrame, SocketPair,
    SocketSink, SocketStream, Transport, TransportEvent,
};
use tether_core::{TransportConfig, TransportError};

fn connected(status: &tether_client::TransportStatus) -> bool {
    status.state == ConnectionState::Connected
}

fn disconnected(status: &tether_client::TransportStatus) -> bool {
    status.state == ConnectionState::Disconnected
}

// ----------------------------------------------------------------------------
// Connecting and Reconnecting
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_connects_after_start_only() {
    init_tracing();
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();

    sleep(Duration::from_millis(50)).await;
    assert_eq!(listener.attempts(), 0);
    assert_eq!(handle.send(vec![1]).await, Err(TransportError::NotConnected));

    handle.start();
    let _peer = accept(&mut listener).await;
    wait_status(&mut handle.watch_status(), connected).await;
    assert_eq!(handle.status().retry_count, 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_frames_flow_both_ways() {
    let (connector, mut listener) = memory_network();
    let (handle, mut events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    handle.start();
    let mut peer = accept(&mut listener).await;
    wait_status(&mut handle.watch_status(), connected).await;

    handle.send(b"hello".to_vec()).await.unwrap();
    assert_eq!(
        timeout(TEST_TIMEOUT, peer.recv()).await.unwrap(),
        Some(b"hello".to_vec())
    );

    assert!(peer.send(b"world".to_vec()));
    let frame = timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await {
                Some(TransportEvent::Frame(bytes)) => return bytes,
                Some(TransportEvent::StateChanged(_)) => continue,
                None => panic!("transport ended"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(frame, b"world".to_vec());

    handle.stop().await;
}

#[tokio::test]
async fn test_reconnects_after_peer_drop() {
    init_tracing();
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    let mut status = handle.watch_status();
    handle.start();

    let first = accept(&mut listener).await;
    wait_status(&mut status, connected).await;
    drop(first);

    let _second = accept(&mut listener).await;
    wait_status(&mut status, connected).await;
    assert_eq!(listener.attempts(), 2);
    // A dropped stream is a network transition, not a backoff failure
    assert_eq!(handle.status().retry_count, 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_server_close_reconnects_with_backoff() {
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    let mut status = handle.watch_status();
    handle.start();

    let first = accept(&mut listener).await;
    wait_status(&mut status, connected).await;
    first.close();

    let _second = accept(&mut listener).await;
    let after = wait_status(&mut status, connected).await;
    assert_eq!(after.retry_count, 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_refused_connections_back_off_then_recover() {
    let (connector, mut listener) = memory_network();
    listener.set_refusing(true);
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    let mut status = handle.watch_status();
    handle.start();

    wait_status(&mut status, |s| s.retry_count >= 3).await;
    assert!(listener.attempts() >= 3);
    assert!(handle.is_reconnecting() || handle.status().state != ConnectionState::Connected);

    listener.set_refusing(false);
    let _peer = accept(&mut listener).await;
    let after = wait_status(&mut status, connected).await;
    // Only a foreground-triggered connect resets the counter
    assert!(after.retry_count >= 3);

    handle.stop().await;
}

#[tokio::test]
async fn test_no_reconnect_after_stop() {
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    handle.start();

    let mut peer = accept(&mut listener).await;
    wait_status(&mut handle.watch_status(), connected).await;

    handle.stop().await;
    wait_closed(&mut peer).await;
    assert_eq!(handle.status().state, ConnectionState::Disconnected);
    assert_eq!(handle.send(vec![1]).await, Err(TransportError::Stopped));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(listener.attempts(), 1);
    assert!(!handle.is_reconnecting());
}

// ----------------------------------------------------------------------------
// Liveness
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_missed_pongs_force_reconnect() {
    init_tracing();
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    let mut status = handle.watch_status();
    handle.start();

    let mut first = accept(&mut listener).await;
    wait_status(&mut status, connected).await;
    first.set_responsive(false);

    // Three missed pongs drop the socket
    wait_closed(&mut first).await;
    let _second = accept(&mut listener).await;
    let after = wait_status(&mut status, connected).await;
    assert_eq!(after.retry_count, 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_responsive_peer_stays_connected() {
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    handle.start();
    let _peer = accept(&mut listener).await;
    wait_status(&mut handle.watch_status(), connected).await;

    // Several ping intervals
    sleep(Duration::from_millis(900)).await;
    assert_eq!(handle.status().state, ConnectionState::Connected);
    assert_eq!(listener.attempts(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_ensure_connected_detects_dead_socket() {
    let (connector, mut listener) = memory_network();
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), Arc::new(connector), None).unwrap();
    let mut status = handle.watch_status();
    handle.start();

    let mut first = accept(&mut listener).await;
    wait_status(&mut status, connected).await;
    first.set_responsive(false);
    handle.ensure_connected();

    // A single missed verification pong is enough
    timeout(Duration::from_millis(300), wait_closed(&mut first))
        .await
        .expect("verification ping did not fail fast");
    let _second = accept(&mut listener).await;
    wait_status(&mut status, connected).await;

    handle.stop().await;
}

/// Hands out sockets whose writes never complete and that never yield a frame
#[derive(Default)]
struct StalledConnector {
    attempts: AtomicUsize,
}

struct StalledSink;

struct SilentStream;

#[async_trait]
impl SocketSink for StalledSink {
    async fn send(&mut self, _frame: Vec<u8>) -> Result<(), TransportError> {
        pending().await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        pending().await
    }

    async fn close(&mut self) {
        pending::<()>().await
    }
}

#[async_trait]
impl SocketStream for SilentStream {
    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        pending().await
    }
}

#[async_trait]
impl Connector for StalledConnector {
    async fn connect(&self, _url: &str) -> Result<SocketPair, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Ok((Box::new(StalledSink), Box::new(SilentStream)))
    }
}

#[tokio::test]
async fn test_stalled_socket_is_replaced_and_stop_returns() {
    init_tracing();
    let connector = Arc::new(StalledConnector::default());
    let (handle, _events) =
        Transport::spawn(TransportConfig::testing(TEST_URL), connector.clone(), None).unwrap();
    let mut status = handle.watch_status();
    handle.start();
    wait_status(&mut status, connected).await;

    // Pings that never flush count as missed pongs
    timeout(Duration::from_secs(2), async {
        while connector.attempts.load(Ordering::SeqCst) < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("stalled socket was never replaced");

    wait_status(&mut status, connected).await;
    let sent = timeout(Duration::from_secs(2), handle.send(vec![1]))
        .await
        .expect("send hung on a stalled socket");
    assert!(matches!(
        sent,
        Err(TransportError::SendFailed { .. }) | Err(TransportError::NotConnected)
    ));

    timeout(Duration::from_secs(2), handle.stop())
        .await
        .expect("stop hung on a stalled socket");
    assert_eq!(handle.status().state, ConnectionState::Disconnected);
}

// ----------------------------------------------------------------------------
// Lifecycle
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_network_loss_waits_for_network() {
    let (connector, mut listener) = memory_network();
    let (lifecycle, lifecycle_rx) = lifecycle_channel();
    let (handle, _events) = Transport::spawn(
        TransportConfig::testing(TEST_URL),
        Arc::new(connector),
        Some(lifecycle_rx),
    )
    .unwrap();
    let mut status = handle.watch_status();
    handle.start();

    let mut first = accept(&mut listener).await;
    wait_status(&mut status, connected).await;

    assert!(lifecycle.network_unavailable());
    let offline = wait_status(&mut status, |s| !s.network_available).await;
    assert_eq!(offline.state, ConnectionState::Disconnected);
    wait_closed(&mut first).await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.attempts(), 1);
    assert!(!handle.is_reconnecting());

    assert!(lifecycle.network_available(false));
    let _second = accept(&mut listener).await;
    let online = wait_status(&mut status, connected).await;
    assert!(online.network_available);

    handle.stop().await;
}

#[tokio::test]
async fn test_background_grace_then_foreground() {
    let (connector, mut listener) = memory_network();
    let (lifecycle, lifecycle_rx) = lifecycle_channel();
    let (handle, _events) = Transport::spawn(
        TransportConfig::testing(TEST_URL),
        Arc::new(connector),
        Some(lifecycle_rx),
    )
    .unwrap();
    let mut status = handle.watch_status();
    handle.start();

    let mut first = accept(&mut listener).await;
    wait_status(&mut status, connected).await;

    assert!(lifecycle.app_backgrounded());
    wait_closed(&mut first).await;
    wait_status(&mut status, disconnected).await;

    sleep(Duration::from_millis(200)).await;
    assert_eq!(listener.attempts(), 1);

    assert!(lifecycle.app_foregrounded());
    let _second = accept(&mut listener).await;
    let after = wait_status(&mut status, connected).await;
    assert_eq!(after.retry_count, 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_short_background_keeps_socket() {
    let (connector, mut listener) = memory_network();
    let (lifecycle, lifecycle_rx) = lifecycle_channel();
    let (handle, _events) = Transport::spawn(
        TransportConfig::testing(TEST_URL),
        Arc::new(connector),
        Some(lifecycle_rx),
    )
    .unwrap();
    handle.start();

    let _peer = accept(&mut listener).await;
    wait_status(&mut handle.watch_status(), connected).await;

    lifecycle.app_backgrounded();
    sleep(Duration::from_millis(30)).await;
    lifecycle.app_foregrounded();
    sleep(Duration::from_millis(200)).await;

    assert_eq!(handle.status().state, ConnectionState::Connected);
    assert_eq!(listener.attempts(), 1);

    handle.stop().await;
}

#[tokio::test]
async fn test_foreground_resets_retry_count() {
    let (connector, mut listener) = memory_network();
    let (lifecycle, lifecycle_rx) = lifecycle_channel();
    listener.set_refusing(true);
    let (handle, _events) = Transport::spawn(
        TransportConfig::testing(TEST_URL),
        Arc::new(connector),
        Some(lifecycle_rx),
    )
    .unwrap();
    let mut status = handle.watch_status();
    handle.start();
    wait_status(&mut status, |s| s.retry_count >= 2).await;

    // Suspend via background so the foreground connect is the next attempt
    lifecycle.app_backgrounded();
    sleep(Duration::from_millis(200)).await;
    listener.set_refusing(false);
    lifecycle.app_foregrounded();

    let _peer = accept(&mut listener).await;
    let after = wait_status(&mut status, connected).await;
    assert_eq!(after.retry_count, 0);

    handle.stop().await;
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (connector, _listener) = memory_network();
    let mut config = TransportConfig::testing(TEST_URL);
    config.pong_timeout = config.ping_interval;
    assert!(Transport::spawn(config, Arc::new(connector), None).is_err());
}
