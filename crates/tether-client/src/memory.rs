//! In-process sockets
//!
//! [`memory_network`] returns a connector for the transport and a listener
//! for the other end. Each successful `connect` yields one [`MemoryPeer`] on
//! the listener side that reads client frames and writes server frames.
//! Pings are answered automatically unless the peer is made unresponsive,
//! which is how liveness failures are simulated.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use crate::socket::{Connector, SocketFrame, SocketPair, SocketSink, SocketStream};
use tether_core::TransportError;

/// Create a connected connector / listener pair
pub fn memory_network() -> (MemoryConnector, MemoryListener) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let control = Arc::new(NetworkControl::default());
    (
        MemoryConnector {
            accept_tx,
            control: control.clone(),
        },
        MemoryListener { accept_rx, control },
    )
}

#[derive(Debug, Default)]
struct NetworkControl {
    refusing: AtomicBool,
    attempts: AtomicU32,
}

// ----------------------------------------------------------------------------
// Client Side
// ----------------------------------------------------------------------------

/// Connector half of an in-process network
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    control: Arc<NetworkControl>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> Result<SocketPair, TransportError> {
        self.control.attempts.fetch_add(1, Ordering::SeqCst);
        if self.control.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed {
                reason: format!("{} refused the connection", url),
            });
        }

        let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = mpsc::unbounded_channel();
        let responsive = Arc::new(AtomicBool::new(true));

        let peer = MemoryPeer {
            incoming: to_server_rx,
            outgoing: to_client_tx,
            responsive: responsive.clone(),
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed {
                reason: "listener dropped".to_string(),
            })?;

        Ok((
            Box::new(MemorySink {
                to_server: to_server_tx,
                pongs: pong_tx,
                responsive,
            }),
            Box::new(MemoryStream {
                rx: to_client_rx,
                pongs: pong_rx,
            }),
        ))
    }
}

struct MemorySink {
    to_server: mpsc::UnboundedSender<Vec<u8>>,
    /// Loopback for automatic pongs
    pongs: mpsc::UnboundedSender<()>,
    responsive: Arc<AtomicBool>,
}

#[async_trait]
impl SocketSink for MemorySink {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.to_server
            .send(frame)
            .map_err(|_| TransportError::ConnectionLost {
                reason: "peer closed".to_string(),
            })
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.to_server.is_closed() {
            return Err(TransportError::ConnectionLost {
                reason: "peer closed".to_string(),
            });
        }
        if self.responsive.load(Ordering::SeqCst) {
            let _ = self.pongs.send(());
        } else {
            trace!("swallowing ping");
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<SocketFrame>,
    pongs: mpsc::UnboundedReceiver<()>,
}

#[async_trait]
impl SocketStream for MemoryStream {
    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        tokio::select! {
            frame = self.rx.recv() => frame.map(Ok),
            Some(()) = self.pongs.recv() => Some(Ok(SocketFrame::Pong)),
        }
    }
}

// ----------------------------------------------------------------------------
// Server Side
// ----------------------------------------------------------------------------

/// Listener half of an in-process network
#[derive(Debug)]
pub struct MemoryListener {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    control: Arc<NetworkControl>,
}

impl MemoryListener {
    /// Next connection opened by the connector
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Make subsequent connection attempts fail
    pub fn set_refusing(&self, refusing: bool) {
        self.control.refusing.store(refusing, Ordering::SeqCst);
    }

    /// Connection attempts seen so far, refused ones included
    pub fn attempts(&self) -> u32 {
        self.control.attempts.load(Ordering::SeqCst)
    }
}

/// Server end of one in-process connection. Dropping it closes the socket.
#[derive(Debug)]
pub struct MemoryPeer {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<SocketFrame>,
    responsive: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Next frame written by the client; `None` once the client dropped it
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.outgoing.send(SocketFrame::Binary(frame)).is_ok()
    }

    /// Stop answering pings
    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
    }

    /// Send a close frame and drop the connection
    pub fn close(self) {
        let _ = self.outgoing.send(SocketFrame::Closed {
            code: Some(1000),
            reason: "closed by peer".to_string(),
        });
    }
}
