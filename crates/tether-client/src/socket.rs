//! Socket abstraction used by the transport
//!
//! A [`Connector`] opens one physical connection and hands back its two
//! halves. The transport owns both halves and drives them from its own task:
//! the sink for outbound frames and pings, the stream for inbound frames,
//! pongs and closure.

use async_trait::async_trait;
use tether_core::TransportError;

/// Inbound event read from a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    Binary(Vec<u8>),
    Pong,
    Closed { code: Option<u16>, reason: String },
}

/// Write half of an open socket
#[async_trait]
pub trait SocketSink: Send {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Send a transport-level ping; the pong arrives on the stream half
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Best-effort close handshake
    async fn close(&mut self);
}

/// Read half of an open socket; `None` once the socket is gone
#[async_trait]
pub trait SocketStream: Send {
    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>>;
}

pub type SocketPair = (Box<dyn SocketSink>, Box<dyn SocketStream>);

/// Opens sockets for the transport
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<SocketPair, TransportError>;
}
