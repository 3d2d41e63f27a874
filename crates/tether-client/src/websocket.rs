//! WebSocket connector built on tokio-tungstenite

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::io::ErrorKind;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::socket::{Connector, SocketFrame, SocketPair, SocketSink, SocketStream};
use tether_core::TransportError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to `ws://` servers
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<SocketPair, TransportError> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| classify_connect_error(url, e))?;
        debug!(url, status = %response.status(), "websocket connected");

        let (write, read) = stream.split();
        Ok((
            Box::new(WebSocketWriter { write }),
            Box::new(WebSocketReader { read }),
        ))
    }
}

struct WebSocketWriter {
    write: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SocketSink for WebSocketWriter {
    async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.write
            .send(Message::Binary(frame))
            .await
            .map_err(|e| classify_io_error(e, |reason| TransportError::SendFailed { reason }))
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| classify_io_error(e, |reason| TransportError::SendFailed { reason }))
    }

    async fn close(&mut self) {
        if let Err(e) = self.write.close().await {
            trace!(error = %e, "websocket close failed");
        }
    }
}

struct WebSocketReader {
    read: SplitStream<WsStream>,
}

#[async_trait]
impl SocketStream for WebSocketReader {
    async fn recv(&mut self) -> Option<Result<SocketFrame, TransportError>> {
        loop {
            let message = match self.read.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(classify_io_error(e, |reason| {
                        TransportError::ReceiveFailed { reason }
                    })))
                }
            };

            match message {
                Message::Binary(bytes) => return Some(Ok(SocketFrame::Binary(bytes))),
                Message::Pong(_) => return Some(Ok(SocketFrame::Pong)),
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(frame) => (Some(u16::from(frame.code)), frame.reason.into_owned()),
                        None => (None, String::new()),
                    };
                    return Some(Ok(SocketFrame::Closed { code, reason }));
                }
                // tungstenite answers pings itself
                Message::Ping(_) | Message::Frame(_) => continue,
                Message::Text(_) => {
                    debug!("ignoring text frame");
                    continue;
                }
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Error Classification
// ----------------------------------------------------------------------------

fn is_connection_lost(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut
    )
}

fn classify_io_error<F>(error: tungstenite::Error, otherwise: F) -> TransportError
where
    F: FnOnce(String) -> TransportError,
{
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionLost {
                reason: error.to_string(),
            }
        }
        tungstenite::Error::Io(io) if is_connection_lost(io.kind()) => {
            TransportError::ConnectionLost {
                reason: io.to_string(),
            }
        }
        other => otherwise(other.to_string()),
    }
}

fn classify_connect_error(url: &str, error: tungstenite::Error) -> TransportError {
    match error {
        tungstenite::Error::Url(e) => TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        },
        other => classify_io_error(other, |reason| TransportError::ConnectFailed { reason }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_reset_is_transient() {
        let error = tungstenite::Error::Io(io::Error::new(ErrorKind::ConnectionReset, "reset"));
        let classified = classify_connect_error("ws://localhost:1", error);
        assert!(classified.is_network_transition());
    }

    #[test]
    fn test_refused_is_not_transient() {
        let error = tungstenite::Error::Io(io::Error::new(ErrorKind::ConnectionRefused, "refused"));
        let classified = classify_connect_error("ws://localhost:1", error);
        assert!(matches!(classified, TransportError::ConnectFailed { .. }));
        assert!(!classified.is_network_transition());
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_invalid_url() {
        let result = WebSocketConnector::new().connect("http://localhost/").await;
        assert!(matches!(result, Err(TransportError::InvalidUrl { .. })));
    }
}
