//! WebSocket gateway
//!
//! Accepts sockets, runs the `ConnectionInit` handshake against an
//! [`Authenticator`], and dispatches `RpcCall`s to an [`RpcHandler`]. Each
//! socket gets a reader loop on its own task and a writer task fed through
//! the registry's [`ChannelSink`], so fan-out from anywhere in the server is
//! a non-blocking channel send.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::accept_async_with_config;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

use crate::registry::{ChannelSink, CloseReason, ConnectionRegistry, SinkMessage};
use tether_core::{
    AuthError, Body, ConnectionId, Envelope, MessageIdGenerator, Method, RpcFailure, ServerConfig,
    SessionRef, TetherResult, TopicId, TransportError, UserId,
};

// ----------------------------------------------------------------------------
// Collaborators
// ----------------------------------------------------------------------------

/// Validates `ConnectionInit` tokens
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
    async fn authenticate(&self, token: &str) -> Result<SessionRef, AuthError>;
}

/// Application method dispatch
#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        session: SessionRef,
        method: Method,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, RpcFailure>;
}

// ----------------------------------------------------------------------------
// Gateway
// ----------------------------------------------------------------------------

struct GatewayInner {
    config: ServerConfig,
    registry: ConnectionRegistry,
    authenticator: Arc<dyn Authenticator>,
    handler: Arc<dyn RpcHandler>,
    ids: MessageIdGenerator,
    shutdown: watch::Sender<bool>,
}

/// Cloneable websocket front end over a [`ConnectionRegistry`]
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        config: ServerConfig,
        registry: ConnectionRegistry,
        authenticator: Arc<dyn Authenticator>,
        handler: Arc<dyn RpcHandler>,
    ) -> TetherResult<Self> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            inner: Arc::new(GatewayInner {
                config,
                registry,
                authenticator,
                handler,
                ids: MessageIdGenerator::new(),
                shutdown,
            }),
        })
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    /// Accept sockets until [`shutdown`](Self::shutdown)
    pub async fn serve(&self, listener: TcpListener) -> TetherResult<()> {
        let mut shutdown = self.inner.shutdown.subscribe();
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "gateway listening");
        }
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let gateway = self.clone();
                        tokio::spawn(async move {
                            if let Err(error) = gateway.handle_stream(stream, addr).await {
                                warn!(%addr, %error, "connection error");
                            }
                        });
                    }
                    Err(error) => warn!(%error, "accept failed"),
                },
                _ = shutdown.changed() => {}
            }
        }
        info!("gateway stopped accepting");
        Ok(())
    }

    /// Stop accepting and close every socket
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let closed = self.inner.registry.close_all(CloseReason::ServerShutdown);
        info!(closed, "gateway shut down");
    }

    /// Push an update batch to every socket of a user
    pub fn push_updates(&self, user_id: UserId, payload: Vec<u8>) -> TetherResult<usize> {
        let envelope = self.server_envelope(Body::Updates { payload });
        self.inner.registry.send_to_user(user_id, &envelope)
    }

    /// Push an update batch to every subscriber of a topic
    pub fn publish_updates(&self, topic: TopicId, payload: Vec<u8>) -> TetherResult<usize> {
        let envelope = self.server_envelope(Body::Updates { payload });
        self.inner.registry.publish_to_topic(topic, &envelope)
    }

    fn server_envelope(&self, body: Body) -> Envelope {
        Envelope::new(self.inner.ids.next_id(), body)
    }

    fn reply(&self, id: ConnectionId, body: Body) {
        let envelope = self.server_envelope(body);
        if let Err(error) = self.inner.registry.send_to(id, &envelope) {
            debug!(%id, %error, "reply dropped");
        }
    }

    // ------------------------------------------------------------------------
    // Per-Socket Handling
    // ------------------------------------------------------------------------

    /// Upgrade one TCP stream and serve it until either side closes
    pub async fn handle_stream(&self, stream: TcpStream, addr: SocketAddr) -> TetherResult<()> {
        let ws_config = WebSocketConfig {
            max_message_size: Some(self.inner.config.max_frame_size),
            max_frame_size: Some(self.inner.config.max_frame_size),
            ..WebSocketConfig::default()
        };
        let socket = accept_async_with_config(stream, Some(ws_config))
            .await
            .map_err(|e| TransportError::ConnectFailed {
                reason: e.to_string(),
            })?;
        let (mut write, mut read) = socket.split();

        let (sink, mut outbound) = ChannelSink::new();
        let id = self.inner.registry.add_connection(Arc::new(sink));
        debug!(%id, %addr, "socket accepted");

        let mut writer = tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                match message {
                    SinkMessage::Frame(bytes) => {
                        if write.send(Message::Binary(bytes)).await.is_err() {
                            break;
                        }
                    }
                    SinkMessage::Close(reason) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(reason.code()),
                            reason: Cow::Borrowed(reason.as_str()),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = write.close().await;
        });

        let mut close_reason = CloseReason::ClientClosed;
        let mut writer_done = false;
        loop {
            tokio::select! {
                message = read.next() => match message {
                    Some(Ok(Message::Binary(bytes))) => {
                        if !self.handle_frame(id, &bytes).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(_))) => debug!(%id, "ignoring text frame"),
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(%id, %error, "socket read failed");
                        close_reason = CloseReason::Error;
                        break;
                    }
                },
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            }
        }

        self.inner.registry.remove_connection(id, close_reason);
        if !writer_done {
            let _ = writer.await;
        }
        debug!(%id, %addr, "socket finished");
        Ok(())
    }

    /// Returns false once the socket should stop being read
    async fn handle_frame(&self, id: ConnectionId, bytes: &[u8]) -> bool {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%id, len = bytes.len(), %error, "dropping malformed frame");
                return true;
            }
        };
        trace!(%id, envelope = envelope.id, kind = envelope.body.kind(), "frame received");

        match envelope.body {
            Body::ConnectionInit { token } => self.handle_init(id, envelope.id, &token).await,
            Body::RpcCall { method, input } => {
                self.handle_call(id, envelope.id, method, input);
                true
            }
            other => {
                warn!(%id, kind = other.kind(), "unexpected envelope from client");
                true
            }
        }
    }

    async fn handle_init(&self, id: ConnectionId, init_id: u64, token: &str) -> bool {
        if self.inner.registry.session_of(id).is_some() {
            debug!(%id, "repeated connection init ignored");
            return true;
        }

        match self.inner.authenticator.authenticate(token).await {
            Ok(session) => {
                if let Err(error) = self.inner.registry.authenticate_connection(id, session) {
                    // Closed by the auth timeout while the token was checked, or already bound
                    debug!(%id, %error, "authentication not applied");
                    return false;
                }
                self.reply(id, Body::ConnectionOpen);
                info!(%id, user = %session.user_id, session = %session.session_id, "connection open");
                true
            }
            Err(error) => {
                info!(%id, %error, "connection init rejected");
                let failure = RpcFailure::unauthorized(error.to_string());
                self.reply(
                    id,
                    Body::RpcError {
                        req_id: init_id,
                        code: failure.code,
                        message: failure.message,
                    },
                );
                self.inner
                    .registry
                    .close_connection(id, CloseReason::AuthFailed);
                false
            }
        }
    }

    /// Calls run concurrently; replies carry the call's envelope id
    fn handle_call(&self, id: ConnectionId, req_id: u64, method: Method, input: Vec<u8>) {
        let Some(session) = self.inner.registry.session_of(id) else {
            let failure =
                RpcFailure::unauthorized(AuthError::NotAuthenticated { connection_id: id }.to_string());
            debug!(%id, ?method, "call before authentication");
            self.reply(
                id,
                Body::RpcError {
                    req_id,
                    code: failure.code,
                    message: failure.message,
                },
            );
            return;
        };

        let gateway = self.clone();
        tokio::spawn(async move {
            let body = match gateway.inner.handler.handle(session, method, input).await {
                Ok(result) => Body::RpcResult { req_id, result },
                Err(failure) => {
                    debug!(%id, ?method, code = ?failure.code, "call failed");
                    Body::RpcError {
                        req_id,
                        code: failure.code,
                        message: failure.message,
                    }
                }
            };
            gateway.reply(id, body);
        });
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("registry", &self.inner.registry)
            .finish()
    }
}
