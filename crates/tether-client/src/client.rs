//! Client facade
//!
//! [`ClientBuilder`] wires a transport, an RPC runtime and their collaborators
//! together; [`RealtimeClient`] is the cloneable handle applications call.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::lifecycle::LifecycleReceiver;
use crate::rpc::{
    RealtimeState, RpcRuntime, RuntimeCommand, RuntimeStats, StaticToken, TokenProvider,
    UpdatesSink,
};
use crate::socket::Connector;
use crate::transport::{Transport, TransportHandle};
use crate::websocket::WebSocketConnector;
use tether_core::{
    AuthError, ClientConfig, Envelope, Method, MessageIdGenerator, OutboundQueue, TetherError,
    TetherResult,
};

// ----------------------------------------------------------------------------
// Builder
// ----------------------------------------------------------------------------

/// Assembles a [`RealtimeClient`]
pub struct ClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    updates: Option<Arc<dyn UpdatesSink>>,
    lifecycle: Option<LifecycleReceiver>,
}

impl ClientBuilder {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            connector: None,
            token_provider: None,
            updates: None,
            lifecycle: None,
        }
    }

    /// Defaults to [`WebSocketConnector`]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    pub fn token<T: Into<String>>(self, token: T) -> Self {
        self.token_provider(Arc::new(StaticToken(token.into())))
    }

    pub fn updates_sink(mut self, sink: Arc<dyn UpdatesSink>) -> Self {
        self.updates = Some(sink);
        self
    }

    pub fn lifecycle(mut self, lifecycle: LifecycleReceiver) -> Self {
        self.lifecycle = Some(lifecycle);
        self
    }

    /// Spawn the transport and runtime tasks and begin connecting
    pub async fn start(self) -> TetherResult<RealtimeClient> {
        self.config.validate()?;
        let token_provider = self.token_provider.ok_or(AuthError::MissingToken)?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WebSocketConnector::new()));

        let (transport, transport_events) =
            Transport::spawn(self.config.transport.clone(), connector, self.lifecycle)?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(RealtimeState::Connecting);
        let ids = Arc::new(MessageIdGenerator::new());

        let runtime = RpcRuntime::new(
            transport.clone(),
            transport_events,
            commands_rx,
            Arc::new(OutboundQueue::new()),
            ids.clone(),
            token_provider,
            self.updates,
            state_tx,
        );
        tokio::spawn(runtime.run());

        transport.start();
        info!(url = %self.config.transport.url, "realtime client started");

        Ok(RealtimeClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                transport,
                commands: commands_tx,
                state: state_rx,
                ids,
            }),
        })
    }
}

// ----------------------------------------------------------------------------
// Client
// ----------------------------------------------------------------------------

struct ClientInner {
    config: ClientConfig,
    transport: TransportHandle,
    commands: mpsc::UnboundedSender<RuntimeCommand>,
    state: watch::Receiver<RealtimeState>,
    ids: Arc<MessageIdGenerator>,
}

/// Handle to a running realtime client
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.inner.config.transport.url)
            .field("state", &*self.inner.state.borrow())
            .finish()
    }
}

impl RealtimeClient {
    /// Call a method. Queued while offline and sent once a session opens;
    /// resolves with the result bytes or the server's error.
    pub async fn invoke(&self, method: Method, input: Vec<u8>) -> TetherResult<Vec<u8>> {
        self.call(method, input, false).await
    }

    /// Like [`invoke`](Self::invoke) but fails with `NotConnected` instead of
    /// queueing when no session is open
    pub async fn invoke_if_connected(
        &self,
        method: Method,
        input: Vec<u8>,
    ) -> TetherResult<Vec<u8>> {
        self.call(method, input, true).await
    }

    async fn call(
        &self,
        method: Method,
        input: Vec<u8>,
        require_connected: bool,
    ) -> TetherResult<Vec<u8>> {
        let id = self.inner.ids.next_id();
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(RuntimeCommand::Invoke {
                envelope: Envelope::rpc_call(id, method, input),
                reply,
                require_connected,
            })
            .map_err(|_| TetherError::Stopped)?;
        debug!(id, ?method, "invoke");

        match self.inner.config.runtime.rpc_timeout {
            None => rx.await.map_err(|_| TetherError::Stopped)?,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome.map_err(|_| TetherError::Stopped)?,
                Err(_) => {
                    let _ = self.inner.commands.send(RuntimeCommand::Abandon { id });
                    Err(TetherError::Timeout {
                        duration_ms: limit.as_millis() as u64,
                    })
                }
            },
        }
    }

    pub fn state(&self) -> RealtimeState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RealtimeState> {
        self.inner.state.clone()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for_state<F>(&self, mut predicate: F) -> TetherResult<RealtimeState>
    where
        F: FnMut(RealtimeState) -> bool,
    {
        let mut rx = self.watch_state();
        let state = rx
            .wait_for(|state| predicate(*state))
            .await
            .map_err(|_| TetherError::Stopped)?;
        Ok(*state)
    }

    pub async fn stats(&self) -> TetherResult<RuntimeStats> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .commands
            .send(RuntimeCommand::Stats { reply })
            .map_err(|_| TetherError::Stopped)?;
        rx.await.map_err(|_| TetherError::Stopped)
    }

    /// Reconnect or verify the socket, for example after the app resumes
    pub fn ensure_connected(&self) {
        self.inner.transport.ensure_connected();
    }

    /// Stop for good: close the socket, drop queued and pending calls
    pub async fn stop(&self) {
        let (ack, rx) = oneshot::channel();
        if self.inner.commands.send(RuntimeCommand::Stop { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.inner.transport
    }
}
