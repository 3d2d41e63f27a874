//! Single-writer RPC coordinator
//!
//! The runtime task mirrors the transport into two delivery states. It is
//! `Paused` until the socket is connected and the server has answered
//! `ConnectionInit` with `ConnectionOpen`, then `Flowing` until the transport
//! reports anything else. Only while flowing does it pop the outbound queue
//! and hand envelopes to the transport.
//!
//! Sent calls stay in the queue's in-flight set until their reply arrives.
//! When a new session opens, whatever is still in flight is moved back to
//! the head of the queue and sent again under its original id.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, trace, warn};

use super::pending::{CallOutcome, PendingCalls, Reply};
use super::{RealtimeState, TokenProvider, UpdatesSink};
use crate::transport::{ConnectionState, TransportEvent, TransportHandle, TransportStatus};
use tether_core::{
    Body, Envelope, MessageIdGenerator, OutboundQueue, RpcFailure, TetherError,
};

pub(crate) enum RuntimeCommand {
    Invoke {
        envelope: Envelope,
        reply: Reply,
        /// Fail with `NotConnected` instead of queueing while paused
        require_connected: bool,
    },
    Abandon {
        id: u64,
    },
    Stats {
        reply: oneshot::Sender<RuntimeStats>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Runtime counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub pending_calls: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub envelopes_sent: u64,
    pub envelopes_requeued: u64,
    pub replies_received: u64,
    pub malformed_frames: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Paused,
    Flowing,
}

#[derive(Debug)]
enum Handshake {
    Idle,
    AwaitingOpen { init_id: u64, token: String },
    Open,
}

pub(crate) struct RpcRuntime {
    transport: TransportHandle,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    commands: mpsc::UnboundedReceiver<RuntimeCommand>,
    queue: Arc<OutboundQueue>,
    ids: Arc<MessageIdGenerator>,
    pending: PendingCalls,
    token_provider: Arc<dyn TokenProvider>,
    updates: Option<mpsc::UnboundedSender<Vec<u8>>>,
    state_tx: watch::Sender<RealtimeState>,

    delivery: Delivery,
    handshake: Handshake,
    transport_connected: bool,
    network_available: bool,
    /// Last token the server refused; never sent again
    rejected_token: Option<String>,
    seq: u32,
    stats: RuntimeStats,
}

impl RpcRuntime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        transport: TransportHandle,
        transport_events: mpsc::UnboundedReceiver<TransportEvent>,
        commands: mpsc::UnboundedReceiver<RuntimeCommand>,
        queue: Arc<OutboundQueue>,
        ids: Arc<MessageIdGenerator>,
        token_provider: Arc<dyn TokenProvider>,
        updates: Option<Arc<dyn UpdatesSink>>,
        state_tx: watch::Sender<RealtimeState>,
    ) -> Self {
        Self {
            transport,
            transport_events,
            commands,
            queue,
            ids,
            pending: PendingCalls::new(),
            token_provider,
            updates: updates.map(spawn_updates_forwarder),
            state_tx,
            delivery: Delivery::Paused,
            handshake: Handshake::Idle,
            transport_connected: false,
            network_available: true,
            rejected_token: None,
            seq: 0,
            stats: RuntimeStats::default(),
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(RuntimeCommand::Stop { ack }) => {
                        self.stop().await;
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.stop().await;
                        break;
                    }
                },
                event = self.transport_events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => {
                        warn!("transport task ended unexpectedly");
                        self.stop().await;
                        break;
                    }
                },
            }
        }
    }

    async fn handle_command(&mut self, command: RuntimeCommand) {
        match command {
            RuntimeCommand::Invoke {
                envelope,
                reply,
                require_connected,
            } => {
                if require_connected && self.delivery == Delivery::Paused {
                    let _ = reply.send(Err(TetherError::NotConnected));
                    return;
                }
                let id = envelope.id;
                if let Err(reply) = self.pending.register(id, reply) {
                    error!(id, "envelope id already pending");
                    let _ = reply.send(Err(TetherError::channel_error(format!(
                        "duplicate envelope id {}",
                        id
                    ))));
                    return;
                }
                trace!(id, "call queued");
                self.queue.push(envelope);
                self.process_queue().await;
            }
            RuntimeCommand::Abandon { id } => {
                if self.pending.abandon(id) {
                    self.queue.remove(id);
                    debug!(id, "call abandoned");
                }
            }
            RuntimeCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            RuntimeCommand::Stop { .. } => {}
        }
    }

    fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            pending_calls: self.pending.len(),
            queued: self.queue.queued_len(),
            in_flight: self.queue.in_flight_len(),
            ..self.stats.clone()
        }
    }

    // ------------------------------------------------------------------------
    // Transport Events
    // ------------------------------------------------------------------------

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(status) => self.handle_status(status).await,
            TransportEvent::Frame(bytes) => self.handle_frame(bytes).await,
        }
    }

    async fn handle_status(&mut self, status: TransportStatus) {
        self.network_available = status.network_available;
        match status.state {
            ConnectionState::Connected => {
                if !self.transport_connected {
                    self.transport_connected = true;
                    self.authenticate().await;
                }
            }
            ConnectionState::Connecting | ConnectionState::Disconnected => {
                self.transport_connected = false;
                self.pause();
            }
        }
    }

    fn pause(&mut self) {
        if self.delivery == Delivery::Flowing {
            debug!("delivery paused");
        }
        self.delivery = Delivery::Paused;
        self.handshake = Handshake::Idle;
        if self.rejected_token.is_some() {
            // Stays AuthenticationFailed until a different token is offered
            return;
        }
        if self.network_available {
            self.set_state(RealtimeState::Connecting);
        } else {
            self.set_state(RealtimeState::WaitingForNetwork);
        }
    }

    /// Send `ConnectionInit` directly, ahead of anything queued
    async fn authenticate(&mut self) {
        self.delivery = Delivery::Paused;
        self.seq = 0;

        let Some(token) = self.token_provider.token().await else {
            warn!("no token available for connection init");
            self.set_state(RealtimeState::AuthenticationFailed);
            return;
        };
        if self.rejected_token.as_deref() == Some(token.as_str()) {
            warn!("token was refused by the server, waiting for a new one");
            self.set_state(RealtimeState::AuthenticationFailed);
            return;
        }
        self.set_state(RealtimeState::Authenticating);

        let mut envelope = Envelope::new(
            self.ids.next_id(),
            Body::ConnectionInit {
                token: token.clone(),
            },
        );
        envelope.seq = self.next_seq();
        let init_id = envelope.id;
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(error) => {
                error!(%error, "failed to encode connection init");
                return;
            }
        };

        match self.transport.send(bytes).await {
            Ok(()) => {
                debug!(init_id, "connection init sent");
                self.handshake = Handshake::AwaitingOpen { init_id, token };
            }
            Err(error) => warn!(%error, "connection init not sent"),
        }
    }

    async fn handle_frame(&mut self, bytes: Vec<u8>) {
        let envelope = match Envelope::decode(&bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.stats.malformed_frames += 1;
                warn!(len = bytes.len(), %error, "dropping malformed frame");
                return;
            }
        };
        trace!(id = envelope.id, kind = envelope.body.kind(), "frame received");

        match envelope.body {
            Body::ConnectionOpen => self.handle_connection_open().await,
            Body::RpcResult { req_id, result } => self.complete(req_id, Ok(result)),
            Body::RpcError {
                req_id,
                code,
                message,
            } => {
                let failure = RpcFailure { code, message };
                match &self.handshake {
                    Handshake::AwaitingOpen { init_id, .. } if *init_id == req_id => {
                        self.handle_init_rejected(failure)
                    }
                    _ => self.complete(req_id, Err(failure.into())),
                }
            }
            Body::Updates { payload } => self.deliver_updates(payload),
            other => warn!(kind = other.kind(), "unexpected envelope from server"),
        }
    }

    async fn handle_connection_open(&mut self) {
        if !self.transport_connected {
            debug!("connection open after disconnect, ignoring");
            return;
        }
        self.handshake = Handshake::Open;
        self.rejected_token = None;

        let requeued = self.queue.requeue_all_in_flight();
        self.stats.envelopes_requeued += requeued as u64;
        self.delivery = Delivery::Flowing;
        self.set_state(RealtimeState::Connected);
        info!(requeued, queued = self.queue.queued_len(), "session open");

        self.process_queue().await;
    }

    fn handle_init_rejected(&mut self, failure: RpcFailure) {
        warn!(code = ?failure.code, message = %failure.message, "connection init rejected");
        if let Handshake::AwaitingOpen { token, .. } =
            std::mem::replace(&mut self.handshake, Handshake::Idle)
        {
            self.rejected_token = Some(token);
        }
        self.set_state(RealtimeState::AuthenticationFailed);
    }

    fn complete(&mut self, req_id: u64, outcome: CallOutcome) {
        self.stats.replies_received += 1;
        self.queue.remove(req_id);
        if !self.pending.resolve(req_id, outcome) {
            debug!(req_id, "reply for unknown call");
        }
    }

    fn deliver_updates(&mut self, payload: Vec<u8>) {
        match &self.updates {
            Some(updates) => {
                if updates.send(payload).is_err() {
                    warn!("updates sink is gone");
                }
            }
            None => trace!("no updates sink, dropping update batch"),
        }
    }

    // ------------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------------

    async fn process_queue(&mut self) {
        while self.delivery == Delivery::Flowing {
            let Some(mut envelope) = self.queue.next() else {
                break;
            };
            envelope.seq = self.next_seq();
            let id = envelope.id;

            let bytes = match envelope.encode() {
                Ok(bytes) => bytes,
                Err(error) => {
                    error!(id, %error, "failed to encode envelope");
                    self.queue.remove(id);
                    self.pending.resolve(id, Err(error.into()));
                    continue;
                }
            };

            match self.transport.send(bytes).await {
                Ok(()) => {
                    self.stats.envelopes_sent += 1;
                    trace!(id, seq = envelope.seq, "envelope sent");
                    if !envelope.expects_reply() {
                        self.queue.remove(id);
                    }
                }
                Err(error) => {
                    debug!(id, %error, "send failed, requeueing");
                    self.queue.requeue(envelope);
                    break;
                }
            }
        }
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    async fn stop(&mut self) {
        self.delivery = Delivery::Paused;
        self.handshake = Handshake::Idle;
        self.transport.stop().await;

        self.queue.clear();
        let dropped = self.pending.clear();
        self.seq = 0;
        self.set_state(RealtimeState::Stopped);
        info!(dropped, "runtime stopped");
    }

    fn set_state(&self, state: RealtimeState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = %current, to = %state, "realtime state");
            *current = state;
            true
        });
    }
}

/// Applies update batches one at a time, in arrival order, off the runtime task
fn spawn_updates_forwarder(sink: Arc<dyn UpdatesSink>) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            sink.apply(payload).await;
        }
    });
    tx
}
