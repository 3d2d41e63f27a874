//! Transport state machine
//!
//! The transport owns the physical socket and runs as a single task; every
//! field below is touched only from that task. Callers talk to it through a
//! cloneable [`TransportHandle`] and observe it through [`TransportEvent`]s
//! and a `watch` channel of [`TransportStatus`].
//!
//! ```text
//!   Disconnected ──connect()──▶ Connecting ──socket open──▶ Connected
//!        ▲                          │                           │
//!        └──── timeout / error ─────┴──── close / error / ──────┘
//!                                         missed pongs
//! ```
//!
//! While running, every drop into `Disconnected` schedules exactly one
//! reconnect. Foreground transitions and network-transition errors use the
//! short fixed delay; everything else follows capped exponential backoff
//! with jitter. Losing reachability tears the socket down and waits for it to
//! return. A backgrounded app keeps its socket for a grace window and then
//! closes it until the next foreground. `stop()` ends the task.

mod backoff;
mod state;

pub use backoff::{ReconnectGuard, ReconnectPolicy, ReconnectTrigger};
pub use state::{ConnectionState, TransportEvent, TransportStatus};

use rand::rngs::StdRng;
use rand::SeedableRng;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::lifecycle::{LifecycleEvent, LifecycleReceiver};
use crate::socket::{Connector, SocketFrame, SocketPair, SocketSink, SocketStream};
use tether_core::{TetherResult, TransportConfig, TransportError};

// ----------------------------------------------------------------------------
// Handle
// ----------------------------------------------------------------------------

enum TransportCommand {
    Start,
    Connect,
    EnsureConnected,
    Send {
        frame: Vec<u8>,
        reply: oneshot::Sender<Result<(), TransportError>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running transport task
#[derive(Debug, Clone)]
pub struct TransportHandle {
    commands: mpsc::UnboundedSender<TransportCommand>,
    status: watch::Receiver<TransportStatus>,
    guard: Arc<ReconnectGuard>,
}

impl std::fmt::Debug for TransportCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportCommand::Start => "Start",
            TransportCommand::Connect => "Connect",
            TransportCommand::EnsureConnected => "EnsureConnected",
            TransportCommand::Send { .. } => "Send",
            TransportCommand::Stop { .. } => "Stop",
        };
        f.write_str(name)
    }
}

impl TransportHandle {
    /// Begin observing lifecycle events and connect. Idempotent.
    pub fn start(&self) {
        let _ = self.commands.send(TransportCommand::Start);
    }

    /// Connect now if disconnected
    pub fn connect(&self) {
        let _ = self.commands.send(TransportCommand::Connect);
    }

    /// Ping if connected, reconnect if disconnected
    pub fn ensure_connected(&self) {
        let _ = self.commands.send(TransportCommand::EnsureConnected);
    }

    /// Write one binary frame; fails with `NotConnected` unless connected
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(TransportCommand::Send { frame, reply })
            .map_err(|_| TransportError::Stopped)?;
        rx.await.map_err(|_| TransportError::Stopped)?
    }

    /// Tear everything down and disable reconnects. Resolves once the task
    /// has released the socket.
    pub async fn stop(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(TransportCommand::Stop { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn status(&self) -> TransportStatus {
        *self.status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<TransportStatus> {
        self.status.clone()
    }

    /// Whether a reconnect is currently scheduled
    pub fn is_reconnecting(&self) -> bool {
        self.guard.in_progress()
    }
}

// ----------------------------------------------------------------------------
// Transport Task
// ----------------------------------------------------------------------------

struct ConnectOutcome {
    attempt: u64,
    result: Result<SocketPair, TransportError>,
}

#[derive(Debug, Default)]
struct Liveness {
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
    failures: u32,
    /// Set while a verification ping from `ensure_connected` is outstanding
    verifying: Option<ReconnectTrigger>,
}

impl Liveness {
    fn armed(next_ping: Instant) -> Self {
        Self {
            next_ping: Some(next_ping),
            ..Self::default()
        }
    }

    fn pong_received(&mut self) {
        self.pong_deadline = None;
        self.failures = 0;
        self.verifying = None;
    }
}

/// Transport task state
pub struct Transport {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    guard: Arc<ReconnectGuard>,
    rng: StdRng,

    commands: mpsc::UnboundedReceiver<TransportCommand>,
    lifecycle: Option<LifecycleReceiver>,
    events: mpsc::UnboundedSender<TransportEvent>,
    status_tx: watch::Sender<TransportStatus>,
    outcomes_tx: mpsc::UnboundedSender<ConnectOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<ConnectOutcome>,

    running: bool,
    state: ConnectionState,
    network_available: bool,
    constrained: bool,
    in_background: bool,
    /// Torn down after the background grace window; stays down until foreground
    suspended: bool,
    retry_count: u32,

    sink: Option<Box<dyn SocketSink>>,
    stream: Option<Box<dyn SocketStream>>,
    attempt: u64,
    attempt_trigger: ReconnectTrigger,
    connect_task: Option<JoinHandle<()>>,
    connect_deadline: Option<Instant>,
    reconnect_at: Option<Instant>,
    reconnect_trigger: ReconnectTrigger,
    liveness: Liveness,
    background_deadline: Option<Instant>,
}

impl Transport {
    /// Spawn the transport task. Nothing connects until `start()`.
    pub fn spawn(
        config: TransportConfig,
        connector: Arc<dyn Connector>,
        lifecycle: Option<LifecycleReceiver>,
    ) -> TetherResult<(TransportHandle, mpsc::UnboundedReceiver<TransportEvent>)> {
        config.validate()?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(TransportStatus::default());
        let guard = Arc::new(ReconnectGuard::default());

        let transport = Transport {
            policy: ReconnectPolicy::new(config.reconnect.clone()),
            config,
            connector,
            guard: guard.clone(),
            rng: StdRng::from_entropy(),
            commands: commands_rx,
            lifecycle,
            events: events_tx,
            status_tx,
            outcomes_tx,
            outcomes_rx,
            running: false,
            state: ConnectionState::Disconnected,
            network_available: true,
            constrained: false,
            in_background: false,
            suspended: false,
            retry_count: 0,
            sink: None,
            stream: None,
            attempt: 0,
            attempt_trigger: ReconnectTrigger::Initial,
            connect_task: None,
            connect_deadline: None,
            reconnect_at: None,
            reconnect_trigger: ReconnectTrigger::Failure,
            liveness: Liveness::default(),
            background_deadline: None,
        };
        tokio::spawn(transport.run());

        Ok((
            TransportHandle {
                commands: commands_tx,
                status: status_rx,
                guard,
            },
            events_rx,
        ))
    }

    async fn run(mut self) {
        debug!(url = %self.config.url, "transport task started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                event = next_lifecycle(&mut self.lifecycle), if self.lifecycle.is_some() => match event {
                    Some(event) => self.handle_lifecycle(event).await,
                    None => self.lifecycle = None,
                },
                Some(outcome) = self.outcomes_rx.recv() => self.handle_connect_outcome(outcome).await,
                frame = next_frame(&mut self.stream), if self.stream.is_some() => self.handle_frame(frame),
                _ = sleep_until_opt(self.connect_deadline) => self.handle_connect_timeout(),
                _ = sleep_until_opt(self.reconnect_at) => self.fire_reconnect(),
                _ = sleep_until_opt(self.liveness.next_ping) => self.send_ping().await,
                _ = sleep_until_opt(self.liveness.pong_deadline) => self.handle_missed_pong(),
                _ = sleep_until_opt(self.background_deadline) => self.handle_background_expired(),
            }
        }
        debug!("transport task finished");
    }

    async fn handle_command(&mut self, command: TransportCommand) -> bool {
        match command {
            TransportCommand::Start => self.start(),
            TransportCommand::Connect => self.connect(ReconnectTrigger::Initial),
            TransportCommand::EnsureConnected => {
                self.ensure_connected(ReconnectTrigger::NetworkTransition)
                    .await
            }
            TransportCommand::Send { frame, reply } => {
                let result = self.send_frame(frame).await;
                let _ = reply.send(result);
            }
            TransportCommand::Stop { ack } => {
                self.shutdown();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn start(&mut self) {
        if self.running {
            debug!("transport already running");
            return;
        }
        info!(url = %self.config.url, "transport starting");
        self.running = true;
        if self.network_available {
            self.connect(ReconnectTrigger::Initial);
        }
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.cancel_reconnect();
        self.background_deadline = None;
        self.lifecycle = None;
        self.close_socket();
        self.set_state(ConnectionState::Disconnected);
        info!("transport stopped");
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    fn connect_timeout_for(&self, trigger: ReconnectTrigger) -> Duration {
        if self.constrained {
            self.config.constrained_connect_timeout
        } else if trigger == ReconnectTrigger::Foreground {
            self.config.foreground_connect_timeout
        } else {
            self.config.connect_timeout
        }
    }

    fn connect(&mut self, trigger: ReconnectTrigger) {
        if !self.running || self.state != ConnectionState::Disconnected {
            debug!(state = %self.state, "connect ignored");
            return;
        }
        self.cancel_reconnect();
        self.close_socket();

        self.attempt += 1;
        self.attempt_trigger = trigger;
        let timeout = self.connect_timeout_for(trigger);
        self.connect_deadline = Some(Instant::now() + timeout);
        self.set_state(ConnectionState::Connecting);
        info!(
            attempt = self.attempt,
            ?trigger,
            timeout_ms = timeout.as_millis() as u64,
            "connecting"
        );

        let connector = self.connector.clone();
        let url = self.config.url.clone();
        let outcomes = self.outcomes_tx.clone();
        let attempt = self.attempt;
        self.connect_task = Some(tokio::spawn(async move {
            let result = connector.connect(&url).await;
            let _ = outcomes.send(ConnectOutcome { attempt, result });
        }));
    }

    async fn handle_connect_outcome(&mut self, outcome: ConnectOutcome) {
        if outcome.attempt != self.attempt || self.state != ConnectionState::Connecting {
            debug!(attempt = outcome.attempt, "discarding stale connect outcome");
            if let Ok((mut sink, _)) = outcome.result {
                sink.close().await;
            }
            return;
        }
        self.connect_task = None;
        self.connect_deadline = None;

        match outcome.result {
            Ok((sink, stream)) => {
                self.sink = Some(sink);
                self.stream = Some(stream);
                if self.attempt_trigger == ReconnectTrigger::Foreground {
                    self.retry_count = 0;
                }
                self.liveness = Liveness::armed(Instant::now() + self.config.ping_interval);
                self.set_state(ConnectionState::Connected);
                info!(attempt = self.attempt, "connected");
            }
            Err(error) => {
                warn!(attempt = self.attempt, %error, "connect failed");
                let trigger = ReconnectTrigger::for_error(&error);
                self.handle_disconnection(error, trigger);
            }
        }
    }

    fn handle_connect_timeout(&mut self) {
        self.connect_deadline = None;
        if self.state != ConnectionState::Connecting {
            return;
        }
        let duration_ms = self.connect_timeout_for(self.attempt_trigger).as_millis() as u64;
        warn!(attempt = self.attempt, duration_ms, "connect timed out");
        self.handle_disconnection(
            TransportError::ConnectTimeout { duration_ms },
            ReconnectTrigger::Failure,
        );
    }

    // ------------------------------------------------------------------------
    // Disconnecting and Reconnecting
    // ------------------------------------------------------------------------

    fn handle_disconnection(&mut self, error: TransportError, trigger: ReconnectTrigger) {
        let previous = self.state;
        self.close_socket();
        self.set_state(ConnectionState::Disconnected);
        if previous != ConnectionState::Disconnected {
            info!(from = %previous, %error, "disconnected");
        }

        if self.should_reconnect() {
            self.schedule_reconnect(trigger);
        } else {
            debug!(
                running = self.running,
                network_available = self.network_available,
                suspended = self.suspended,
                "not reconnecting"
            );
        }
    }

    fn should_reconnect(&self) -> bool {
        self.running && self.network_available && !self.suspended
    }

    fn schedule_reconnect(&mut self, trigger: ReconnectTrigger) {
        if !self.guard.try_begin() {
            debug!("reconnect already scheduled");
            return;
        }
        let delay = self.policy.delay(trigger, self.retry_count, &mut self.rng);
        if trigger.uses_backoff() {
            self.retry_count = self.retry_count.saturating_add(1);
        }
        self.reconnect_at = Some(Instant::now() + delay);
        self.reconnect_trigger = trigger;
        info!(
            delay_ms = delay.as_millis() as u64,
            retry_count = self.retry_count,
            ?trigger,
            "reconnect scheduled"
        );
        self.publish();
    }

    fn fire_reconnect(&mut self) {
        self.reconnect_at = None;
        self.guard.finish();
        if self.should_reconnect() {
            self.connect(self.reconnect_trigger);
        }
    }

    fn cancel_reconnect(&mut self) {
        if self.reconnect_at.take().is_some() {
            self.guard.finish();
        }
    }

    /// Drop the socket and every timer tied to it
    fn close_socket(&mut self) {
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.connect_deadline = None;
        self.liveness = Liveness::default();
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            // A stalled sink is dropped once the write deadline passes
            let limit = self.config.send_timeout;
            tokio::spawn(async move {
                let _ = timeout(limit, sink.close()).await;
            });
        }
    }

    async fn ensure_connected(&mut self, trigger: ReconnectTrigger) {
        if !self.running || !self.network_available || self.suspended {
            return;
        }
        match self.state {
            ConnectionState::Disconnected => {
                self.cancel_reconnect();
                self.connect(trigger);
            }
            ConnectionState::Connecting => debug!("connect already in progress"),
            ConnectionState::Connected => self.verify_connection(trigger).await,
        }
    }

    // ------------------------------------------------------------------------
    // Liveness
    // ------------------------------------------------------------------------

    /// Fast ping; a missing pong reconnects immediately
    async fn verify_connection(&mut self, trigger: ReconnectTrigger) {
        if self.liveness.pong_deadline.is_some() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match timeout(self.config.fast_ping_timeout, sink.ping()).await {
            Ok(Ok(())) => {
                self.liveness.verifying = Some(trigger);
                self.liveness.pong_deadline = Some(Instant::now() + self.config.fast_ping_timeout);
            }
            Ok(Err(error)) => self.handle_disconnection(error, trigger),
            Err(_) => {
                warn!("verification ping stalled");
                self.handle_disconnection(TransportError::PingTimeout { failures: 1 }, trigger);
            }
        }
    }

    async fn send_ping(&mut self) {
        self.liveness.next_ping = Some(Instant::now() + self.config.ping_interval);
        if self.liveness.pong_deadline.is_some() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match timeout(self.config.pong_timeout, sink.ping()).await {
            Ok(Ok(())) => {
                self.liveness.pong_deadline = Some(Instant::now() + self.config.pong_timeout);
            }
            Ok(Err(error)) => {
                debug!(%error, "ping failed");
                self.record_ping_failure();
            }
            Err(_) => {
                debug!("ping write stalled");
                self.record_ping_failure();
            }
        }
    }

    fn handle_missed_pong(&mut self) {
        self.liveness.pong_deadline = None;
        if let Some(trigger) = self.liveness.verifying.take() {
            warn!("connection verification failed");
            self.handle_disconnection(TransportError::PingTimeout { failures: 1 }, trigger);
            return;
        }
        self.record_ping_failure();
    }

    fn record_ping_failure(&mut self) {
        self.liveness.failures += 1;
        let failures = self.liveness.failures;
        warn!(failures, "missed pong");
        if failures >= self.config.max_ping_failures {
            self.handle_disconnection(
                TransportError::PingTimeout { failures },
                ReconnectTrigger::Failure,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Socket I/O
    // ------------------------------------------------------------------------

    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let Some(sink) = self.sink.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        let limit = self.config.send_timeout;
        let outcome = match timeout(limit, sink.send(frame)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::SendFailed {
                reason: format!("write stalled for {}ms", limit.as_millis()),
            }),
        };
        match outcome {
            Ok(()) => Ok(()),
            Err(error) => {
                warn!(%error, "send failed");
                let trigger = ReconnectTrigger::for_error(&error);
                self.handle_disconnection(error.clone(), trigger);
                Err(error)
            }
        }
    }

    fn handle_frame(&mut self, frame: Option<Result<SocketFrame, TransportError>>) {
        match frame {
            Some(Ok(SocketFrame::Binary(bytes))) => {
                let _ = self.events.send(TransportEvent::Frame(bytes));
            }
            Some(Ok(SocketFrame::Pong)) => self.liveness.pong_received(),
            Some(Ok(SocketFrame::Closed { code, reason })) => {
                info!(?code, %reason, "socket closed by server");
                self.handle_disconnection(
                    TransportError::Closed { code, reason },
                    ReconnectTrigger::Failure,
                );
            }
            Some(Err(error)) => {
                warn!(%error, "receive failed");
                let trigger = ReconnectTrigger::for_error(&error);
                self.handle_disconnection(error, trigger);
            }
            None => {
                let error = TransportError::ConnectionLost {
                    reason: "socket stream ended".to_string(),
                };
                self.handle_disconnection(error, ReconnectTrigger::NetworkTransition);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    async fn handle_lifecycle(&mut self, event: LifecycleEvent) {
        debug!(?event, state = %self.state, "lifecycle event");
        match event {
            LifecycleEvent::AppForegrounded => {
                self.in_background = false;
                self.background_deadline = None;
                self.suspended = false;
                self.ensure_connected(ReconnectTrigger::Foreground).await;
            }
            LifecycleEvent::AppBackgrounded => {
                self.in_background = true;
                if self.running {
                    self.background_deadline = Some(Instant::now() + self.config.background_grace);
                }
            }
            LifecycleEvent::NetworkAvailable { constrained } => {
                self.constrained = constrained;
                if !self.network_available {
                    self.network_available = true;
                    self.publish();
                }
                self.ensure_connected(ReconnectTrigger::NetworkTransition)
                    .await;
            }
            LifecycleEvent::NetworkUnavailable => {
                self.network_available = false;
                self.cancel_reconnect();
                if self.state == ConnectionState::Disconnected {
                    self.publish();
                } else {
                    self.handle_disconnection(
                        TransportError::NotConnectedToInternet,
                        ReconnectTrigger::NetworkTransition,
                    );
                }
            }
        }
    }

    fn handle_background_expired(&mut self) {
        self.background_deadline = None;
        if !self.in_background || !self.running {
            return;
        }
        info!("background grace elapsed, closing socket");
        self.suspended = true;
        self.cancel_reconnect();
        if self.state != ConnectionState::Disconnected {
            self.close_socket();
            self.set_state(ConnectionState::Disconnected);
        }
    }

    // ------------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------------

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "transport state");
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        let status = TransportStatus {
            state: self.state,
            network_available: self.network_available,
            retry_count: self.retry_count,
        };
        if *self.status_tx.borrow() == status {
            return;
        }
        self.status_tx.send_replace(status);
        let _ = self.events.send(TransportEvent::StateChanged(status));
    }
}

async fn next_lifecycle(lifecycle: &mut Option<LifecycleReceiver>) -> Option<LifecycleEvent> {
    match lifecycle {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn next_frame(
    stream: &mut Option<Box<dyn SocketStream>>,
) -> Option<Result<SocketFrame, TransportError>> {
    match stream {
        Some(stream) => stream.recv().await,
        None => pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
