//! Presence tracker
//!
//! Derives a user's online/offline status from session activity. Socket
//! opens mark the session active but never mark the user online; that is the
//! client's call through [`PresenceTracker::update_user_online_status`]. A
//! socket close marks the session inactive and, after a debounce that is
//! cancelled and replaced by every further close of the same user, flips the
//! user offline if no recently-active session remains.
//!
//! State lives in a single worker task. The handle only sends it commands.

use hashbrown::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::store::{
    PresenceNotifier, PresenceState, PresenceUpdate, SessionObserver, SessionStore, UserStore,
};
use tether_core::{
    PresenceConfig, SessionId, SessionRef, StoreError, SystemTimeSource, TetherError,
    TetherResult, TimeSource, UserId,
};

enum PresenceCommand {
    Opened(SessionRef),
    Closed(SessionRef),
    Heartbeat(SessionId),
    SetOnline {
        user_id: UserId,
        online: bool,
        reply: oneshot::Sender<Result<PresenceState, StoreError>>,
    },
    ActiveCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the presence worker
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    commands: mpsc::UnboundedSender<PresenceCommand>,
}

impl std::fmt::Debug for PresenceCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresenceCommand::Opened(session) => write!(f, "Opened({})", session.session_id),
            PresenceCommand::Closed(session) => write!(f, "Closed({})", session.session_id),
            PresenceCommand::Heartbeat(session_id) => write!(f, "Heartbeat({})", session_id),
            PresenceCommand::SetOnline { user_id, online, .. } => {
                write!(f, "SetOnline({}, {})", user_id, online)
            }
            PresenceCommand::ActiveCount { .. } => f.write_str("ActiveCount"),
            PresenceCommand::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

impl PresenceTracker {
    pub fn spawn(
        config: PresenceConfig,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        notifier: Arc<dyn PresenceNotifier>,
    ) -> Self {
        Self::spawn_with_time_source(config, sessions, users, notifier, Arc::new(SystemTimeSource))
    }

    pub fn spawn_with_time_source(
        config: PresenceConfig,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        notifier: Arc<dyn PresenceNotifier>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (evaluations_tx, evaluations_rx) = mpsc::unbounded_channel();
        let worker = PresenceWorker {
            config,
            sessions,
            users,
            notifier,
            time,
            commands: commands_rx,
            evaluations_tx,
            evaluations_rx,
            active: HashSet::new(),
            pending: HashMap::new(),
            generation: 0,
        };
        tokio::spawn(worker.run());
        Self {
            commands: commands_tx,
        }
    }

    /// An authenticated socket opened for this session
    pub fn handle_connection_open(&self, session: SessionRef) {
        let _ = self.commands.send(PresenceCommand::Opened(session));
    }

    /// An authenticated socket of this session closed
    pub fn handle_connection_close(&self, session: SessionRef) {
        let _ = self.commands.send(PresenceCommand::Closed(session));
    }

    /// Refresh a session's last-active time
    pub fn session_heartbeat(&self, session_id: SessionId) {
        let _ = self.commands.send(PresenceCommand::Heartbeat(session_id));
    }

    /// Persist a user's online status and notify interested parties
    pub async fn update_user_online_status(
        &self,
        user_id: UserId,
        online: bool,
    ) -> TetherResult<PresenceState> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PresenceCommand::SetOnline {
                user_id,
                online,
                reply,
            })
            .map_err(|_| TetherError::Stopped)?;
        Ok(rx.await.map_err(|_| TetherError::Stopped)??)
    }

    /// Sessions with at least one open socket on this server
    pub async fn active_session_count(&self) -> TetherResult<usize> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(PresenceCommand::ActiveCount { reply })
            .map_err(|_| TetherError::Stopped)?;
        rx.await.map_err(|_| TetherError::Stopped)
    }

    /// Stop the worker and cancel pending evaluations
    pub async fn shutdown(&self) {
        let (ack, rx) = oneshot::channel();
        if self.commands.send(PresenceCommand::Shutdown { ack }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl SessionObserver for PresenceTracker {
    fn session_opened(&self, session: SessionRef) {
        self.handle_connection_open(session);
    }

    fn session_closed(&self, session: SessionRef) {
        self.handle_connection_close(session);
    }
}

// ----------------------------------------------------------------------------
// Worker
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Evaluation {
    user_id: UserId,
    generation: u64,
}

struct PendingEvaluation {
    generation: u64,
    timer: JoinHandle<()>,
}

struct PresenceWorker {
    config: PresenceConfig,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    notifier: Arc<dyn PresenceNotifier>,
    time: Arc<dyn TimeSource>,
    commands: mpsc::UnboundedReceiver<PresenceCommand>,
    evaluations_tx: mpsc::UnboundedSender<Evaluation>,
    evaluations_rx: mpsc::UnboundedReceiver<Evaluation>,
    /// Sessions with an open socket, re-marked active on every heartbeat
    active: HashSet<SessionId>,
    /// At most one debounce timer per user
    pending: HashMap<UserId, PendingEvaluation>,
    generation: u64,
}

impl PresenceWorker {
    async fn run(mut self) {
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(PresenceCommand::Shutdown { ack }) => {
                        self.cancel_all();
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.cancel_all();
                        break;
                    }
                },
                Some(evaluation) = self.evaluations_rx.recv() => self.evaluate(evaluation).await,
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }
        debug!("presence worker finished");
    }

    async fn handle_command(&mut self, command: PresenceCommand) {
        trace!(?command, "presence command");
        match command {
            PresenceCommand::Opened(session) => self.connection_opened(session).await,
            PresenceCommand::Closed(session) => self.connection_closed(session).await,
            PresenceCommand::Heartbeat(session_id) => {
                if let Err(error) = self.sessions.set_active(session_id, true).await {
                    error!(%session_id, %error, "failed to refresh session");
                }
            }
            PresenceCommand::SetOnline {
                user_id,
                online,
                reply,
            } => {
                let _ = reply.send(self.set_online(user_id, online).await);
            }
            PresenceCommand::ActiveCount { reply } => {
                let _ = reply.send(self.active.len());
            }
            PresenceCommand::Shutdown { .. } => {}
        }
    }

    async fn connection_opened(&mut self, session: SessionRef) {
        if let Err(error) = self.sessions.set_active(session.session_id, true).await {
            error!(session = %session.session_id, %error, "failed to mark session active");
        }
        self.active.insert(session.session_id);
    }

    async fn connection_closed(&mut self, session: SessionRef) {
        if let Err(error) = self.sessions.set_active(session.session_id, false).await {
            error!(session = %session.session_id, %error, "failed to mark session inactive");
        }
        self.active.remove(&session.session_id);
        debug!(user = %session.user_id, session = %session.session_id, "session closed");
        self.schedule_evaluation(session.user_id);
    }

    /// Cancel-and-replace the user's debounce timer
    fn schedule_evaluation(&mut self, user_id: UserId) {
        if let Some(previous) = self.pending.remove(&user_id) {
            previous.timer.abort();
        }
        self.generation += 1;
        let evaluation = Evaluation {
            user_id,
            generation: self.generation,
        };
        let delay = self.config.offline_debounce;
        let tx = self.evaluations_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(evaluation);
        });
        self.pending.insert(
            user_id,
            PendingEvaluation {
                generation: evaluation.generation,
                timer,
            },
        );
    }

    async fn evaluate(&mut self, evaluation: Evaluation) {
        let current = self
            .pending
            .get(&evaluation.user_id)
            .map(|pending| pending.generation);
        if current != Some(evaluation.generation) {
            trace!(user = %evaluation.user_id, "stale evaluation");
            return;
        }
        self.pending.remove(&evaluation.user_id);
        let user_id = evaluation.user_id;

        let sessions = match self.sessions.active_sessions_for_user(user_id).await {
            Ok(sessions) => sessions,
            Err(error) => {
                warn!(user = %user_id, %error, "failed to load sessions for evaluation");
                return;
            }
        };
        let cutoff = self
            .time
            .now()
            .saturating_sub_duration(self.config.session_active_timeout);
        let recently_active = sessions
            .iter()
            .filter(|s| s.last_active.map_or(false, |at| at >= cutoff))
            .count();
        debug!(user = %user_id, recently_active, "evaluating online status");

        if recently_active == 0 {
            info!(user = %user_id, "no active sessions, marking offline");
            if let Err(error) = self.set_online(user_id, false).await {
                error!(user = %user_id, %error, "failed to mark user offline");
            }
        }
    }

    async fn set_online(
        &mut self,
        user_id: UserId,
        online: bool,
    ) -> Result<PresenceState, StoreError> {
        let state = self.users.set_online(user_id, online).await?;
        debug!(user = %user_id, online = state.online, "user online status updated");
        self.notifier.presence_changed(PresenceUpdate {
            user_id,
            online: state.online,
            last_online: state.last_online,
        });
        Ok(state)
    }

    async fn heartbeat(&mut self) {
        if self.active.is_empty() {
            return;
        }
        let sessions: Vec<SessionId> = self.active.iter().copied().collect();
        trace!(sessions = sessions.len(), "heartbeating active sessions");
        if let Err(error) = self.sessions.set_active_bulk(&sessions, true).await {
            error!(%error, "session heartbeat failed");
        }
    }

    fn cancel_all(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.timer.abort();
        }
    }
}
