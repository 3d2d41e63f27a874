//! Connection registry
//!
//! Tracks every accepted socket, which user and session it is bound to once
//! authenticated, and which users receive fan-out for which topics. All maps
//! live behind one mutex that is never held across an await; each operation
//! is atomic on its own and no ordering is implied between concurrent ones.
//!
//! Sockets that fail to authenticate within the configured window are
//! closed. Authenticated opens and closes are reported to a
//! [`SessionObserver`], normally the presence tracker, except for closes
//! caused by a logout.

use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::store::{MembershipLoader, SessionObserver};
use tether_core::{
    ConnectionId, Envelope, RegistryConfig, RegistryError, SessionId, SessionRef, TetherResult,
    Timestamp, TopicId, UserId,
};

// ----------------------------------------------------------------------------
// Connection Sinks
// ----------------------------------------------------------------------------

/// Why a connection was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// No `ConnectionInit` within the auth window
    AuthTimeout,
    /// The token was refused
    AuthFailed,
    /// The peer went away
    ClientClosed,
    /// The session was logged out; no presence re-evaluation
    LoggedOut,
    ServerShutdown,
    /// Socket I/O failed
    Error,
}

impl CloseReason {
    /// WebSocket close code sent to the peer
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::ClientClosed => 1000,
            CloseReason::ServerShutdown => 1001,
            CloseReason::Error => 1011,
            CloseReason::AuthTimeout => 4000,
            CloseReason::AuthFailed => 4001,
            CloseReason::LoggedOut => 4002,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AuthTimeout => "authentication timed out",
            CloseReason::AuthFailed => "authentication failed",
            CloseReason::ClientClosed => "closed",
            CloseReason::LoggedOut => "logged out",
            CloseReason::ServerShutdown => "server shutting down",
            CloseReason::Error => "connection error",
        }
    }
}

/// Write side of one accepted socket.
///
/// Implementations queue work for the socket's writer; neither call blocks.
pub trait ConnectionSink: Send + Sync + 'static {
    /// Queue one binary frame; false once the socket is gone
    fn send_frame(&self, frame: Vec<u8>) -> bool;

    /// Ask the writer to send a close frame and stop
    fn close(&self, reason: CloseReason);
}

/// What a [`ChannelSink`] hands to the socket writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkMessage {
    Frame(Vec<u8>),
    Close(CloseReason),
}

/// [`ConnectionSink`] over an unbounded channel drained by a writer task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ConnectionSink for ChannelSink {
    fn send_frame(&self, frame: Vec<u8>) -> bool {
        self.tx.send(SinkMessage::Frame(frame)).is_ok()
    }

    fn close(&self, reason: CloseReason) {
        let _ = self.tx.send(SinkMessage::Close(reason));
    }
}

// ----------------------------------------------------------------------------
// Registry State
// ----------------------------------------------------------------------------

/// Snapshot of one registered connection
#[derive(Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub session: Option<SessionRef>,
    pub opened_at: Timestamp,
    pub sink: Arc<dyn ConnectionSink>,
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("opened_at", &self.opened_at)
            .finish()
    }
}

struct ConnectionRecord {
    sink: Arc<dyn ConnectionSink>,
    session: Option<SessionRef>,
    opened_at: Timestamp,
    auth_timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    connections: HashMap<ConnectionId, ConnectionRecord>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    /// Users receiving fan-out per topic
    subscribers: HashMap<TopicId, HashSet<UserId>>,
    /// Cached memberships, loaded once per user
    memberships: HashMap<UserId, Vec<TopicId>>,
}

struct RegistryInner {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
    observer: Option<Arc<dyn SessionObserver>>,
    memberships: Option<Arc<dyn MembershipLoader>>,
}

/// Shared connection registry; clones refer to the same maps
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("ConnectionRegistry")
            .field("connections", &state.connections.len())
            .field("users", &state.by_user.len())
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_collaborators(config, None, None)
    }

    pub fn with_collaborators(
        config: RegistryConfig,
        observer: Option<Arc<dyn SessionObserver>>,
        memberships: Option<Arc<dyn MembershipLoader>>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                state: Mutex::new(RegistryState::default()),
                observer,
                memberships,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Register an unauthenticated socket and arm its auth timeout
    pub fn add_connection(&self, sink: Arc<dyn ConnectionSink>) -> ConnectionId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = ConnectionId::new(state.next_id);

        let registry = self.clone();
        let window = self.inner.config.auth_timeout;
        let auth_timer = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            registry.expire_unauthenticated(id);
        });

        state.connections.insert(
            id,
            ConnectionRecord {
                sink,
                session: None,
                opened_at: Timestamp::now(),
                auth_timer: Some(auth_timer),
            },
        );
        debug!(%id, total = state.connections.len(), "connection added");
        id
    }

    fn expire_unauthenticated(&self, id: ConnectionId) {
        let unauthenticated = self
            .lock()
            .connections
            .get(&id)
            .map(|record| record.session.is_none())
            .unwrap_or(false);
        if unauthenticated {
            info!(%id, "connection not authenticated in time, closing");
            self.close_connection(id, CloseReason::AuthTimeout);
        }
    }

    /// Bind a socket to a user session. A connection is bound at most once.
    ///
    /// On the user's first live connection, memberships are loaded in the
    /// background (once per user) and the user is subscribed to each topic.
    pub fn authenticate_connection(
        &self,
        id: ConnectionId,
        session: SessionRef,
    ) -> TetherResult<()> {
        let first_connection = {
            let mut state = self.lock();
            let record = state
                .connections
                .get_mut(&id)
                .ok_or(RegistryError::UnknownConnection { connection_id: id })?;
            if record.session.is_some() {
                return Err(RegistryError::AlreadyAuthenticated { connection_id: id }.into());
            }
            if let Some(timer) = record.auth_timer.take() {
                timer.abort();
            }
            record.session = Some(session);

            let connections = state.by_user.entry(session.user_id).or_default();
            let first = connections.is_empty();
            connections.insert(id);
            first
        };
        debug!(%id, user = %session.user_id, session = %session.session_id, "connection authenticated");

        if let Some(observer) = &self.inner.observer {
            observer.session_opened(session);
        }
        if first_connection {
            self.subscribe_user_to_memberships(session.user_id);
        }
        Ok(())
    }

    fn subscribe_user_to_memberships(&self, user_id: UserId) {
        let cached = self.lock().memberships.get(&user_id).cloned();
        if let Some(topics) = cached {
            for topic in topics {
                self.subscribe_to_topic(user_id, topic);
            }
            return;
        }
        let Some(loader) = self.inner.memberships.clone() else {
            return;
        };

        let registry = self.clone();
        tokio::spawn(async move {
            match loader.topics_for_user(user_id).await {
                Ok(topics) => {
                    debug!(user = %user_id, topics = topics.len(), "memberships loaded");
                    registry
                        .lock()
                        .memberships
                        .insert(user_id, topics.clone());
                    for topic in topics {
                        registry.subscribe_to_topic(user_id, topic);
                    }
                }
                Err(error) => warn!(user = %user_id, %error, "failed to load memberships"),
            }
        });
    }

    /// Close the socket and remove the record. Idempotent.
    pub fn close_connection(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let sink = self
            .lock()
            .connections
            .get(&id)
            .map(|record| record.sink.clone());
        match sink {
            Some(sink) => {
                debug!(%id, reason = reason.as_str(), "closing connection");
                sink.close(reason);
                self.remove_connection(id, reason)
            }
            None => false,
        }
    }

    /// Remove the record of a socket that is already gone. Idempotent.
    pub fn remove_connection(&self, id: ConnectionId, reason: CloseReason) -> bool {
        let session = {
            let mut state = self.lock();
            let Some(mut record) = state.connections.remove(&id) else {
                return false;
            };
            if let Some(timer) = record.auth_timer.take() {
                timer.abort();
            }
            if let Some(session) = record.session {
                if let Some(connections) = state.by_user.get_mut(&session.user_id) {
                    connections.remove(&id);
                    if connections.is_empty() {
                        state.by_user.remove(&session.user_id);
                    }
                }
            }
            trace!(%id, remaining = state.connections.len(), "connection removed");
            record.session
        };

        if let (Some(session), Some(observer)) = (session, &self.inner.observer) {
            if reason != CloseReason::LoggedOut {
                observer.session_closed(session);
            }
        }
        true
    }

    /// Close every socket of a logged-out session; returns how many
    pub fn session_logged_out(&self, session: SessionRef) -> usize {
        let ids: Vec<ConnectionId> = {
            let state = self.lock();
            state
                .by_user
                .get(&session.user_id)
                .map(|connections| {
                    connections
                        .iter()
                        .filter(|id| {
                            state
                                .connections
                                .get(*id)
                                .and_then(|record| record.session)
                                .map(|s| s.session_id == session.session_id)
                                .unwrap_or(false)
                        })
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        let closed = ids
            .into_iter()
            .filter(|id| self.close_connection(*id, CloseReason::LoggedOut))
            .count();
        info!(user = %session.user_id, session = %session.session_id, closed, "session logged out");
        closed
    }

    /// Close everything, for server shutdown
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let ids: Vec<ConnectionId> = self.lock().connections.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.close_connection(*id, reason))
            .count()
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    pub fn get_connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.lock().connections.get(&id).map(|record| ConnectionInfo {
            id,
            session: record.session,
            opened_at: record.opened_at,
            sink: record.sink.clone(),
        })
    }

    pub fn session_of(&self, id: ConnectionId) -> Option<SessionRef> {
        self.lock()
            .connections
            .get(&id)
            .and_then(|record| record.session)
    }

    pub fn user_connections(&self, user_id: UserId) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .lock()
            .by_user
            .get(&user_id)
            .map(|connections| connections.iter().copied().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn sessions_of_user(&self, user_id: UserId) -> Vec<SessionId> {
        let state = self.lock();
        let mut sessions: Vec<SessionId> = state
            .by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.connections.get(id))
            .filter_map(|record| record.session.map(|s| s.session_id))
            .collect();
        sessions.sort();
        sessions.dedup();
        sessions
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn authenticated_user_count(&self) -> usize {
        self.lock().by_user.len()
    }

    // ------------------------------------------------------------------------
    // Fan-out
    // ------------------------------------------------------------------------

    /// Send to one connection
    pub fn send_to(&self, id: ConnectionId, envelope: &Envelope) -> TetherResult<()> {
        let sink = self
            .lock()
            .connections
            .get(&id)
            .map(|record| record.sink.clone())
            .ok_or(RegistryError::UnknownConnection { connection_id: id })?;
        let frame = envelope.encode()?;
        if !sink.send_frame(frame) {
            return Err(RegistryError::SinkClosed { connection_id: id }.into());
        }
        Ok(())
    }

    /// Send to every authenticated connection of a user; returns deliveries
    pub fn send_to_user(&self, user_id: UserId, envelope: &Envelope) -> TetherResult<usize> {
        let frame = envelope.encode()?;
        let sinks = self.user_sinks(&[user_id]);
        Ok(deliver(&sinks, &frame))
    }

    pub fn subscribe_to_topic(&self, user_id: UserId, topic: TopicId) {
        trace!(user = %user_id, %topic, "subscribing to topic");
        self.lock()
            .subscribers
            .entry(topic)
            .or_default()
            .insert(user_id);
    }

    pub fn unsubscribe_from_topic(&self, user_id: UserId, topic: TopicId) {
        let mut state = self.lock();
        if let Some(users) = state.subscribers.get_mut(&topic) {
            users.remove(&user_id);
            if users.is_empty() {
                state.subscribers.remove(&topic);
            }
        }
    }

    pub fn topic_subscribers(&self, topic: TopicId) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .lock()
            .subscribers
            .get(&topic)
            .map(|users| users.iter().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Send to every live connection of every subscriber; returns deliveries
    pub fn publish_to_topic(&self, topic: TopicId, envelope: &Envelope) -> TetherResult<usize> {
        let frame = envelope.encode()?;
        let users = self.topic_subscribers(topic);
        let sinks = self.user_sinks(&users);
        let delivered = deliver(&sinks, &frame);
        trace!(%topic, users = users.len(), delivered, "published to topic");
        Ok(delivered)
    }

    fn user_sinks(&self, users: &[UserId]) -> Vec<Arc<dyn ConnectionSink>> {
        let state = self.lock();
        users
            .iter()
            .filter_map(|user| state.by_user.get(user))
            .flatten()
            .filter_map(|id| state.connections.get(id))
            .map(|record| record.sink.clone())
            .collect()
    }
}

fn deliver(sinks: &[Arc<dyn ConnectionSink>], frame: &[u8]) -> usize {
    sinks
        .iter()
        .filter(|sink| sink.send_frame(frame.to_vec()))
        .count()
}
