//! In-memory storage and fan-out
//!
//! Process-local implementations of the storage seams, used by tests and
//! by single-node deployments that do not need durability.

use async_trait::async_trait;
use hashbrown::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::trace;

use crate::gateway::Authenticator;
use crate::store::{
    MembershipLoader, PresenceNotifier, PresenceState, PresenceUpdate, SessionActivity,
    SessionStore, UserStore,
};
use tether_core::{
    AuthError, SessionId, SessionRef, StoreError, SystemTimeSource, TimeSource, Timestamp,
    TopicId, UserId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ----------------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct SessionRecord {
    user_id: UserId,
    active: bool,
    last_active: Option<Timestamp>,
}

/// Session store backed by a map
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    time: Arc<dyn TimeSource>,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            time,
        }
    }

    /// Create an inactive session record
    pub fn add_session(&self, session: SessionRef) {
        lock(&self.sessions).insert(
            session.session_id,
            SessionRecord {
                user_id: session.user_id,
                active: false,
                last_active: None,
            },
        );
    }

    /// Overwrite the last-active time, for staleness tests
    pub fn set_last_active(&self, session_id: SessionId, at: Timestamp) {
        if let Some(record) = lock(&self.sessions).get_mut(&session_id) {
            record.last_active = Some(at);
        }
    }

    pub fn is_active(&self, session_id: SessionId) -> bool {
        lock(&self.sessions)
            .get(&session_id)
            .map(|record| record.active)
            .unwrap_or(false)
    }

    pub fn last_active(&self, session_id: SessionId) -> Option<Timestamp> {
        lock(&self.sessions)
            .get(&session_id)
            .and_then(|record| record.last_active)
    }

    fn mark(
        sessions: &mut HashMap<SessionId, SessionRecord>,
        session_id: SessionId,
        active: bool,
        now: Timestamp,
    ) -> Result<(), StoreError> {
        let record = sessions.get_mut(&session_id).ok_or_else(|| StoreError::NotFound {
            what: session_id.to_string(),
        })?;
        record.active = active;
        if active {
            record.last_active = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn set_active(&self, session_id: SessionId, active: bool) -> Result<(), StoreError> {
        let now = self.time.now();
        trace!(%session_id, active, "set session active");
        Self::mark(&mut lock(&self.sessions), session_id, active, now)
    }

    async fn set_active_bulk(
        &self,
        session_ids: &[SessionId],
        active: bool,
    ) -> Result<(), StoreError> {
        let now = self.time.now();
        let mut sessions = lock(&self.sessions);
        for session_id in session_ids {
            // Sessions deleted since the caller listed them are skipped
            let _ = Self::mark(&mut sessions, *session_id, active, now);
        }
        Ok(())
    }

    async fn active_sessions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SessionActivity>, StoreError> {
        let mut sessions: Vec<SessionActivity> = lock(&self.sessions)
            .iter()
            .filter(|(_, record)| record.user_id == user_id && record.active)
            .map(|(session_id, record)| SessionActivity {
                session_id: *session_id,
                last_active: record.last_active,
            })
            .collect();
        sessions.sort_by_key(|s| s.session_id);
        Ok(sessions)
    }
}

// ----------------------------------------------------------------------------
// Users
// ----------------------------------------------------------------------------

/// User presence store backed by a map
pub struct MemoryUserStore {
    users: Mutex<HashMap<UserId, PresenceState>>,
    time: Arc<dyn TimeSource>,
}

impl Default for MemoryUserStore {
    fn default() -> Self {
        Self::with_time_source(Arc::new(SystemTimeSource))
    }
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_source(time: Arc<dyn TimeSource>) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            time,
        }
    }

    pub fn presence(&self, user_id: UserId) -> PresenceState {
        lock(&self.users).get(&user_id).copied().unwrap_or_default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<PresenceState, StoreError> {
        let now = self.time.now();
        let mut users = lock(&self.users);
        let state = users.entry(user_id).or_default();
        state.online = online;
        state.last_online = Some(now);
        Ok(*state)
    }
}

// ----------------------------------------------------------------------------
// Memberships
// ----------------------------------------------------------------------------

/// Fixed user to topic memberships
#[derive(Default)]
pub struct StaticMemberships {
    topics: Mutex<HashMap<UserId, Vec<TopicId>>>,
    loads: AtomicUsize,
}

impl StaticMemberships {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, user_id: UserId, topics: Vec<TopicId>) {
        lock(&self.topics).insert(user_id, topics);
    }

    /// How many times memberships were loaded
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipLoader for StaticMemberships {
    async fn topics_for_user(&self, user_id: UserId) -> Result<Vec<TopicId>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.topics).get(&user_id).cloned().unwrap_or_default())
    }
}

// ----------------------------------------------------------------------------
// Authentication
// ----------------------------------------------------------------------------

/// Token table for tests and fixed deployments
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: Mutex<HashMap<String, SessionRef>>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Into<String>>(&self, token: T, session: SessionRef) {
        lock(&self.tokens).insert(token.into(), session);
    }

    pub fn revoke(&self, token: &str) -> bool {
        lock(&self.tokens).remove(token).is_some()
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<SessionRef, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        lock(&self.tokens)
            .get(token)
            .copied()
            .ok_or_else(|| AuthError::TokenRejected {
                reason: "unknown token".to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------------

/// Presence fan-out over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<PresenceUpdate>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PresenceUpdate> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

impl PresenceNotifier for BroadcastNotifier {
    fn presence_changed(&self, update: PresenceUpdate) {
        // No subscribers is not an error
        let _ = self.tx.send(update);
    }
}
