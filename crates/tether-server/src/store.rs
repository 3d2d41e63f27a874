//! Storage and notification seams
//!
//! The registry and presence tracker never touch a database directly; they
//! go through these traits so deployments can plug in their own storage and
//! fan-out.

use async_trait::async_trait;

use tether_core::{SessionId, SessionRef, StoreError, Timestamp, TopicId, UserId};

/// Activity record of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionActivity {
    pub session_id: SessionId,
    /// When the session was last marked active; `None` if never
    pub last_active: Option<Timestamp>,
}

/// Persisted online status of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PresenceState {
    pub online: bool,
    pub last_online: Option<Timestamp>,
}

/// "user X is now online/offline" notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub user_id: UserId,
    pub online: bool,
    pub last_online: Option<Timestamp>,
}

/// Session activity persistence
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Mark one session active (refreshing its last-active time) or inactive
    async fn set_active(&self, session_id: SessionId, active: bool) -> Result<(), StoreError>;

    async fn set_active_bulk(
        &self,
        session_ids: &[SessionId],
        active: bool,
    ) -> Result<(), StoreError>;

    /// Sessions of a user currently flagged active
    async fn active_sessions_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<SessionActivity>, StoreError>;
}

/// User online status persistence
#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    async fn set_online(&self, user_id: UserId, online: bool) -> Result<PresenceState, StoreError>;
}

/// Loads the topics a user should receive fan-out for
#[async_trait]
pub trait MembershipLoader: Send + Sync + 'static {
    async fn topics_for_user(&self, user_id: UserId) -> Result<Vec<TopicId>, StoreError>;
}

/// Out-of-band presence fan-out; at-most-once, never awaited
pub trait PresenceNotifier: Send + Sync + 'static {
    fn presence_changed(&self, update: PresenceUpdate);
}

/// Receives authenticated session open and close events from the registry
pub trait SessionObserver: Send + Sync + 'static {
    fn session_opened(&self, session: SessionRef);
    fn session_closed(&self, session: SessionRef);
}
