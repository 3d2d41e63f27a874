//! RPC runtime
//!
//! Correlates outbound calls with their replies and decides when the outbound
//! queue may drain. The collaborators it needs from the embedding
//! application are expressed as traits here.

mod pending;
mod runtime;

pub use pending::{CallOutcome, PendingCalls};
pub(crate) use runtime::{RpcRuntime, RuntimeCommand};
pub use runtime::RuntimeStats;

use async_trait::async_trait;
use std::fmt;

// ----------------------------------------------------------------------------
// Collaborators
// ----------------------------------------------------------------------------

/// Supplies the bearer token sent in `ConnectionInit`
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn token(&self) -> Option<String>;
}

/// A fixed token
#[derive(Debug, Clone)]
pub struct StaticToken(pub String);

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Receives server-pushed update batches, in arrival order
#[async_trait]
pub trait UpdatesSink: Send + Sync + 'static {
    async fn apply(&self, payload: Vec<u8>);
}

// ----------------------------------------------------------------------------
// Connectivity State
// ----------------------------------------------------------------------------

/// High-level connectivity shown to users
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RealtimeState {
    WaitingForNetwork,
    Connecting,
    /// Socket open, waiting for `ConnectionOpen`
    Authenticating,
    Connected,
    /// The token was missing or refused; a new token is needed
    AuthenticationFailed,
    Stopped,
}

impl RealtimeState {
    pub fn description(&self) -> &'static str {
        match self {
            RealtimeState::WaitingForNetwork => "Waiting for network",
            RealtimeState::Connecting => "Connecting...",
            RealtimeState::Authenticating => "Authenticating...",
            RealtimeState::Connected => "Connected",
            RealtimeState::AuthenticationFailed => "Sign-in required",
            RealtimeState::Stopped => "Offline",
        }
    }
}

impl fmt::Display for RealtimeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}
