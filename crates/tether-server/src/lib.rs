//! tether server
//!
//! Server side of the tether realtime link: a registry of live sockets with
//! per-user and per-topic fan-out, a presence tracker that turns session
//! activity into online/offline status, and a websocket gateway that performs
//! the `ConnectionInit` handshake and dispatches RPC calls.
//!
//! Typical wiring:
//!
//! ```text
//!   Gateway ──▶ ConnectionRegistry ──SessionObserver──▶ PresenceTracker
//!                      │                                     │
//!               MembershipLoader                SessionStore / UserStore
//!                                                 PresenceNotifier
//! ```

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod gateway;
pub mod memory;
pub mod presence;
pub mod registry;
pub mod store;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use gateway::{Authenticator, Gateway, RpcHandler};
pub use memory::{
    BroadcastNotifier, MemorySessionStore, MemoryUserStore, StaticMemberships,
    StaticTokenAuthenticator,
};
pub use presence::PresenceTracker;
pub use registry::{
    ChannelSink, CloseReason, ConnectionInfo, ConnectionRegistry, ConnectionSink, SinkMessage,
};
pub use store::{
    MembershipLoader, PresenceNotifier, PresenceState, PresenceUpdate, SessionActivity,
    SessionObserver, SessionStore, UserStore,
};

pub use tether_core::{RegistryConfig, PresenceConfig, ServerConfig};
