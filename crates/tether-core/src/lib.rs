//! tether core
//!
//! Foundational types for the tether realtime link: the wire envelope and its
//! codec, sortable envelope ids, the outbound queue shared by the client
//! runtime, configuration, and the error taxonomy used by the client and
//! server crates.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod config;
pub mod envelope;
pub mod errors;
pub mod id;
pub mod queue;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use config::{
    ClientConfig, PresenceConfig, ReconnectConfig, RegistryConfig, RuntimeConfig, ServerConfig,
    TransportConfig,
};
pub use envelope::{Body, Envelope, Method, RpcErrorCode, MAX_FRAME_SIZE};
pub use errors::{
    AuthError, FrameError, RegistryError, Result, RpcFailure, StoreError, TetherError,
    TetherResult, TransportError,
};
pub use id::{MessageIdGenerator, ID_EPOCH_SECS};
pub use queue::OutboundQueue;
pub use types::{
    ConnectionId, ManualClock, SessionId, SessionRef, SystemTimeSource, TimeSource, Timestamp,
    TopicId, UserId,
};
