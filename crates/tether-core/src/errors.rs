//! Error types for the tether realtime link
//!
//! This module contains the error taxonomy shared by the client and server
//! crates: transport errors, authentication errors, frame errors, peer RPC
//! failures, registry and storage errors, and the `TetherError` type that
//! unifies them all.

use crate::envelope::RpcErrorCode;
use crate::types::ConnectionId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Socket-level failures. None of these are fatal: the transport reacts by
/// scheduling a reconnect unless it has been stopped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid server URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Connect timeout after {duration_ms}ms")]
    ConnectTimeout { duration_ms: u64 },
    #[error("Connect failed: {reason}")]
    ConnectFailed { reason: String },
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },
    #[error("Not connected to the internet")]
    NotConnectedToInternet,
    #[error("Transport is not connected")]
    NotConnected,
    #[error("Send failed: {reason}")]
    SendFailed { reason: String },
    #[error("Receive failed: {reason}")]
    ReceiveFailed { reason: String },
    #[error("No pong after {failures} consecutive pings")]
    PingTimeout { failures: u32 },
    #[error("Socket closed by peer (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("Transport stopped")]
    Stopped,
}

impl TransportError {
    /// Errors caused by the device moving between networks. These reconnect
    /// after the short fixed delay instead of the backoff schedule.
    pub fn is_network_transition(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost { .. } | TransportError::NotConnectedToInternet
        )
    }
}

/// Authentication failures for a connection attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("No authentication token available")]
    MissingToken,
    #[error("Token rejected: {reason}")]
    TokenRejected { reason: String },
    #[error("Connection {connection_id} is not authenticated")]
    NotAuthenticated { connection_id: ConnectionId },
}

/// Failures turning bytes into an envelope
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame too large: {size} bytes (max: {max})")]
    TooLarge { size: usize, max: usize },
    #[error("Malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
}

/// Structured failure returned by the peer for one specific call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("RPC failed with {code:?}: {message}")]
pub struct RpcFailure {
    pub code: RpcErrorCode,
    pub message: String,
}

impl RpcFailure {
    pub fn new<T: Into<String>>(code: RpcErrorCode, message: T) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized<T: Into<String>>(message: T) -> Self {
        Self::new(RpcErrorCode::Unauthorized, message)
    }
}

/// Server connection registry errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown connection {connection_id}")]
    UnknownConnection { connection_id: ConnectionId },
    #[error("Connection {connection_id} sink is closed")]
    SinkClosed { connection_id: ConnectionId },
    #[error("Connection {connection_id} is already authenticated")]
    AlreadyAuthenticated { connection_id: ConnectionId },
}

/// Durable storage errors reported by store implementations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },
    #[error("Record not found: {what}")]
    NotFound { what: String },
}

// ----------------------------------------------------------------------------
// Unified Error Type
// ----------------------------------------------------------------------------

/// Core error type for the tether crates
#[derive(Debug, thiserror::Error)]
pub enum TetherError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid frame: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Rpc(#[from] RpcFailure),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Internal channel to a task closed unexpectedly
    #[error("Channel error: {message}")]
    Channel { message: String },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The runtime was stopped while the operation was outstanding
    #[error("Stopped")]
    Stopped,
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl TetherError {
    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        TetherError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        TetherError::Channel {
            message: message.into(),
        }
    }

    /// The peer-returned failure, if this error carries one
    pub fn rpc_failure(&self) -> Option<&RpcFailure> {
        match self {
            TetherError::Rpc(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for tether operations
pub type Result<T> = core::result::Result<T, TetherError>;

/// Explicit alias used where `Result` would be ambiguous
pub type TetherResult<T> = Result<T>;
