//! Transport connection states

use std::fmt;

/// Physical socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        };
        f.write_str(name)
    }
}

/// Snapshot published on every transport state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportStatus {
    pub state: ConnectionState,
    pub network_available: bool,
    /// Consecutive backoff attempts since the last foreground reconnect
    pub retry_count: u32,
}

impl Default for TransportStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            network_available: true,
            retry_count: 0,
        }
    }
}

/// What the transport reports to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    StateChanged(TransportStatus),
    /// A binary frame read from the socket
    Frame(Vec<u8>),
}
