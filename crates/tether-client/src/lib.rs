//! tether client
//!
//! A resilient realtime link for application clients: a WebSocket transport
//! that reconnects on its own, and an RPC runtime that queues calls while
//! offline, authenticates each new socket, and correlates replies by envelope
//! id.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod client;
pub mod lifecycle;
pub mod memory;
pub mod rpc;
pub mod socket;
pub mod transport;
pub mod websocket;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use client::{ClientBuilder, RealtimeClient};
pub use lifecycle::{lifecycle_channel, LifecycleEvent, LifecycleReceiver, LifecycleSender};
pub use memory::{memory_network, MemoryConnector, MemoryListener, MemoryPeer};
pub use rpc::{
    CallOutcome, PendingCalls, RealtimeState, RuntimeStats, StaticToken, TokenProvider,
    UpdatesSink,
};
pub use socket::{Connector, SocketFrame, SocketPair, SocketSink, SocketStream};
pub use transport::{
    ConnectionState, ReconnectGuard, ReconnectPolicy, ReconnectTrigger, Transport,
    TransportEvent, TransportHandle, TransportStatus,
};
pub use websocket::WebSocketConnector;

pub use tether_core::{
    ClientConfig, Method, RpcErrorCode, RuntimeConfig, TetherError, TetherResult,
    TransportConfig, TransportError,
};
