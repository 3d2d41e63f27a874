//! Wire envelope for the realtime link
//!
//! Every frame on the socket is one bincode-encoded [`Envelope`]: a sortable
//! id, a per-connection sequence number and a closed set of body variants.
//! Method inputs, results and update batches are opaque bytes owned by the
//! application.

use serde::{Deserialize, Serialize};

use crate::errors::FrameError;

/// Largest frame accepted by [`Envelope::decode`]
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

// ----------------------------------------------------------------------------
// Methods and Error Codes
// ----------------------------------------------------------------------------

/// Application methods callable over the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    GetMe,
    GetChats,
    GetChatHistory,
    SendMessage,
    EditMessage,
    DeleteMessages,
    AddReaction,
    DeleteReaction,
    CreateChat,
    AddChatParticipant,
    RemoveChatParticipant,
    GetSpaceMembers,
    InviteToSpace,
}

/// Error codes carried by `RpcError`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorCode {
    Unknown,
    BadRequest,
    Unauthorized,
    NotFound,
    RateLimited,
    InternalError,
    UserIdInvalid,
    SpaceIdInvalid,
    SpaceAdminRequired,
}

// ----------------------------------------------------------------------------
// Envelope
// ----------------------------------------------------------------------------

/// Envelope body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// First client frame after the socket opens
    ConnectionInit { token: String },
    /// Server acknowledgement of a valid `ConnectionInit`
    ConnectionOpen,
    RpcCall { method: Method, input: Vec<u8> },
    RpcResult { req_id: u64, result: Vec<u8> },
    RpcError {
        req_id: u64,
        code: RpcErrorCode,
        message: String,
    },
    /// Server-pushed update batch, handed to local persistence
    Updates { payload: Vec<u8> },
}

impl Body {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Body::ConnectionInit { .. } => "connection_init",
            Body::ConnectionOpen => "connection_open",
            Body::RpcCall { .. } => "rpc_call",
            Body::RpcResult { .. } => "rpc_result",
            Body::RpcError { .. } => "rpc_error",
            Body::Updates { .. } => "updates",
        }
    }

    /// The call id this body answers, for results and errors
    pub fn reply_to(&self) -> Option<u64> {
        match self {
            Body::RpcResult { req_id, .. } | Body::RpcError { req_id, .. } => Some(*req_id),
            _ => None,
        }
    }
}

/// One framed unit on the socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub seq: u32,
    pub body: Body,
}

impl Envelope {
    /// Create an envelope; `seq` is stamped when it is transmitted
    pub fn new(id: u64, body: Body) -> Self {
        Self { id, seq: 0, body }
    }

    pub fn rpc_call(id: u64, method: Method, input: Vec<u8>) -> Self {
        Self::new(id, Body::RpcCall { method, input })
    }

    /// Whether a reply correlated to this envelope's id is expected
    pub fn expects_reply(&self) -> bool {
        matches!(self.body, Body::RpcCall { .. })
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(bincode::deserialize(bytes)?)
    }
}
