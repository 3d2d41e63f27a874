//! Pending RPC calls keyed by envelope id

use hashbrown::HashMap;
use tokio::sync::oneshot;

use tether_core::TetherError;

pub type CallOutcome = Result<Vec<u8>, TetherError>;
pub type Reply = oneshot::Sender<CallOutcome>;

/// One single-resolution reply channel per outstanding call.
///
/// Owned by the runtime task; resolving removes the entry, so a call can be
/// answered at most once.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: HashMap<u64, Reply>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call; hands the reply back if the id is already pending
    pub fn register(&mut self, id: u64, reply: Reply) -> Result<(), Reply> {
        if self.calls.contains_key(&id) {
            return Err(reply);
        }
        self.calls.insert(id, reply);
        Ok(())
    }

    /// Resolve and remove; false if no call with that id is pending
    pub fn resolve(&mut self, id: u64, outcome: CallOutcome) -> bool {
        match self.calls.remove(&id) {
            Some(reply) => {
                // The caller may have given up waiting.
                let _ = reply.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Forget a call without answering it
    pub fn abandon(&mut self, id: u64) -> bool {
        self.calls.remove(&id).is_some()
    }

    /// Drop every reply channel unanswered; returns how many were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.calls.len();
        self.calls.clear();
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.calls.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
