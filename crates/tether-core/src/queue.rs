//! Outbound queue
//!
//! FIFO of envelopes waiting for the transport, plus the in-flight set of
//! envelopes handed to the transport whose reply has not arrived yet. The
//! queue is the one structure shared between the client facade and the RPC
//! runtime, so every operation takes a single mutex and never awaits.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::envelope::Envelope;

#[derive(Debug, Default)]
struct QueueState {
    queued: VecDeque<Envelope>,
    /// Keyed by id so a requeue restores creation order
    in_flight: BTreeMap<u64, Envelope>,
}

/// Thread-safe outbound queue with an in-flight set
#[derive(Debug, Default)]
pub struct OutboundQueue {
    state: Mutex<QueueState>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append to the tail
    pub fn push(&self, envelope: Envelope) {
        self.lock().queued.push_back(envelope);
    }

    /// Pop the head and move it to the in-flight set
    pub fn next(&self) -> Option<Envelope> {
        let mut state = self.lock();
        let envelope = state.queued.pop_front()?;
        state.in_flight.insert(envelope.id, envelope.clone());
        Some(envelope)
    }

    /// Put an envelope back at the head after a failed send
    pub fn requeue(&self, envelope: Envelope) {
        let mut state = self.lock();
        let was_in_flight = state.in_flight.remove(&envelope.id).is_some();
        if !was_in_flight && state.queued.iter().any(|e| e.id == envelope.id) {
            return;
        }
        state.queued.push_front(envelope);
    }

    /// Move every in-flight envelope back to the head, oldest first.
    ///
    /// Used once a fresh session is established so calls sent on a dead
    /// socket are transmitted again with their original ids.
    pub fn requeue_all_in_flight(&self) -> usize {
        let mut state = self.lock();
        let in_flight = std::mem::take(&mut state.in_flight);
        let count = in_flight.len();
        for (_, envelope) in in_flight.into_iter().rev() {
            state.queued.push_front(envelope);
        }
        if count > 0 {
            debug!(count, "requeued in-flight envelopes");
        }
        count
    }

    /// Drop an envelope from the queue and the in-flight set
    pub fn remove(&self, id: u64) -> bool {
        let mut state = self.lock();
        let in_flight = state.in_flight.remove(&id).is_some();
        let before = state.queued.len();
        state.queued.retain(|envelope| envelope.id != id);
        in_flight || state.queued.len() != before
    }

    /// Whether the id is queued or in flight
    pub fn contains(&self, id: u64) -> bool {
        let state = self.lock();
        state.in_flight.contains_key(&id) || state.queued.iter().any(|e| e.id == id)
    }

    pub fn is_in_flight(&self, id: u64) -> bool {
        self.lock().in_flight.contains_key(&id)
    }

    pub fn queued_len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Ids currently queued or in flight, in no particular order
    pub fn ids(&self) -> Vec<u64> {
        let state = self.lock();
        state
            .queued
            .iter()
            .map(|e| e.id)
            .chain(state.in_flight.keys().copied())
            .collect()
    }

    /// Drop everything
    pub fn clear(&self) {
        let mut state = self.lock();
        state.queued.clear();
        state.in_flight.clear();
    }
}
