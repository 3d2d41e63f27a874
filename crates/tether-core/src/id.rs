//! Envelope id generation
//!
//! Ids are `(seconds since 2025-01-01 << 32) | sequence within that second`,
//! so they sort by creation time and never repeat within a process.

use std::sync::Mutex;

use crate::types::{SystemTimeSource, TimeSource};

/// 2025-01-01T00:00:00Z in seconds since Unix epoch
pub const ID_EPOCH_SECS: u64 = 1_735_689_600;

#[derive(Debug, Default)]
struct IdState {
    last_secs: u64,
    sequence: u32,
}

/// Monotonic id generator shared by everything that creates envelopes
#[derive(Debug)]
pub struct MessageIdGenerator<T: TimeSource = SystemTimeSource> {
    time_source: T,
    state: Mutex<IdState>,
}

impl MessageIdGenerator<SystemTimeSource> {
    pub fn new() -> Self {
        Self::with_time_source(SystemTimeSource)
    }
}

impl Default for MessageIdGenerator<SystemTimeSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeSource> MessageIdGenerator<T> {
    pub fn with_time_source(time_source: T) -> Self {
        Self {
            time_source,
            state: Mutex::new(IdState::default()),
        }
    }

    /// Next id, strictly greater than every id returned before
    pub fn next_id(&self) -> u64 {
        let now_secs = self
            .time_source
            .now()
            .as_secs()
            .saturating_sub(ID_EPOCH_SECS);

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        // A clock stepping backwards keeps counting inside the last second.
        if now_secs > state.last_secs {
            state.last_secs = now_secs;
            state.sequence = 0;
        } else if state.sequence == u32::MAX {
            state.last_secs += 1;
            state.sequence = 0;
        } else {
            state.sequence += 1;
        }

        (state.last_secs << 32) | u64::from(state.sequence)
    }
}

/// Seconds-since-epoch component of an id
pub fn id_seconds(id: u64) -> u64 {
    id >> 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ManualClock;

    const START_MS: u64 = (ID_EPOCH_SECS + 100) * 1000;

    #[test]
    fn test_sequence_increments_within_a_second() {
        let clock = ManualClock::new_at(START_MS);
        let ids = MessageIdGenerator::with_time_source(clock.clone());

        let a = ids.next_id();
        let b = ids.next_id();
        assert_eq!(id_seconds(a), 100);
        assert_eq!(b, a + 1);

        clock.advance(1_000);
        let c = ids.next_id();
        assert_eq!(id_seconds(c), 101);
        assert_eq!(c & 0xffff_ffff, 0);
    }

    #[test]
    fn test_clock_going_backwards_stays_monotonic() {
        let clock = ManualClock::new_at(START_MS);
        let ids = MessageIdGenerator::with_time_source(clock.clone());

        let before = ids.next_id();
        clock.set(START_MS - 30_000);
        let after = ids.next_id();
        assert!(after > before);
    }

    #[test]
    fn test_system_clock_ids_are_strictly_increasing() {
        let ids = MessageIdGenerator::new();
        let mut last = 0;
        for _ in 0..10_000 {
            let id = ids.next_id();
            assert!(id > last);
            last = id;
        }
    }
}
