//! Core types for the tether realtime link
//!
//! Identifier newtypes shared by client and server, the millisecond
//! `Timestamp`, and the `TimeSource` seam used wherever behavior depends on
//! the wall clock.

use core::fmt;
use core::ops::{Add, Sub};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Identifiers
// ----------------------------------------------------------------------------

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

id_newtype!(
    /// Account that owns sessions and sockets
    UserId,
    "user:"
);
id_newtype!(
    /// One login of a user on one device
    SessionId,
    "session:"
);
id_newtype!(
    /// Server-assigned identifier of one accepted socket
    ConnectionId,
    "conn:"
);
id_newtype!(
    /// Fan-out topic a user can be subscribed to, such as a space
    TopicId,
    "topic:"
);

/// The (user, session) pair a socket is bound to once authenticated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionRef {
    pub user_id: UserId,
    pub session_id: SessionId,
}

impl SessionRef {
    pub fn new(user_id: UserId, session_id: SessionId) -> Self {
        Self {
            user_id,
            session_id,
        }
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Whole seconds since Unix epoch
    pub fn as_secs(&self) -> u64 {
        self.0 / 1000
    }

    /// This timestamp moved back by `duration`, clamped at the epoch
    pub fn saturating_sub_duration(&self, duration: Duration) -> Self {
        Self(self.0.saturating_sub(duration.as_millis() as u64))
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Trait for providing timestamps
///
/// Components that stamp ids or compare activity windows take a time source
/// so tests can drive the clock by hand.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Wall-clock implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now(&self) -> Timestamp {
        (**self).now()
    }
}

/// Hand-driven clock for deterministic tests
///
/// Clones share the same underlying time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    current: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock starting at the given millisecond timestamp
    pub fn new_at(millis: u64) -> Self {
        Self {
            current: Arc::new(AtomicU64::new(millis)),
        }
    }

    /// Advance time by the specified number of milliseconds
    pub fn advance(&self, millis: u64) {
        self.current.fetch_add(millis, Ordering::SeqCst);
    }

    /// Set the time to a specific value; may move backwards
    pub fn set(&self, millis: u64) {
        self.current.store(millis, Ordering::SeqCst);
    }
}

impl TimeSource for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.current.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_display() {
        assert_eq!(UserId::new(7).to_string(), "user:7");
        assert_eq!(ConnectionId::new(3).to_string(), "conn:3");
        assert_eq!(SessionId::from(9).get(), 9);
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(10_000);
        assert_eq!((t + 500).as_millis(), 10_500);
        assert_eq!(Timestamp::new(12_000) - t, 2_000);
        assert_eq!(t - Timestamp::new(12_000), 0);
        assert_eq!(
            t.saturating_sub_duration(Duration::from_secs(60)),
            Timestamp::new(0)
        );
        assert_eq!(t.as_secs(), 10);
    }

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new_at(1_000);
        let other = clock.clone();
        clock.advance(250);
        assert_eq!(other.now(), Timestamp::new(1_250));
        other.set(5);
        assert_eq!(clock.now().as_millis(), 5);
    }
}
