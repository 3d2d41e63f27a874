//! Reconnect scheduling policy

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tether_core::{ReconnectConfig, TransportError};

/// What caused a reconnect to be scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectTrigger {
    /// The app came to the foreground
    Foreground,
    /// The device changed networks or regained reachability
    NetworkTransition,
    /// Any other failure; follows the backoff schedule
    Failure,
    /// First connection after `start()`
    Initial,
}

impl ReconnectTrigger {
    pub fn for_error(error: &TransportError) -> Self {
        if error.is_network_transition() {
            ReconnectTrigger::NetworkTransition
        } else {
            ReconnectTrigger::Failure
        }
    }

    pub fn uses_backoff(&self) -> bool {
        matches!(self, ReconnectTrigger::Failure)
    }
}

/// Computes reconnect delays
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
}

impl ReconnectPolicy {
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Delay before the next attempt. `attempt` counts consecutive backoff
    /// failures; the result never exceeds `max_delay`.
    pub fn delay<R: Rng>(
        &self,
        trigger: ReconnectTrigger,
        attempt: u32,
        rng: &mut R,
    ) -> Duration {
        if !trigger.uses_backoff() {
            return self.config.immediate_delay;
        }

        let exponent = attempt.min(32) as i32;
        let step = self.config.base_delay.as_secs_f64() * self.config.multiplier.powi(exponent);
        let jitter_cap = self.config.max_jitter.as_secs_f64();
        let jitter = if jitter_cap > 0.0 {
            rng.gen_range(0.0..=jitter_cap)
        } else {
            0.0
        };

        let max = self.config.max_delay.as_secs_f64();
        let total = (step + jitter).min(max);
        if total.is_finite() {
            Duration::from_secs_f64(total.max(0.0))
        } else {
            self.config.max_delay
        }
    }
}

/// Serializes reconnect scheduling so overlapping triggers collapse into one
#[derive(Debug, Default)]
pub struct ReconnectGuard {
    in_progress: AtomicBool,
}

impl ReconnectGuard {
    /// Claim the guard; false if a reconnect is already scheduled
    pub fn try_begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.in_progress.store(false, Ordering::Release);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }
}
