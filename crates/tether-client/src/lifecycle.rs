//! App lifecycle and reachability events
//!
//! The embedding application forwards OS notifications through a
//! [`LifecycleSender`]; the transport consumes them from the paired receiver.

use tokio::sync::mpsc;
use tracing::trace;

/// Events the transport reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    AppForegrounded,
    AppBackgrounded,
    /// Reachability returned; `constrained` selects the longer connect timeout
    NetworkAvailable { constrained: bool },
    NetworkUnavailable,
}

pub type LifecycleReceiver = mpsc::UnboundedReceiver<LifecycleEvent>;

/// Handle the application uses to report lifecycle changes
#[derive(Debug, Clone)]
pub struct LifecycleSender {
    tx: mpsc::UnboundedSender<LifecycleEvent>,
}

/// Create a lifecycle event source
pub fn lifecycle_channel() -> (LifecycleSender, LifecycleReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (LifecycleSender { tx }, rx)
}

impl LifecycleSender {
    /// Returns false once the transport has stopped listening
    pub fn send(&self, event: LifecycleEvent) -> bool {
        trace!(?event, "lifecycle event");
        self.tx.send(event).is_ok()
    }

    pub fn app_foregrounded(&self) -> bool {
        self.send(LifecycleEvent::AppForegrounded)
    }

    pub fn app_backgrounded(&self) -> bool {
        self.send(LifecycleEvent::AppBackgrounded)
    }

    pub fn network_available(&self, constrained: bool) -> bool {
        self.send(LifecycleEvent::NetworkAvailable { constrained })
    }

    pub fn network_unavailable(&self) -> bool {
        self.send(LifecycleEvent::NetworkUnavailable)
    }
}
