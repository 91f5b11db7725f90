use tokio::sync::mpsc;
use tracing::debug;

use crate::policy::rules::Action;

/// Events the engine publishes for outside consumers (UI, notifiers).
/// Delivery is best-effort: a full channel drops the event rather than
/// ever stalling an enforcement cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A MAC never seen before joined the network
    DeviceDiscovered { mac: String },

    /// Remaining daily allowance dropped into the warning band
    Warning { mac: String, remaining_min: u32 },

    /// Daily allowance exhausted; device auto-blocked
    LimitExceeded { mac: String },

    /// Device active inside its restriction window
    RestrictedTimeAccess { mac: String },

    /// Action sink acknowledged an enforcement change
    ActionApplied { mac: String, action: Action },

    /// Action sink failed or timed out; retried next cycle
    ActionFailed { mac: String, action: Action, error: String },
}

/// Sending half of the event channel
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<EngineEvent>,
}

impl EventPublisher {
    /// Publish without blocking; drops on a full channel
    pub fn publish(&self, event: EngineEvent) {
        if let Err(e) = self.tx.try_send(event) {
            debug!("Event channel full or closed, dropping event: {}", e);
        }
    }
}

/// Create the engine event channel
pub fn channel(capacity: usize) -> (EventPublisher, mpsc::Receiver<EngineEvent>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventPublisher { tx }, rx)
}
