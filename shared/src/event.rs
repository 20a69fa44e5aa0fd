use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::AppError;
use crate::escalation::NotificationStatus;
use crate::model::{AlertId, EmergencyAlert, EmergencyType, RideId};

pub const EVENT_BUS_CAPACITY: usize = 64;

/// Things the UI reacts to beyond plain state snapshots: haptics, toasts,
/// closing modals. Large variants are boxed.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub enum SafetyEvent {
    CountdownStarted {
        emergency_type: EmergencyType,
        seconds_remaining: u32,
    },
    CountdownTick {
        emergency_type: EmergencyType,
        seconds_remaining: u32,
    },
    CountdownCancelled {
        emergency_type: EmergencyType,
    },
    AlertTriggered(Box<EmergencyAlert>),
    /// The countdown expired but the alert could not be recorded.
    TriggerFailed(Box<AppError>),
    AlertResolved(Box<EmergencyAlert>),
    NotificationStatusChanged {
        alert_id: AlertId,
        status: NotificationStatus,
    },
    PinIncorrect {
        ride_id: RideId,
    },
    PinVerified {
        ride_id: RideId,
    },
}

#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<SafetyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender }
    }

    /// Fire and forget; having no subscriber is not an error.
    pub fn publish(&self, event: SafetyEvent) {
        if self.sender.send(event).is_err() {
            trace!("safety event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SafetyEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
