//! Trip safety core: the emergency alert lifecycle and the pickup pin
//! handshake, shared by the rider and driver apps.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod emergency;
pub mod error;
pub mod escalation;
pub mod event;
pub mod facade;
pub mod model;
pub mod pin;
pub mod pin_entry;
pub mod timer;

pub use capabilities::Providers;
pub use config::{RetryPolicy, SafetyConfig};
pub use emergency::{EmergencyEngine, EmergencyState};
pub use error::{AppError, ErrorKind, ErrorSeverity, SafetyError};
pub use escalation::NotificationStatus;
pub use event::{EventBus, SafetyEvent};
pub use facade::SafetyCore;
pub use model::{
    AlertId, AlertStatus, Coordinates, EmergencyAlert, EmergencyContact, EmergencyType,
    PhoneNumber, Pin, PinRecord, RideId, UnixTimeMs, UserId, ValidationError, PIN_LENGTH,
};
pub use pin::PinProtocol;
pub use pin_entry::{AttemptResult, EntryOutcome, PinEntry, PinEntrySession};
