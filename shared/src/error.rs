use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::capabilities::{ContactsError, RandomError, StoreError, TelephonyError};
use crate::model::EmergencyAlert;

#[derive(Debug, Clone, Error)]
pub enum SafetyError {
    #[error("an emergency alert is already active: {}", .existing.id())]
    AlreadyActive { existing: Box<EmergencyAlert> },

    #[error("cannot {operation} while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },

    #[error("no signed-in user")]
    NoSession,

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("no primary emergency contact")]
    NoPrimaryContact,

    #[error("contacts error: {0}")]
    Contacts(#[from] ContactsError),

    #[error("telephony error: {0}")]
    Telephony(#[from] TelephonyError),

    #[error("random error: {0}")]
    Random(#[from] RandomError),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("{operation} did not finish")]
    Interrupted { operation: &'static str },
}

impl SafetyError {
    /// The alert a rejected trigger collided with, so the UI can show it.
    pub fn existing_alert(&self) -> Option<&EmergencyAlert> {
        match self {
            SafetyError::AlreadyActive { existing } => Some(&**existing),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Transient,
    Permanent,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    AlreadyActive,
    InvalidState,
    Authentication,
    Storage,
    Conflict,
    Contacts,
    NoPrimaryContact,
    Telephony,
    Crypto,
    Validation,
    Interrupted,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::AlreadyActive => "EMERGENCY_ALREADY_ACTIVE",
            Self::InvalidState => "INVALID_STATE",
            Self::Authentication => "AUTH_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Conflict => "CONFLICT",
            Self::Contacts => "CONTACTS_ERROR",
            Self::NoPrimaryContact => "NO_PRIMARY_CONTACT",
            Self::Telephony => "TELEPHONY_ERROR",
            Self::Crypto => "CRYPTO_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Interrupted => "INTERRUPTED",
        }
    }

    #[must_use]
    pub const fn default_severity(self) -> ErrorSeverity {
        match self {
            Self::Storage | Self::Contacts | Self::Telephony | Self::Interrupted => {
                ErrorSeverity::Transient
            }
            Self::AlreadyActive
            | Self::Conflict
            | Self::InvalidState
            | Self::Authentication
            | Self::NoPrimaryContact
            | Self::Validation => ErrorSeverity::Permanent,
            Self::Crypto => ErrorSeverity::Fatal,
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Storage | Self::Contacts | Self::Telephony | Self::Interrupted
        )
    }
}

/// Display-ready error for the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    /// Whether the UI should offer a retry button.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable() && !matches!(self.severity, ErrorSeverity::Fatal)
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::AlreadyActive => {
                "An emergency alert is already active. View its details instead.".into()
            }
            ErrorKind::InvalidState => "That action isn't available right now.".into(),
            ErrorKind::Authentication => "Please sign in to raise an emergency alert.".into(),
            ErrorKind::Storage | ErrorKind::Interrupted => {
                "We couldn't record that. Please try again.".into()
            }
            ErrorKind::Conflict => "This was already changed on another device.".into(),
            ErrorKind::Contacts => "Unable to load your emergency contacts.".into(),
            ErrorKind::NoPrimaryContact => {
                "Choose a primary emergency contact in your safety settings.".into()
            }
            ErrorKind::Telephony => "Unable to start the call. Please dial manually.".into(),
            ErrorKind::Crypto => "A security error occurred. Please restart the app.".into(),
            ErrorKind::Validation => self.message.clone(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)
    }
}

impl std::error::Error for AppError {}

impl From<&SafetyError> for AppError {
    fn from(e: &SafetyError) -> Self {
        let kind = match e {
            SafetyError::AlreadyActive { .. } => ErrorKind::AlreadyActive,
            SafetyError::InvalidTransition { .. } => ErrorKind::InvalidState,
            SafetyError::NoSession => ErrorKind::Authentication,
            SafetyError::Persistence(StoreError::Conflict(_)) => ErrorKind::Conflict,
            SafetyError::Persistence(_) => ErrorKind::Storage,
            SafetyError::NoPrimaryContact => ErrorKind::NoPrimaryContact,
            SafetyError::Contacts(_) => ErrorKind::Contacts,
            SafetyError::Telephony(_) => ErrorKind::Telephony,
            SafetyError::Random(_) => ErrorKind::Crypto,
            SafetyError::InvalidConfig(_) => ErrorKind::Validation,
            SafetyError::Interrupted { .. } => ErrorKind::Interrupted,
        };
        let mut app = AppError::new(kind, e.to_string());
        if let SafetyError::Persistence(store) = e {
            if !store.is_retryable() && !matches!(store, StoreError::Conflict(_)) {
                app.severity = ErrorSeverity::Fatal;
            }
        }
        if let Some(existing) = e.existing_alert() {
            app = app.with_context("alert_id", existing.id().as_str());
        }
        app
    }
}

impl From<SafetyError> for AppError {
    fn from(e: SafetyError) -> Self {
        AppError::from(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmergencyType, UnixTimeMs, UserId};

    #[test]
    fn already_active_carries_alert_id() {
        let alert = EmergencyAlert::new(
            UserId::new("u1").unwrap(),
            EmergencyType::Panic,
            UnixTimeMs(0),
            None,
        );
        let err = SafetyError::AlreadyActive {
            existing: Box::new(alert.clone()),
        };
        assert_eq!(err.existing_alert(), Some(&alert));

        let app = AppError::from(&err);
        assert_eq!(app.code(), "EMERGENCY_ALREADY_ACTIVE");
        assert_eq!(app.context.get("alert_id").map(String::as_str), Some(alert.id().as_str()));
        assert!(!app.is_retryable());
    }

    #[test]
    fn transient_persistence_failure_is_retryable() {
        let app = AppError::from(SafetyError::Persistence(StoreError::unavailable("offline")));
        assert_eq!(app.kind, ErrorKind::Storage);
        assert!(app.is_retryable());
    }

    #[test]
    fn corrupt_persistence_failure_is_not_retryable() {
        let app = AppError::from(SafetyError::Persistence(StoreError::Serialization {
            message: "bad json".into(),
        }));
        assert_eq!(app.kind, ErrorKind::Storage);
        assert_eq!(app.severity, ErrorSeverity::Fatal);
        assert!(!app.is_retryable());
    }

    #[test]
    fn store_conflict_is_not_offered_a_retry() {
        let app = AppError::from(SafetyError::Persistence(StoreError::Conflict(
            "alert already active".into(),
        )));
        assert_eq!(app.kind, ErrorKind::Conflict);
        assert_eq!(app.severity, ErrorSeverity::Permanent);
        assert!(!app.is_retryable());
        assert!(!app.user_facing_message().contains("try again"));
    }

    #[test]
    fn user_messages_never_echo_internals_for_storage() {
        let app = AppError::from(SafetyError::Persistence(StoreError::unavailable(
            "socket reset by peer",
        )));
        assert!(!app.user_facing_message().contains("socket"));
    }
}
