use thiserror::Error;

use crate::model::EmergencyContact;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ContactsError {
    #[error("contacts unavailable: {0}")]
    Unavailable(String),

    #[error("contacts permission denied")]
    PermissionDenied,
}

/// Read-only view of the emergency contacts the account UI maintains.
#[async_trait::async_trait]
pub trait ContactsProvider: Send + Sync {
    async fn emergency_contacts(&self) -> Result<Vec<EmergencyContact>, ContactsError>;
}
