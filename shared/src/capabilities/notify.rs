use thiserror::Error;

use crate::model::{EmergencyAlert, EmergencyContact};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("network error: {0}")]
    Network(String),

    #[error("rejected by server: {0}")]
    Rejected(String),
}

impl NotifyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, NotifyError::Network(_))
    }
}

/// Backend call that tells contacts about an alert (SMS, push, whatever the
/// server fans out to).
#[async_trait::async_trait]
pub trait ContactNotifier: Send + Sync {
    async fn notify(
        &self,
        alert: &EmergencyAlert,
        contacts: &[EmergencyContact],
    ) -> Result<(), NotifyError>;
}
