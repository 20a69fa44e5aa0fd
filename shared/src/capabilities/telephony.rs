use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelephonyError {
    #[error("device cannot place calls")]
    Unsupported,

    #[error("dialer failed: {0}")]
    DialFailed(String),
}

/// Hands a number to the platform dialer. The call itself is owned by the OS.
#[async_trait::async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn dial(&self, number: &str) -> Result<(), TelephonyError>;
}
