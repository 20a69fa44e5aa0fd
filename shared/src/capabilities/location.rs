use thiserror::Error;

use crate::model::Coordinates;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LocationError {
    #[error("location permission denied")]
    PermissionDenied,

    #[error("location services disabled")]
    ServicesDisabled,

    #[error("no fix within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("location provider error: {0}")]
    Provider(String),
}

#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    async fn current_location(&self) -> Result<Coordinates, LocationError>;
}
