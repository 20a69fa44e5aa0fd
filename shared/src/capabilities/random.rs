use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RandomError {
    #[error("secure random unavailable")]
    Unavailable,
}

pub trait RandomProvider: Send + Sync {
    fn fill(&self, out: &mut [u8]) -> Result<(), RandomError>;
}

pub struct OsRng;

impl RandomProvider for OsRng {
    fn fill(&self, out: &mut [u8]) -> Result<(), RandomError> {
        getrandom::getrandom(out).map_err(|_| RandomError::Unavailable)
    }
}
