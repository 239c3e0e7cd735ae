//! Store error types.

use kiln_core::StorePath;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid derivation: {0}")]
    InvalidDerivation(#[from] serde_json::Error),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("no derivation at {0}")]
    MissingDerivation(StorePath),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
