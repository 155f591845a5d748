use hostlb_core::{ProviderError, StateError};
use thiserror::Error;

/// Failure to build a snapshot. Fatal to the current cycle only.
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("provider unavailable: {0}")]
    Provider(#[from] ProviderError),

    #[error("invalid inventory: {0}")]
    InvalidInventory(#[from] StateError),
}

pub type CollectionResult<T> = Result<T, CollectionError>;
