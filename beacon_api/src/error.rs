use anyhow::{Error as AnyhowError, Result};
use strum::Display;
use thiserror::Error;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Resource {
    Block,
    BlockRewards,
    Duties,
    State,
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// The resource does not exist. Empty slots and missing reward reports end up here.
    #[error("{resource} {id} not found")]
    NotFound { resource: Resource, id: u64 },
    #[error("failed to fetch {resource} {id}: {message}")]
    Transport {
        resource: Resource,
        id: u64,
        message: String,
    },
}

#[must_use]
pub fn is_not_found(error: &AnyhowError) -> bool {
    matches!(
        error.downcast_ref(),
        Some(FetchError::NotFound { .. }),
    )
}

/// Treats [`FetchError::NotFound`] as an empty but valid result.
pub fn found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(error) if is_not_found(&error) => Ok(None),
        Err(error) => Err(error),
    }
}
