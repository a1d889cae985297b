//! Store error types.

use slipway_core::{AttemptState, ResourceId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// An optimistic attempt mutation lost its race: the attempt was not in
    /// the expected pre-state. Signals supersession or abort; the caller must
    /// not blindly retry.
    #[error("attempt {attempt_id} is {actual}, expected {expected}")]
    AttemptConflict {
        attempt_id: ResourceId,
        expected: AttemptState,
        actual: AttemptState,
    },

    /// A partition set already exists for the build.
    #[error("build {0} is already partitioned")]
    AlreadyPartitioned(ResourceId),

    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
