//! Error types shared by the collaborator traits.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("remote server error: {0}")]
    Remote(String),

    #[error("checkout error: {0}")]
    Checkout(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
