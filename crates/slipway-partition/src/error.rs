//! Partitioning errors.

use thiserror::Error;

use crate::graph::GraphError;

#[derive(Debug, Error)]
pub enum PartitionError {
    /// The module graph is malformed; the build errors immediately, no retry.
    #[error("dependency graph malformed: {0}")]
    Graph(#[from] GraphError),

    #[error("module manifest {path}: {source}")]
    Manifest {
        path: String,
        source: slipway_config::ConfigError,
    },

    /// Checkout-side failure, including a missing ref.
    #[error(transparent)]
    Checkout(#[from] slipway_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PartitionError {
    /// Whether this failure may resolve itself by waiting for the checkout
    /// to sync.
    pub fn is_ref_not_found(&self) -> bool {
        matches!(self, PartitionError::Checkout(slipway_core::Error::RefNotFound(_)))
    }
}
