//! Scheduler error types.

use slipway_db::StoreError;
use slipway_partition::PartitionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Partition(#[from] PartitionError),

    #[error(transparent)]
    Core(#[from] slipway_core::Error),
}

impl SchedulerError {
    /// Whether this is a lost optimistic race on an attempt mutation. The
    /// caller must treat it as supersession, not retry it.
    pub fn is_attempt_conflict(&self) -> bool {
        matches!(
            self,
            SchedulerError::Store(StoreError::AttemptConflict { .. })
        )
    }

    /// Whether the work-queue transport rejected the enqueue.
    pub fn is_queue_unavailable(&self) -> bool {
        matches!(
            self,
            SchedulerError::Core(slipway_core::Error::QueueUnavailable(_))
        )
    }
}
