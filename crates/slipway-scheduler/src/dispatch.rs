//! Dispatcher: materializes partitions into persisted parts and attempts,
//! then hands the work to the queue.

use std::sync::Arc;
use tracing::info;

use slipway_core::queue::{WorkPayload, WorkQueue};
use slipway_core::{Build, BuildAttempt, BuildPart, Partition};
use slipway_db::{BuildStore, StoreError};

use crate::error::SchedulerError;

pub struct Dispatcher {
    store: Arc<dyn BuildStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn BuildStore>, queue: Arc<dyn WorkQueue>) -> Self {
        Self { store, queue }
    }

    /// Persist the partition set for a build, all-or-nothing, and enqueue
    /// every initial attempt. Refused once any part exists for the build. A
    /// queue outage propagates to the caller with the build left `runnable`
    /// for an external retry; the queue is expected to deduplicate by
    /// attempt id.
    pub async fn dispatch(
        &self,
        build: &Build,
        partitions: Vec<Partition>,
    ) -> Result<Vec<BuildPart>, SchedulerError> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        if self.store.count_parts(build.id).await? > 0 {
            return Err(StoreError::AlreadyPartitioned(build.id).into());
        }

        let created = self.store.commit_partition_set(build.id, &partitions).await?;
        info!(
            build_id = %build.id,
            parts = created.len(),
            transport = self.queue.name(),
            "partition set committed"
        );

        for (part, attempt) in &created {
            self.enqueue_attempt(build, part, attempt).await?;
        }

        Ok(created.into_iter().map(|(part, _)| part).collect())
    }

    /// Hand one attempt to the queue with everything a worker needs to run
    /// it independently. Also the re-entry point for retries.
    pub async fn enqueue_attempt(
        &self,
        build: &Build,
        part: &BuildPart,
        attempt: &BuildAttempt,
    ) -> Result<(), SchedulerError> {
        let payload = WorkPayload {
            attempt_id: attempt.id,
            git_ref: build.git_ref.clone(),
            kind: part.kind.clone(),
            items: part.paths.clone(),
            options: part.options.clone(),
        };
        self.queue.enqueue(&part.queue, payload).await?;
        Ok(())
    }
}
