//! Work queue trait.
//!
//! The queue transport is an external collaborator: the core enqueues a
//! payload and expects the worker that eventually claims it to call back into
//! the lifecycle mutation API. Nothing else is consumed from the transport.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{ResourceId, Result};

/// Everything a worker needs to execute one attempt independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPayload {
    /// Attempt the worker must start/finish through the mutation API.
    pub attempt_id: ResourceId,
    /// Commit to check out.
    pub git_ref: String,
    /// Test category.
    pub kind: String,
    /// File or module paths to cover.
    pub items: Vec<String>,
    /// Opaque options bag from the partition.
    pub options: serde_json::Value,
}

/// Trait for work queue transports.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Name of this transport.
    fn name(&self) -> &'static str;

    /// Fire-and-forget enqueue onto a named queue.
    ///
    /// A transport outage surfaces as [`Error::QueueUnavailable`] and must be
    /// propagated synchronously to the caller; nothing is partially enqueued
    /// from the caller's point of view.
    ///
    /// [`Error::QueueUnavailable`]: crate::Error::QueueUnavailable
    async fn enqueue(&self, queue: &str, payload: WorkPayload) -> Result<()>;
}
