//! Remote hosting server trait.
//!
//! Commit-status updates, promotion and merge execution live on the hosting
//! side. Failures here are logged by the caller and never roll back build
//! state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Commit status as understood by the hosting service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Running,
    Success,
    Failure,
    Error,
}

/// Trait for the source-hosting server.
#[async_trait]
pub trait RemoteServer: Send + Sync {
    /// Push a commit status for `git_ref`.
    async fn update_commit_status(
        &self,
        git_ref: &str,
        state: CommitState,
        description: &str,
    ) -> Result<()>;

    /// Push the deployable reference for a succeeded convergence build.
    async fn promote(&self, git_ref: &str) -> Result<()>;

    /// Merge `git_ref` into its target; called for succeeded builds that
    /// requested merge-on-success.
    async fn merge(&self, branch: &str, git_ref: &str) -> Result<()>;
}
