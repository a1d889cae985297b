//! Source checkout trait.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::Result;

/// Trait for the source-control checkout service.
///
/// A commit the service cannot locate surfaces as
/// [`Error::RefNotFound`](crate::Error::RefNotFound); during partitioning the
/// caller retries that with bounded backoff before erroring the build.
#[async_trait]
pub trait SourceCheckout: Send + Sync {
    /// Files changed between `baseline` and `git_ref`.
    async fn changed_files_since(&self, git_ref: &str, baseline: &str) -> Result<Vec<String>>;

    /// The branch point of `git_ref` against `other`, if one exists.
    async fn merge_base(&self, git_ref: &str, other: &str) -> Result<Option<String>>;

    /// A local workspace with `git_ref` checked out.
    async fn workspace_for(&self, git_ref: &str) -> Result<PathBuf>;
}
