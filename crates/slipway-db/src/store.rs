//! The build store trait.
//!
//! One trait rather than per-aggregate repositories: the lifecycle's
//! operations cross aggregates (state derivation reads parts and attempts
//! together, the partition commit writes three tables in one transaction), so
//! the store boundary sits where the transaction boundary is.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slipway_core::{
    AttemptState, Branch, Build, BuildAttempt, BuildPart, BuildState, Partition, ResourceId,
};

use crate::StoreResult;

#[async_trait]
pub trait BuildStore: Send + Sync {
    // --- branches ---

    /// Register a branch. Duplicate names are rejected.
    async fn create_branch(&self, name: &str, convergence: bool) -> StoreResult<Branch>;

    async fn get_branch(&self, id: ResourceId) -> StoreResult<Branch>;

    async fn branch_by_name(&self, name: &str) -> StoreResult<Option<Branch>>;

    // --- builds ---

    /// Create a build in `partitioning` state for a (branch, commit) pair.
    async fn create_build(
        &self,
        branch_id: ResourceId,
        git_ref: &str,
        merge_on_success: bool,
    ) -> StoreResult<Build>;

    async fn get_build(&self, id: ResourceId) -> StoreResult<Build>;

    /// Any build (terminal or not) for this exact (branch, commit) pair.
    async fn build_for_ref(&self, branch_id: ResourceId, git_ref: &str)
    -> StoreResult<Option<Build>>;

    /// All non-terminal builds on a branch, oldest first.
    async fn live_builds_for_branch(&self, branch_id: ResourceId) -> StoreResult<Vec<Build>>;

    /// The most recently created build on a branch.
    async fn latest_build_for_branch(&self, branch_id: ResourceId) -> StoreResult<Option<Build>>;

    /// The build created immediately before `before` on a branch.
    async fn build_before(
        &self,
        branch_id: ResourceId,
        before: DateTime<Utc>,
    ) -> StoreResult<Option<Build>>;

    /// Whether a build created strictly after `after` exists on the branch.
    async fn newer_build_exists(
        &self,
        branch_id: ResourceId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Ref of the most recent succeeded build on a branch, if any.
    async fn last_green_ref(&self, branch_id: ResourceId) -> StoreResult<Option<String>>;

    /// Compare-and-set the build state. Returns the updated build when the
    /// stored state matched `from`, `None` when another writer got there
    /// first. The freshness marker is bumped either way.
    async fn transition_build(
        &self,
        id: ResourceId,
        from: BuildState,
        to: BuildState,
    ) -> StoreResult<Option<Build>>;

    /// Bump the freshness marker without changing state.
    async fn touch_build(&self, id: ResourceId) -> StoreResult<()>;

    /// Attach diagnostic detail to the build.
    async fn set_build_error(&self, id: ResourceId, detail: &str) -> StoreResult<()>;

    /// Claim the promotion slot: flips `promoted` false→true. Returns whether
    /// this caller won the flip.
    async fn set_promoted(&self, id: ResourceId) -> StoreResult<bool>;

    /// Abort a build: state to `aborted` (only from a non-terminal state),
    /// `merge_on_success` cleared, and every still-`runnable` attempt of its
    /// parts moved to `aborted`, all in one transaction. Returns the updated
    /// build, or `None` when the build was already terminal.
    async fn abort_build(&self, id: ResourceId) -> StoreResult<Option<Build>>;

    // --- parts and attempts ---

    /// Atomically materialize a partition set: one part plus one initial
    /// `runnable` attempt per partition, and the build moved to `runnable`.
    /// Rejected with [`StoreError::AlreadyPartitioned`] if any part already
    /// exists for the build; a partial set is never committed.
    ///
    /// [`StoreError::AlreadyPartitioned`]: crate::StoreError::AlreadyPartitioned
    async fn commit_partition_set(
        &self,
        build_id: ResourceId,
        partitions: &[Partition],
    ) -> StoreResult<Vec<(BuildPart, BuildAttempt)>>;

    async fn get_part(&self, id: ResourceId) -> StoreResult<BuildPart>;

    async fn parts_for_build(&self, build_id: ResourceId) -> StoreResult<Vec<BuildPart>>;

    async fn count_parts(&self, build_id: ResourceId) -> StoreResult<u64>;

    async fn get_attempt(&self, id: ResourceId) -> StoreResult<BuildAttempt>;

    /// All attempts for a part, oldest first.
    async fn attempts_for_part(&self, part_id: ResourceId) -> StoreResult<Vec<BuildAttempt>>;

    /// All attempts across a build's parts, oldest first.
    async fn attempts_for_build(&self, build_id: ResourceId) -> StoreResult<Vec<BuildAttempt>>;

    /// Create a fresh `runnable` attempt for a part (retry path).
    async fn create_attempt(&self, part_id: ResourceId) -> StoreResult<BuildAttempt>;

    /// Optimistic start: `runnable → running`, recording the builder and the
    /// start time. Rejected with [`StoreError::AttemptConflict`] otherwise.
    ///
    /// [`StoreError::AttemptConflict`]: crate::StoreError::AttemptConflict
    async fn start_attempt(&self, id: ResourceId, builder: &str) -> StoreResult<BuildAttempt>;

    /// Optimistic finish: `running → terminal`, recording the finish time.
    /// Rejected with [`StoreError::AttemptConflict`] otherwise; the caller
    /// decides whether a conflict against an identical terminal state is an
    /// idempotent no-op.
    ///
    /// [`StoreError::AttemptConflict`]: crate::StoreError::AttemptConflict
    async fn finish_attempt(&self, id: ResourceId, state: AttemptState)
    -> StoreResult<BuildAttempt>;

    /// Attempts still `running` whose start time is older than `cutoff`.
    async fn stale_running_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuildAttempt>>;

    /// The build an attempt ultimately belongs to.
    async fn build_for_attempt(&self, attempt_id: ResourceId) -> StoreResult<Build>;
}
