//! The build lifecycle state machine.
//!
//! Aggregates attempt outcomes into a build verdict and applies the retry,
//! promotion, merge, abort and supersession policies. All state lives in the
//! store; every derivation re-reads it, so concurrent workers finishing
//! sibling parts converge on the same result without a scheduler lock.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use slipway_config::SystemConfig;
use slipway_core::remote::{CommitState, RemoteServer};
use slipway_core::{
    AttemptResult, AttemptState, Branch, Build, BuildAttempt, BuildPart, BuildState, ResourceId,
};
use slipway_db::{BuildStore, StoreError};
use slipway_partition::{BuildContext, Partitioner};

use crate::dispatch::Dispatcher;
use crate::error::SchedulerError;

/// Result of an accepted attempt mutation: the attempt after the write plus
/// the build state the mutation settled on.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub attempt: BuildAttempt,
    pub build_state: BuildState,
}

/// Pure derivation of a build's aggregate state from its parts' current
/// attempt states. The sticky abort rule is applied by the caller from the
/// stored build, everything else lives here.
///
/// Precedence: succeeded, then errored, then failed, then doomed, then
/// running.
pub fn derive_state(parts: &[BuildPart], attempts: &[BuildAttempt]) -> BuildState {
    let mut latest: HashMap<ResourceId, &BuildAttempt> = HashMap::new();
    let mut passed: HashMap<ResourceId, bool> = HashMap::new();
    for attempt in attempts {
        if attempt.state == AttemptState::Passed {
            passed.insert(attempt.build_part_id, true);
        }
        // Attempts arrive oldest first; the last one per part wins.
        latest.insert(attempt.build_part_id, attempt);
    }

    let all_passed = parts
        .iter()
        .all(|part| passed.get(&part.id).copied().unwrap_or(false));
    if all_passed {
        return BuildState::Succeeded;
    }

    let latest_state =
        |part: &BuildPart| latest.get(&part.id).map(|attempt| attempt.state);

    if parts
        .iter()
        .any(|part| latest_state(part) == Some(AttemptState::Errored))
    {
        return BuildState::Errored;
    }

    let all_terminal = parts
        .iter()
        .all(|part| latest_state(part).is_some_and(|state| state.is_terminal()));
    let any_failed = parts
        .iter()
        .any(|part| latest_state(part) == Some(AttemptState::Failed));

    if all_terminal && any_failed {
        return BuildState::Failed;
    }
    if any_failed {
        // Failure is certain; remaining parts still run for full feedback.
        return BuildState::Doomed;
    }
    BuildState::Running
}

/// The reactive lifecycle engine.
pub struct BuildLifecycle {
    store: Arc<dyn BuildStore>,
    dispatcher: Arc<Dispatcher>,
    remote: Arc<dyn RemoteServer>,
    system: SystemConfig,
}

impl BuildLifecycle {
    pub fn new(
        store: Arc<dyn BuildStore>,
        dispatcher: Arc<Dispatcher>,
        remote: Arc<dyn RemoteServer>,
        system: SystemConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            remote,
            system,
        }
    }

    // --- mutation API ---

    /// Worker claims an attempt: `runnable → running`. A conflict means the
    /// attempt was superseded or aborted; the caller must drop the work.
    pub async fn start(
        &self,
        attempt_id: ResourceId,
        builder: &str,
    ) -> Result<MutationOutcome, SchedulerError> {
        let attempt = self.store.start_attempt(attempt_id, builder).await?;
        debug!(attempt_id = %attempt_id, builder = %builder, "attempt started");
        let build_state = self.on_attempt_mutation(&attempt).await?;
        Ok(MutationOutcome {
            attempt,
            build_state,
        })
    }

    /// Worker (or the timeout sweep) reports an attempt outcome:
    /// `running → terminal`. Repeating an identical finish on an
    /// already-terminal attempt is accepted as a no-op.
    pub async fn finish(
        &self,
        attempt_id: ResourceId,
        result: AttemptResult,
    ) -> Result<MutationOutcome, SchedulerError> {
        let attempt = match self.store.finish_attempt(attempt_id, result.state()).await {
            Ok(attempt) => attempt,
            Err(StoreError::AttemptConflict { actual, .. }) if actual == result.state() => {
                // Idempotent repeat; no mutation happened, no events fire.
                let attempt = self.store.get_attempt(attempt_id).await?;
                let build = self.store.build_for_attempt(attempt_id).await?;
                return Ok(MutationOutcome {
                    attempt,
                    build_state: build.state,
                });
            }
            Err(e) => return Err(e.into()),
        };
        info!(attempt_id = %attempt_id, result = %result.state(), "attempt finished");
        let build_state = self.on_attempt_mutation(&attempt).await?;
        Ok(MutationOutcome {
            attempt,
            build_state,
        })
    }

    /// Synchronous follow-up to every accepted attempt mutation: run the
    /// retry policy, then re-derive the build state from fresh data.
    async fn on_attempt_mutation(
        &self,
        attempt: &BuildAttempt,
    ) -> Result<BuildState, SchedulerError> {
        let part = self.store.get_part(attempt.build_part_id).await?;
        let build = self.store.get_build(part.build_id).await?;

        if build.state != BuildState::Aborted
            && attempt.state.is_terminal()
            && matches!(attempt.state, AttemptState::Failed | AttemptState::Errored)
        {
            self.maybe_retry(&build, &part).await?;
        }

        self.recompute(build.id).await
    }

    /// Create and enqueue a fresh attempt for an unsuccessful part, unless
    /// the retry budget is spent, the part already passed, or its kind is
    /// configured non-retryable.
    async fn maybe_retry(&self, build: &Build, part: &BuildPart) -> Result<(), SchedulerError> {
        if !self.system.is_retryable_kind(&part.kind) {
            return Ok(());
        }
        let attempts = self.store.attempts_for_part(part.id).await?;
        if attempts.iter().any(|a| a.state == AttemptState::Passed) {
            return Ok(());
        }
        // Budget N allows N retries on top of the initial attempt.
        if attempts.len() as u32 >= part.retry_budget + 1 {
            debug!(part_id = %part.id, "retry budget exhausted");
            return Ok(());
        }
        // Another finisher may have already created the retry.
        if attempts
            .last()
            .is_some_and(|a| !matches!(a.state, AttemptState::Failed | AttemptState::Errored))
        {
            return Ok(());
        }

        let retry = self.store.create_attempt(part.id).await?;
        info!(
            part_id = %part.id,
            attempt_id = %retry.id,
            attempt_number = attempts.len() + 1,
            "retrying part"
        );
        self.dispatcher.enqueue_attempt(build, part, &retry).await?;
        Ok(())
    }

    /// Re-derive the build state and commit it if it changed. Committing is
    /// a compare-and-set; a lost race re-reads and re-derives, so concurrent
    /// invocations converge with side effects firing exactly once per
    /// transition.
    pub async fn recompute(&self, build_id: ResourceId) -> Result<BuildState, SchedulerError> {
        loop {
            let build = self.store.get_build(build_id).await?;
            if build.state.is_terminal() {
                // Aborted is sticky, and no attempt outcome can move any
                // other terminal verdict.
                self.store.touch_build(build_id).await?;
                return Ok(build.state);
            }

            let parts = self.store.parts_for_build(build_id).await?;
            if parts.is_empty() {
                self.store.touch_build(build_id).await?;
                return Ok(build.state);
            }
            let attempts = self.store.attempts_for_build(build_id).await?;
            let derived = derive_state(&parts, &attempts);

            if derived == build.state {
                self.store.touch_build(build_id).await?;
                return Ok(derived);
            }

            match self
                .store
                .transition_build(build_id, build.state, derived)
                .await?
            {
                Some(updated) => {
                    self.on_transition(&updated).await;
                    return Ok(derived);
                }
                None => {
                    debug!(build_id = %build_id, "lost transition race, re-deriving");
                }
            }
        }
    }

    /// Side effects of a committed transition. External failures are logged
    /// and never roll back build state.
    async fn on_transition(&self, build: &Build) {
        info!(build_id = %build.id, state = %build.state, "build transitioned");

        let status = match build.state {
            BuildState::Partitioning | BuildState::WaitingForSync | BuildState::Runnable => {
                CommitState::Pending
            }
            BuildState::Running | BuildState::Doomed => CommitState::Running,
            BuildState::Succeeded => CommitState::Success,
            BuildState::Failed => CommitState::Failure,
            BuildState::Errored | BuildState::Aborted => CommitState::Error,
        };
        if let Err(e) = self
            .remote
            .update_commit_status(&build.git_ref, status, build.state.as_str())
            .await
        {
            warn!(build_id = %build.id, error = %e, "commit status update failed");
        }

        if build.state == BuildState::Succeeded {
            self.on_success(build).await;
        }
    }

    async fn on_success(&self, build: &Build) {
        let branch = match self.store.get_branch(build.branch_id).await {
            Ok(branch) => branch,
            Err(e) => {
                warn!(build_id = %build.id, error = %e, "branch lookup failed");
                return;
            }
        };

        if branch.convergence {
            match self.store.set_promoted(build.id).await {
                Ok(true) => {
                    if let Err(e) = self.remote.promote(&build.git_ref).await {
                        warn!(build_id = %build.id, error = %e, "promotion failed");
                    } else {
                        info!(build_id = %build.id, git_ref = %build.git_ref, "promoted");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(build_id = %build.id, error = %e, "promotion flag update failed"),
            }
            return;
        }

        if build.merge_on_success {
            let newer = self
                .store
                .newer_build_exists(build.branch_id, build.created_at)
                .await;
            match newer {
                Ok(false) => {
                    // Merge failure is reported but never changes build state.
                    if let Err(e) = self.remote.merge(&branch.name, &build.git_ref).await {
                        warn!(build_id = %build.id, error = %e, "auto-merge failed");
                    } else {
                        info!(build_id = %build.id, branch = %branch.name, "auto-merged");
                    }
                }
                Ok(true) => {
                    debug!(build_id = %build.id, "newer build exists, skipping auto-merge");
                }
                Err(e) => warn!(build_id = %build.id, error = %e, "newer-build check failed"),
            }
        }
    }

    // --- abort and supersession ---

    /// Abort a build: sticky `aborted` state, merge-on-success cleared, every
    /// still-runnable attempt cancelled. Running attempts are left to finish
    /// on their own; their results are recorded but never revive the build.
    pub async fn abort(&self, build_id: ResourceId) -> Result<Build, SchedulerError> {
        match self.store.abort_build(build_id).await? {
            Some(build) => {
                info!(build_id = %build_id, "build aborted");
                self.on_transition(&build).await;
                Ok(build)
            }
            None => {
                debug!(build_id = %build_id, "abort on terminal build ignored");
                Ok(self.store.get_build(build_id).await?)
            }
        }
    }

    /// React to a newly observed commit on a branch: create its build and
    /// abort every older live build. Returns `None` when the commit already
    /// has a build. The newest build is never the one aborted.
    pub async fn observe_commit(
        &self,
        branch: &Branch,
        git_ref: &str,
        merge_on_success: bool,
    ) -> Result<Option<Build>, SchedulerError> {
        if self
            .store
            .build_for_ref(branch.id, git_ref)
            .await?
            .is_some()
        {
            debug!(branch = %branch.name, git_ref = %git_ref, "commit already has a build");
            return Ok(None);
        }

        let build = self
            .store
            .create_build(branch.id, git_ref, merge_on_success)
            .await?;
        info!(build_id = %build.id, branch = %branch.name, git_ref = %git_ref, "build created");

        for stale in self.store.live_builds_for_branch(branch.id).await? {
            if stale.id != build.id && stale.created_at <= build.created_at {
                info!(build_id = %stale.id, superseded_by = %build.id, "superseding build");
                self.abort(stale.id).await?;
            }
        }

        if let Err(e) = self
            .remote
            .update_commit_status(git_ref, CommitState::Pending, "partitioning")
            .await
        {
            warn!(build_id = %build.id, error = %e, "commit status update failed");
        }

        Ok(Some(build))
    }

    // --- partitioning entry point ---

    /// Partition a freshly created build and dispatch the result. A missing
    /// ref is retried with bounded backoff (the build parks in
    /// `waiting_for_sync` between tries); a malformed graph errors the build
    /// immediately; a queue outage propagates with the build left `runnable`.
    pub async fn partition_and_dispatch(
        &self,
        partitioner: &Partitioner,
        build_id: ResourceId,
    ) -> Result<Vec<BuildPart>, SchedulerError> {
        let build = self.store.get_build(build_id).await?;
        let branch = self.store.get_branch(build.branch_id).await?;
        let ctx = BuildContext {
            git_ref: build.git_ref.clone(),
            convergence: branch.convergence,
            last_green_ref: self.store.last_green_ref(branch.id).await?,
            previously_failed: self.previously_failed_paths(&build).await?,
            timings: None,
        };

        let mut sync_tries = 0u32;
        loop {
            match partitioner.partitions_for(&ctx).await {
                Ok(partitions) if partitions.is_empty() => {
                    // Nothing to test; the build stays put and an operator
                    // (or the next commit) decides.
                    warn!(build_id = %build.id, "partitioning selected no work");
                    return Ok(Vec::new());
                }
                Ok(partitions) => {
                    let parts = self.dispatcher.dispatch(&build, partitions).await?;
                    return Ok(parts);
                }
                Err(e) if e.is_ref_not_found() && sync_tries < self.system.sync_retries => {
                    sync_tries += 1;
                    warn!(
                        build_id = %build.id,
                        git_ref = %build.git_ref,
                        try_number = sync_tries,
                        "ref not found yet, waiting for sync"
                    );
                    self.store
                        .transition_build(
                            build.id,
                            BuildState::Partitioning,
                            BuildState::WaitingForSync,
                        )
                        .await?;
                    tokio::time::sleep(Duration::from_secs(self.system.sync_retry_delay_secs))
                        .await;
                    self.store
                        .transition_build(
                            build.id,
                            BuildState::WaitingForSync,
                            BuildState::Partitioning,
                        )
                        .await?;
                }
                Err(e) => {
                    self.error_build(&build, &e.to_string()).await?;
                    return Err(e.into());
                }
            }
        }
    }

    /// Error a build out of partitioning with diagnostic detail attached.
    async fn error_build(&self, build: &Build, detail: &str) -> Result<(), SchedulerError> {
        self.store.set_build_error(build.id, detail).await?;
        for from in [BuildState::Partitioning, BuildState::WaitingForSync] {
            if let Some(updated) = self
                .store
                .transition_build(build.id, from, BuildState::Errored)
                .await?
            {
                self.on_transition(&updated).await;
                break;
            }
        }
        Ok(())
    }

    /// Module paths of every part that ended `failed` in the branch's build
    /// immediately preceding this one.
    async fn previously_failed_paths(&self, build: &Build) -> Result<Vec<String>, SchedulerError> {
        let Some(previous) = self
            .store
            .build_before(build.branch_id, build.created_at)
            .await?
        else {
            return Ok(Vec::new());
        };

        let parts = self.store.parts_for_build(previous.id).await?;
        let attempts = self.store.attempts_for_build(previous.id).await?;
        let mut latest: HashMap<ResourceId, AttemptState> = HashMap::new();
        for attempt in &attempts {
            latest.insert(attempt.build_part_id, attempt.state);
        }

        let mut paths = Vec::new();
        for part in parts {
            if latest.get(&part.id) == Some(&AttemptState::Failed) {
                paths.extend(part.paths);
            }
        }
        Ok(paths)
    }

    /// Cutoff instant for the stuck-attempt sweep.
    pub fn stale_cutoff(&self) -> chrono::DateTime<Utc> {
        Utc::now() - chrono::Duration::minutes(self.system.attempt_timeout_mins as i64)
    }
}
