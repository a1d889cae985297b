//! End-to-end lifecycle scenarios against the in-memory store.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use slipway_config::{SystemConfig, parse_config};
use slipway_core::queue::{WorkPayload, WorkQueue};
use slipway_core::remote::{CommitState, RemoteServer};
use slipway_core::{
    AttemptResult, AttemptState, Branch, Build, BuildAttempt, BuildPart, BuildState, Partition,
};
use slipway_db::{BuildStore, MemoryStore};
use slipway_partition::Partitioner;
use slipway_scheduler::{BuildLifecycle, Dispatcher};

struct RecordingQueue {
    jobs: Mutex<Vec<(String, WorkPayload)>>,
    fail: AtomicBool,
}

impl RecordingQueue {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    fn job_count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[async_trait]
impl WorkQueue for RecordingQueue {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn enqueue(&self, queue: &str, payload: WorkPayload) -> slipway_core::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(slipway_core::Error::QueueUnavailable(
                "transport down".to_string(),
            ));
        }
        self.jobs
            .lock()
            .unwrap()
            .push((queue.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRemote {
    statuses: Mutex<Vec<(String, CommitState)>>,
    promotions: Mutex<Vec<String>>,
    merges: Mutex<Vec<(String, String)>>,
    fail_merge: AtomicBool,
}

#[async_trait]
impl RemoteServer for RecordingRemote {
    async fn update_commit_status(
        &self,
        git_ref: &str,
        state: CommitState,
        _description: &str,
    ) -> slipway_core::Result<()> {
        self.statuses
            .lock()
            .unwrap()
            .push((git_ref.to_string(), state));
        Ok(())
    }

    async fn promote(&self, git_ref: &str) -> slipway_core::Result<()> {
        self.promotions.lock().unwrap().push(git_ref.to_string());
        Ok(())
    }

    async fn merge(&self, branch: &str, git_ref: &str) -> slipway_core::Result<()> {
        if self.fail_merge.load(Ordering::SeqCst) {
            return Err(slipway_core::Error::Remote("merge rejected".to_string()));
        }
        self.merges
            .lock()
            .unwrap()
            .push((branch.to_string(), git_ref.to_string()));
        Ok(())
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    queue: Arc<RecordingQueue>,
    remote: Arc<RecordingRemote>,
    lifecycle: BuildLifecycle,
}

fn harness_with(system: SystemConfig) -> Harness {
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
    let queue = Arc::new(RecordingQueue::new());
    let remote = Arc::new(RecordingRemote::default());
    let dispatcher = Arc::new(Dispatcher::new(store.clone(), queue.clone()));
    let lifecycle = BuildLifecycle::new(store.clone(), dispatcher, remote.clone(), system);
    Harness {
        store,
        queue,
        remote,
        lifecycle,
    }
}

fn harness() -> Harness {
    harness_with(SystemConfig::default())
}

fn partition(kind: &str, items: &[&str], retry_budget: u32) -> Partition {
    Partition {
        kind: kind.to_string(),
        items: items.iter().map(|s| s.to_string()).collect(),
        queue: "developer".to_string(),
        retry_budget,
        options: serde_json::json!({}),
    }
}

impl Harness {
    async fn branch(&self, name: &str, convergence: bool) -> Branch {
        self.store.create_branch(name, convergence).await.unwrap()
    }

    /// Create a build with the given partitions already dispatched, and
    /// return its parts paired with their initial attempts.
    async fn dispatched_build(
        &self,
        branch: &Branch,
        git_ref: &str,
        merge_on_success: bool,
        partitions: Vec<Partition>,
    ) -> (Build, Vec<(BuildPart, BuildAttempt)>) {
        let build = self
            .lifecycle
            .observe_commit(branch, git_ref, merge_on_success)
            .await
            .unwrap()
            .unwrap();
        let dispatcher = Dispatcher::new(self.store.clone(), self.queue.clone());
        let parts = dispatcher.dispatch(&build, partitions).await.unwrap();

        let mut pairs = Vec::new();
        for part in parts {
            let attempts = self.store.attempts_for_part(part.id).await.unwrap();
            pairs.push((part, attempts.into_iter().next().unwrap()));
        }
        let build = self.store.get_build(build.id).await.unwrap();
        (build, pairs)
    }

    async fn pass(&self, attempt: &BuildAttempt) -> BuildState {
        self.lifecycle
            .start(attempt.id, "builder-test")
            .await
            .unwrap();
        self.lifecycle
            .finish(attempt.id, AttemptResult::Passed)
            .await
            .unwrap()
            .build_state
    }

    async fn fail(&self, attempt: &BuildAttempt) -> BuildState {
        self.lifecycle
            .start(attempt.id, "builder-test")
            .await
            .unwrap();
        self.lifecycle
            .finish(attempt.id, AttemptResult::Failed)
            .await
            .unwrap()
            .build_state
    }

    async fn build_state(&self, build: &Build) -> BuildState {
        self.store.get_build(build.id).await.unwrap().state
    }
}

// Scenario A: part1 passes first try; part2 fails then passes on retry
// (budget 1). Final state succeeded, part2 has exactly two attempts.
#[tokio::test]
async fn scenario_a_retry_then_success() {
    let h = harness();
    let branch = h.branch("feature/a", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc123",
            false,
            vec![partition("unit", &["m1"], 1), partition("unit", &["m2"], 1)],
        )
        .await;
    assert_eq!(build.state, BuildState::Runnable);
    assert_eq!(h.queue.job_count(), 2);

    assert_eq!(h.pass(&pairs[0].1).await, BuildState::Running);
    assert_eq!(h.fail(&pairs[1].1).await, BuildState::Running);

    // The retry was created runnable and re-enqueued.
    let attempts = h.store.attempts_for_part(pairs[1].0.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].state, AttemptState::Runnable);
    assert_eq!(h.queue.job_count(), 3);

    let final_state = h.pass(&attempts[1]).await;
    assert_eq!(final_state, BuildState::Succeeded);
    assert_eq!(
        h.store.attempts_for_part(pairs[1].0.id).await.unwrap().len(),
        2
    );
}

// Scenarios B and C: a failed part with no budget dooms the build while a
// sibling still runs; once every part is terminal the verdict is failed.
#[tokio::test]
async fn scenario_b_c_doomed_then_failed() {
    let h = harness();
    let branch = h.branch("feature/b", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc124",
            false,
            vec![
                partition("unit", &["m1"], 0),
                partition("unit", &["m2"], 0),
                partition("unit", &["m3"], 0),
            ],
        )
        .await;

    assert_eq!(h.pass(&pairs[0].1).await, BuildState::Running);
    h.lifecycle
        .start(pairs[1].1.id, "builder-test")
        .await
        .unwrap();
    assert_eq!(h.fail(&pairs[2].1).await, BuildState::Doomed);

    // Scenario C: the still-running part finishes failed too.
    let state = h
        .lifecycle
        .finish(pairs[1].1.id, AttemptResult::Failed)
        .await
        .unwrap()
        .build_state;
    assert_eq!(state, BuildState::Failed);
    assert_eq!(h.build_state(&build).await, BuildState::Failed);
}

// Scenario E: abort cancels the runnable attempt immediately, leaves the
// running one to finish, and that finish never revives the build.
#[tokio::test]
async fn scenario_e_abort_wins() {
    let h = harness();
    let branch = h.branch("feature/e", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc125",
            true,
            vec![partition("unit", &["m1"], 0), partition("unit", &["m2"], 0)],
        )
        .await;

    h.lifecycle
        .start(pairs[0].1.id, "builder-test")
        .await
        .unwrap();

    let aborted = h.lifecycle.abort(build.id).await.unwrap();
    assert_eq!(aborted.state, BuildState::Aborted);
    assert!(!aborted.merge_on_success);

    let runnable_attempt = h.store.get_attempt(pairs[1].1.id).await.unwrap();
    assert_eq!(runnable_attempt.state, AttemptState::Aborted);
    let running_attempt = h.store.get_attempt(pairs[0].1.id).await.unwrap();
    assert_eq!(running_attempt.state, AttemptState::Running);

    // The in-flight finish is accepted for bookkeeping only (P4).
    let outcome = h
        .lifecycle
        .finish(pairs[0].1.id, AttemptResult::Passed)
        .await
        .unwrap();
    assert_eq!(outcome.attempt.state, AttemptState::Passed);
    assert_eq!(outcome.build_state, BuildState::Aborted);
    assert_eq!(h.build_state(&build).await, BuildState::Aborted);

    // Aborting again stays put.
    let again = h.lifecycle.abort(build.id).await.unwrap();
    assert_eq!(again.state, BuildState::Aborted);
}

// P2: recomputing against unchanged data yields the same state and fires
// side effects only once.
#[tokio::test]
async fn recompute_is_idempotent() {
    let h = harness();
    let branch = h.branch("feature/p2", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc126",
            false,
            vec![partition("unit", &["m1"], 0)],
        )
        .await;

    let state = h.pass(&pairs[0].1).await;
    assert_eq!(state, BuildState::Succeeded);
    let statuses_after = h.remote.statuses.lock().unwrap().len();
    let stamped = h.store.get_build(build.id).await.unwrap().updated_at;

    let state = h.lifecycle.recompute(build.id).await.unwrap();
    assert_eq!(state, BuildState::Succeeded);
    // No new transition events, but the freshness marker moved.
    assert_eq!(h.remote.statuses.lock().unwrap().len(), statuses_after);
    assert!(h.store.get_build(build.id).await.unwrap().updated_at >= stamped);
}

// P3: a terminal attempt never moves; an identical repeat finish is a no-op.
#[tokio::test]
async fn terminal_attempts_are_immutable() {
    let h = harness();
    let branch = h.branch("feature/p3", false).await;
    let (_build, pairs) = h
        .dispatched_build(
            &branch,
            "abc127",
            false,
            vec![partition("unit", &["m1"], 0)],
        )
        .await;
    let attempt = &pairs[0].1;

    h.pass(attempt).await;

    let err = h
        .lifecycle
        .finish(attempt.id, AttemptResult::Failed)
        .await
        .unwrap_err();
    assert!(err.is_attempt_conflict());

    let repeat = h
        .lifecycle
        .finish(attempt.id, AttemptResult::Passed)
        .await
        .unwrap();
    assert_eq!(repeat.attempt.state, AttemptState::Passed);
}

// P5: a part with budget 1 receives at most two attempts.
#[tokio::test]
async fn retry_budget_is_a_hard_cap() {
    let h = harness();
    let branch = h.branch("feature/p5", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc128",
            false,
            vec![partition("unit", &["m1"], 1)],
        )
        .await;

    assert_eq!(h.fail(&pairs[0].1).await, BuildState::Running);
    let attempts = h.store.attempts_for_part(pairs[0].0.id).await.unwrap();
    assert_eq!(attempts.len(), 2);

    assert_eq!(h.fail(&attempts[1]).await, BuildState::Failed);
    assert_eq!(
        h.store.attempts_for_part(pairs[0].0.id).await.unwrap().len(),
        2
    );
    assert_eq!(h.build_state(&build).await, BuildState::Failed);
}

#[tokio::test]
async fn non_retryable_kinds_fail_immediately() {
    let mut system = SystemConfig::default();
    system.non_retryable_kinds = vec!["deploy".to_string()];
    let h = harness_with(system);
    let branch = h.branch("feature/nr", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc129",
            false,
            vec![partition("deploy", &["m1"], 5)],
        )
        .await;

    assert_eq!(h.fail(&pairs[0].1).await, BuildState::Failed);
    assert_eq!(
        h.store.attempts_for_part(pairs[0].0.id).await.unwrap().len(),
        1
    );
    assert_eq!(h.build_state(&build).await, BuildState::Failed);
}

// An errored attempt with no budget left makes the build errored even while
// a sibling is still pending.
#[tokio::test]
async fn errored_part_preempts_pending_siblings() {
    let h = harness();
    let branch = h.branch("feature/err", false).await;
    let (build, pairs) = h
        .dispatched_build(
            &branch,
            "abc130",
            false,
            vec![partition("unit", &["m1"], 0), partition("unit", &["m2"], 0)],
        )
        .await;

    h.lifecycle
        .start(pairs[0].1.id, "builder-test")
        .await
        .unwrap();
    let state = h
        .lifecycle
        .finish(pairs[0].1.id, AttemptResult::Errored)
        .await
        .unwrap()
        .build_state;
    assert_eq!(state, BuildState::Errored);
    assert_eq!(h.build_state(&build).await, BuildState::Errored);
}

#[tokio::test]
async fn supersession_aborts_only_older_builds() {
    let h = harness();
    let branch = h.branch("feature/super", false).await;

    let first = h
        .lifecycle
        .observe_commit(&branch, "c1", false)
        .await
        .unwrap()
        .unwrap();
    let second = h
        .lifecycle
        .observe_commit(&branch, "c2", false)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(h.build_state(&first).await, BuildState::Aborted);
    assert_eq!(h.build_state(&second).await, BuildState::Partitioning);

    // Re-observing a known commit creates nothing.
    assert!(h
        .lifecycle
        .observe_commit(&branch, "c2", false)
        .await
        .unwrap()
        .is_none());
    assert!(h
        .lifecycle
        .observe_commit(&branch, "c1", false)
        .await
        .unwrap()
        .is_none());
    assert_eq!(h.build_state(&second).await, BuildState::Partitioning);
}

#[tokio::test]
async fn convergence_success_promotes_exactly_once() {
    let h = harness();
    let branch = h.branch("main", true).await;
    let (build, pairs) = h
        .dispatched_build(&branch, "abc131", false, vec![partition("unit", &["m1"], 0)])
        .await;

    assert_eq!(h.pass(&pairs[0].1).await, BuildState::Succeeded);
    assert_eq!(h.remote.promotions.lock().unwrap().as_slice(), ["abc131"]);
    assert!(h.store.get_build(build.id).await.unwrap().promoted);

    // A second recomputation never re-promotes.
    h.lifecycle.recompute(build.id).await.unwrap();
    assert_eq!(h.remote.promotions.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_on_success_requires_no_newer_build() {
    let h = harness();
    let branch = h.branch("feature/merge", false).await;
    let (_build, pairs) = h
        .dispatched_build(&branch, "m1", true, vec![partition("unit", &["m1"], 0)])
        .await;

    assert_eq!(h.pass(&pairs[0].1).await, BuildState::Succeeded);
    assert_eq!(
        h.remote.merges.lock().unwrap().as_slice(),
        [("feature/merge".to_string(), "m1".to_string())]
    );

    // A strictly newer build blocks the older one's auto-merge. Created
    // straight through the store to model a commit observed while the older
    // build was mid-flight.
    let (_newer, newer_pairs) = h
        .dispatched_build(&branch, "m2", true, vec![partition("unit", &["m1"], 0)])
        .await;
    h.store.create_build(branch.id, "m3", false).await.unwrap();
    assert_eq!(h.pass(&newer_pairs[0].1).await, BuildState::Succeeded);
    assert_eq!(h.remote.merges.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn merge_failure_never_changes_build_state() {
    let h = harness();
    h.remote.fail_merge.store(true, Ordering::SeqCst);
    let branch = h.branch("feature/mf", false).await;
    let (build, pairs) = h
        .dispatched_build(&branch, "mf1", true, vec![partition("unit", &["m1"], 0)])
        .await;

    assert_eq!(h.pass(&pairs[0].1).await, BuildState::Succeeded);
    assert_eq!(h.build_state(&build).await, BuildState::Succeeded);
    assert!(h.remote.merges.lock().unwrap().is_empty());
}

// P1 at the dispatch boundary: an empty plan commits nothing and leaves the
// build state untouched; a queue outage leaves the committed set runnable.
#[tokio::test]
async fn dispatch_boundaries() {
    let h = harness();
    let branch = h.branch("feature/p1", false).await;
    let build = h
        .lifecycle
        .observe_commit(&branch, "p1ref", false)
        .await
        .unwrap()
        .unwrap();
    let dispatcher = Dispatcher::new(h.store.clone(), h.queue.clone());

    let parts = dispatcher.dispatch(&build, Vec::new()).await.unwrap();
    assert!(parts.is_empty());
    assert_eq!(h.build_state(&build).await, BuildState::Partitioning);
    assert_eq!(h.store.count_parts(build.id).await.unwrap(), 0);

    h.queue.fail.store(true, Ordering::SeqCst);
    let err = dispatcher
        .dispatch(&build, vec![partition("unit", &["m1"], 0)])
        .await
        .unwrap_err();
    assert!(err.is_queue_unavailable());
    // The set was committed atomically; only the enqueue needs retrying.
    assert_eq!(h.build_state(&build).await, BuildState::Runnable);
    assert_eq!(h.store.count_parts(build.id).await.unwrap(), 1);

    // And a second partitioning pass is refused outright.
    h.queue.fail.store(false, Ordering::SeqCst);
    let err = dispatcher
        .dispatch(&build, vec![partition("unit", &["m2"], 0)])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        slipway_scheduler::SchedulerError::Store(slipway_db::StoreError::AlreadyPartitioned(_))
    ));
}

struct UnsyncedCheckout;

#[async_trait]
impl slipway_core::checkout::SourceCheckout for UnsyncedCheckout {
    async fn changed_files_since(
        &self,
        git_ref: &str,
        _baseline: &str,
    ) -> slipway_core::Result<Vec<String>> {
        Err(slipway_core::Error::RefNotFound(git_ref.to_string()))
    }

    async fn merge_base(
        &self,
        git_ref: &str,
        _other: &str,
    ) -> slipway_core::Result<Option<String>> {
        Err(slipway_core::Error::RefNotFound(git_ref.to_string()))
    }

    async fn workspace_for(&self, git_ref: &str) -> slipway_core::Result<PathBuf> {
        Err(slipway_core::Error::RefNotFound(git_ref.to_string()))
    }
}

// A ref the checkout never learns about errors the build after the bounded
// sync retries, with the diagnostic recorded.
#[tokio::test]
async fn unsynced_ref_errors_the_build() {
    let mut system = SystemConfig::default();
    system.sync_retries = 2;
    system.sync_retry_delay_secs = 0;
    let h = harness_with(system.clone());

    let config = parse_config(
        r#"
        system { sync-retries 2 sync-retry-delay-secs 0 }
        target "unit" {
            strategy "module-graph"
            workers 2
        }
        "#,
    )
    .unwrap();
    let partitioner = Partitioner::new(config, Arc::new(UnsyncedCheckout));

    let branch = h.branch("feature/sync", false).await;
    let build = h
        .lifecycle
        .observe_commit(&branch, "ghost", false)
        .await
        .unwrap()
        .unwrap();

    let err = h
        .lifecycle
        .partition_and_dispatch(&partitioner, build.id)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        slipway_scheduler::SchedulerError::Partition(_)
    ));

    let build = h.store.get_build(build.id).await.unwrap();
    assert_eq!(build.state, BuildState::Errored);
    assert!(build.error_details.unwrap().contains("ghost"));
}
