//! In-memory build store.
//!
//! Mirrors the PostgreSQL implementation's semantics exactly, including the
//! optimistic compare-and-set mutations and the all-or-nothing partition
//! commit, so the lifecycle can be exercised in tests and local development
//! without a database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slipway_core::{
    AttemptState, Branch, Build, BuildAttempt, BuildPart, BuildState, Partition, ResourceId,
};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::BuildStore;
use crate::{StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    branches: HashMap<ResourceId, Branch>,
    builds: HashMap<ResourceId, Build>,
    parts: HashMap<ResourceId, BuildPart>,
    attempts: HashMap<ResourceId, BuildAttempt>,
}

/// Build store held entirely in memory.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_age<T: Clone>(
    items: impl Iterator<Item = T>,
    key: impl Fn(&T) -> (DateTime<Utc>, ResourceId),
) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by_key(|item| key(item));
    out
}

#[async_trait]
impl BuildStore for MemoryStore {
    async fn create_branch(&self, name: &str, convergence: bool) -> StoreResult<Branch> {
        let mut inner = self.inner.lock().unwrap();
        if inner.branches.values().any(|b| b.name == name) {
            return Err(StoreError::Duplicate(format!("branch '{name}'")));
        }
        let branch = Branch {
            id: ResourceId::new(),
            name: name.to_string(),
            convergence,
            created_at: Utc::now(),
        };
        inner.branches.insert(branch.id, branch.clone());
        Ok(branch)
    }

    async fn get_branch(&self, id: ResourceId) -> StoreResult<Branch> {
        let inner = self.inner.lock().unwrap();
        inner
            .branches
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("branch {id}")))
    }

    async fn branch_by_name(&self, name: &str) -> StoreResult<Option<Branch>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.branches.values().find(|b| b.name == name).cloned())
    }

    async fn create_build(
        &self,
        branch_id: ResourceId,
        git_ref: &str,
        merge_on_success: bool,
    ) -> StoreResult<Build> {
        let mut inner = self.inner.lock().unwrap();
        let clash = inner.builds.values().any(|b| {
            b.branch_id == branch_id && b.git_ref == git_ref && !b.state.is_terminal()
        });
        if clash {
            return Err(StoreError::Duplicate(format!(
                "live build for ref '{git_ref}'"
            )));
        }
        let now = Utc::now();
        let build = Build {
            id: ResourceId::new(),
            branch_id,
            git_ref: git_ref.to_string(),
            state: BuildState::Partitioning,
            merge_on_success,
            promoted: false,
            error_details: None,
            created_at: now,
            updated_at: now,
        };
        inner.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: ResourceId) -> StoreResult<Build> {
        let inner = self.inner.lock().unwrap();
        inner
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))
    }

    async fn build_for_ref(
        &self,
        branch_id: ResourceId,
        git_ref: &str,
    ) -> StoreResult<Option<Build>> {
        let inner = self.inner.lock().unwrap();
        let newest = sorted_by_age(
            inner
                .builds
                .values()
                .filter(|b| b.branch_id == branch_id && b.git_ref == git_ref)
                .cloned(),
            |b| (b.created_at, b.id),
        )
        .pop();
        Ok(newest)
    }

    async fn live_builds_for_branch(&self, branch_id: ResourceId) -> StoreResult<Vec<Build>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_by_age(
            inner
                .builds
                .values()
                .filter(|b| b.branch_id == branch_id && !b.state.is_terminal())
                .cloned(),
            |b| (b.created_at, b.id),
        ))
    }

    async fn latest_build_for_branch(&self, branch_id: ResourceId) -> StoreResult<Option<Build>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_by_age(
            inner
                .builds
                .values()
                .filter(|b| b.branch_id == branch_id)
                .cloned(),
            |b| (b.created_at, b.id),
        )
        .pop())
    }

    async fn build_before(
        &self,
        branch_id: ResourceId,
        before: DateTime<Utc>,
    ) -> StoreResult<Option<Build>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_by_age(
            inner
                .builds
                .values()
                .filter(|b| b.branch_id == branch_id && b.created_at < before)
                .cloned(),
            |b| (b.created_at, b.id),
        )
        .pop())
    }

    async fn newer_build_exists(
        &self,
        branch_id: ResourceId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .builds
            .values()
            .any(|b| b.branch_id == branch_id && b.created_at > after))
    }

    async fn last_green_ref(&self, branch_id: ResourceId) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_by_age(
            inner
                .builds
                .values()
                .filter(|b| b.branch_id == branch_id && b.state == BuildState::Succeeded)
                .cloned(),
            |b| (b.created_at, b.id),
        )
        .pop()
        .map(|b| b.git_ref))
    }

    async fn transition_build(
        &self,
        id: ResourceId,
        from: BuildState,
        to: BuildState,
    ) -> StoreResult<Option<Build>> {
        let mut inner = self.inner.lock().unwrap();
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))?;
        build.updated_at = Utc::now();
        if build.state != from {
            return Ok(None);
        }
        build.state = to;
        Ok(Some(build.clone()))
    }

    async fn touch_build(&self, id: ResourceId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(build) = inner.builds.get_mut(&id) {
            build.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_build_error(&self, id: ResourceId, detail: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))?;
        build.error_details = Some(detail.to_string());
        build.updated_at = Utc::now();
        Ok(())
    }

    async fn set_promoted(&self, id: ResourceId) -> StoreResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        let build = inner
            .builds
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))?;
        if build.promoted {
            return Ok(false);
        }
        build.promoted = true;
        build.updated_at = Utc::now();
        Ok(true)
    }

    async fn abort_build(&self, id: ResourceId) -> StoreResult<Option<Build>> {
        let mut inner = self.inner.lock().unwrap();
        let Some(build) = inner.builds.get_mut(&id) else {
            return Err(StoreError::NotFound(format!("build {id}")));
        };
        if build.state.is_terminal() {
            return Ok(None);
        }
        build.state = BuildState::Aborted;
        build.merge_on_success = false;
        build.updated_at = Utc::now();
        let aborted = build.clone();

        let part_ids: Vec<ResourceId> = inner
            .parts
            .values()
            .filter(|p| p.build_id == id)
            .map(|p| p.id)
            .collect();
        for attempt in inner.attempts.values_mut() {
            if part_ids.contains(&attempt.build_part_id)
                && attempt.state == AttemptState::Runnable
            {
                attempt.state = AttemptState::Aborted;
                attempt.finished_at = Some(Utc::now());
            }
        }
        Ok(Some(aborted))
    }

    async fn commit_partition_set(
        &self,
        build_id: ResourceId,
        partitions: &[Partition],
    ) -> StoreResult<Vec<(BuildPart, BuildAttempt)>> {
        if partitions.is_empty() {
            return Err(StoreError::InvalidData("empty partition set".to_string()));
        }
        if partitions.iter().any(|p| p.items.is_empty()) {
            return Err(StoreError::InvalidData(
                "partition with no items".to_string(),
            ));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.parts.values().any(|p| p.build_id == build_id) {
            return Err(StoreError::AlreadyPartitioned(build_id));
        }
        let build = inner
            .builds
            .get(&build_id)
            .ok_or_else(|| StoreError::NotFound(format!("build {build_id}")))?;
        if !matches!(
            build.state,
            BuildState::Partitioning | BuildState::WaitingForSync
        ) {
            return Err(StoreError::InvalidData(format!(
                "build {build_id} is not awaiting partitioning"
            )));
        }

        let now = Utc::now();
        let mut created = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let part = BuildPart {
                id: ResourceId::new(),
                build_id,
                kind: partition.kind.clone(),
                paths: partition.items.clone(),
                queue: partition.queue.clone(),
                retry_budget: partition.retry_budget,
                options: partition.options.clone(),
                created_at: now,
            };
            let attempt = BuildAttempt {
                id: ResourceId::new(),
                build_part_id: part.id,
                state: AttemptState::Runnable,
                builder: None,
                started_at: None,
                finished_at: None,
                created_at: now,
            };
            inner.parts.insert(part.id, part.clone());
            inner.attempts.insert(attempt.id, attempt.clone());
            created.push((part, attempt));
        }

        let build = inner.builds.get_mut(&build_id).unwrap();
        build.state = BuildState::Runnable;
        build.updated_at = Utc::now();

        Ok(created)
    }

    async fn get_part(&self, id: ResourceId) -> StoreResult<BuildPart> {
        let inner = self.inner.lock().unwrap();
        inner
            .parts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build part {id}")))
    }

    async fn parts_for_build(&self, build_id: ResourceId) -> StoreResult<Vec<BuildPart>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_by_age(
            inner
                .parts
                .values()
                .filter(|p| p.build_id == build_id)
                .cloned(),
            |p| (p.created_at, p.id),
        ))
    }

    async fn count_parts(&self, build_id: ResourceId) -> StoreResult<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.parts.values().filter(|p| p.build_id == build_id).count() as u64)
    }

    async fn get_attempt(&self, id: ResourceId) -> StoreResult<BuildAttempt> {
        let inner = self.inner.lock().unwrap();
        inner
            .attempts
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("attempt {id}")))
    }

    async fn attempts_for_part(&self, part_id: ResourceId) -> StoreResult<Vec<BuildAttempt>> {
        let inner = self.inner.lock().unwrap();
        Ok(sorted_by_age(
            inner
                .attempts
                .values()
                .filter(|a| a.build_part_id == part_id)
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn attempts_for_build(&self, build_id: ResourceId) -> StoreResult<Vec<BuildAttempt>> {
        let inner = self.inner.lock().unwrap();
        let part_ids: Vec<ResourceId> = inner
            .parts
            .values()
            .filter(|p| p.build_id == build_id)
            .map(|p| p.id)
            .collect();
        Ok(sorted_by_age(
            inner
                .attempts
                .values()
                .filter(|a| part_ids.contains(&a.build_part_id))
                .cloned(),
            |a| (a.created_at, a.id),
        ))
    }

    async fn create_attempt(&self, part_id: ResourceId) -> StoreResult<BuildAttempt> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.parts.contains_key(&part_id) {
            return Err(StoreError::NotFound(format!("build part {part_id}")));
        }
        let attempt = BuildAttempt {
            id: ResourceId::new(),
            build_part_id: part_id,
            state: AttemptState::Runnable,
            builder: None,
            started_at: None,
            finished_at: None,
            created_at: Utc::now(),
        };
        inner.attempts.insert(attempt.id, attempt.clone());
        Ok(attempt)
    }

    async fn start_attempt(&self, id: ResourceId, builder: &str) -> StoreResult<BuildAttempt> {
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {id}")))?;
        if attempt.state != AttemptState::Runnable {
            return Err(StoreError::AttemptConflict {
                attempt_id: id,
                expected: AttemptState::Runnable,
                actual: attempt.state,
            });
        }
        attempt.state = AttemptState::Running;
        attempt.builder = Some(builder.to_string());
        attempt.started_at = Some(Utc::now());
        Ok(attempt.clone())
    }

    async fn finish_attempt(
        &self,
        id: ResourceId,
        state: AttemptState,
    ) -> StoreResult<BuildAttempt> {
        if !state.is_terminal() {
            return Err(StoreError::InvalidData(format!(
                "finish to non-terminal state '{state}'"
            )));
        }
        let mut inner = self.inner.lock().unwrap();
        let attempt = inner
            .attempts
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {id}")))?;
        if attempt.state != AttemptState::Running {
            return Err(StoreError::AttemptConflict {
                attempt_id: id,
                expected: AttemptState::Running,
                actual: attempt.state,
            });
        }
        attempt.state = state;
        attempt.finished_at = Some(Utc::now());
        Ok(attempt.clone())
    }

    async fn stale_running_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuildAttempt>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .attempts
            .values()
            .filter(|a| {
                a.state == AttemptState::Running
                    && a.started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn build_for_attempt(&self, attempt_id: ResourceId) -> StoreResult<Build> {
        let inner = self.inner.lock().unwrap();
        let attempt = inner
            .attempts
            .get(&attempt_id)
            .ok_or_else(|| StoreError::NotFound(format!("attempt {attempt_id}")))?;
        let part = inner
            .parts
            .get(&attempt.build_part_id)
            .ok_or_else(|| StoreError::NotFound(format!("part {}", attempt.build_part_id)))?;
        inner
            .builds
            .get(&part.build_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("build {}", part.build_id)))
    }
}
