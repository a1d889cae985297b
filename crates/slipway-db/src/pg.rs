//! PostgreSQL implementation of the build store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slipway_core::{
    AttemptState, Branch, Build, BuildAttempt, BuildPart, BuildState, Partition, ResourceId,
};
use sqlx::PgPool;
use uuid::Uuid;

use crate::store::BuildStore;
use crate::{StoreError, StoreResult};

const TERMINAL_BUILD_STATES: &str = "('succeeded', 'failed', 'errored', 'aborted')";

/// Build store backed by PostgreSQL.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BranchRecord {
    id: Uuid,
    name: String,
    convergence: bool,
    created_at: DateTime<Utc>,
}

impl From<BranchRecord> for Branch {
    fn from(r: BranchRecord) -> Self {
        Branch {
            id: r.id.into(),
            name: r.name,
            convergence: r.convergence,
            created_at: r.created_at,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct BuildRecord {
    id: Uuid,
    branch_id: Uuid,
    git_ref: String,
    state: String,
    merge_on_success: bool,
    promoted: bool,
    error_details: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<BuildRecord> for Build {
    type Error = StoreError;

    fn try_from(r: BuildRecord) -> StoreResult<Self> {
        Ok(Build {
            id: r.id.into(),
            branch_id: r.branch_id.into(),
            git_ref: r.git_ref,
            state: parse_state(&r.state)?,
            merge_on_success: r.merge_on_success,
            promoted: r.promoted,
            error_details: r.error_details,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PartRecord {
    id: Uuid,
    build_id: Uuid,
    kind: String,
    paths: serde_json::Value,
    queue: String,
    retry_budget: i32,
    options: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl TryFrom<PartRecord> for BuildPart {
    type Error = StoreError;

    fn try_from(r: PartRecord) -> StoreResult<Self> {
        let paths: Vec<String> = serde_json::from_value(r.paths)
            .map_err(|e| StoreError::InvalidData(format!("part paths: {e}")))?;
        Ok(BuildPart {
            id: r.id.into(),
            build_id: r.build_id.into(),
            kind: r.kind,
            paths,
            queue: r.queue,
            retry_budget: u32::try_from(r.retry_budget)
                .map_err(|_| StoreError::InvalidData("negative retry budget".to_string()))?,
            options: r.options,
            created_at: r.created_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AttemptRecord {
    id: Uuid,
    build_part_id: Uuid,
    state: String,
    builder: Option<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AttemptRecord> for BuildAttempt {
    type Error = StoreError;

    fn try_from(r: AttemptRecord) -> StoreResult<Self> {
        Ok(BuildAttempt {
            id: r.id.into(),
            build_part_id: r.build_part_id.into(),
            state: parse_state(&r.state)?,
            builder: r.builder,
            started_at: r.started_at,
            finished_at: r.finished_at,
            created_at: r.created_at,
        })
    }
}

fn parse_state<S: std::str::FromStr<Err = slipway_core::Error>>(s: &str) -> StoreResult<S> {
    s.parse().map_err(|e: slipway_core::Error| StoreError::InvalidData(e.to_string()))
}

fn collect<R, T>(records: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    records.into_iter().map(T::try_from).collect()
}

#[async_trait]
impl BuildStore for PgStore {
    async fn create_branch(&self, name: &str, convergence: bool) -> StoreResult<Branch> {
        let record = sqlx::query_as::<_, BranchRecord>(
            r#"
            INSERT INTO branches (id, name, convergence, created_at)
            VALUES ($1, $2, $3, NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(name)
        .bind(convergence)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(format!("branch '{name}'"))
            }
            _ => StoreError::Database(e),
        })?;
        Ok(record.into())
    }

    async fn get_branch(&self, id: ResourceId) -> StoreResult<Branch> {
        let record = sqlx::query_as::<_, BranchRecord>("SELECT * FROM branches WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("branch {id}")))?;
        Ok(record.into())
    }

    async fn branch_by_name(&self, name: &str) -> StoreResult<Option<Branch>> {
        let record = sqlx::query_as::<_, BranchRecord>("SELECT * FROM branches WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record.map(Into::into))
    }

    async fn create_build(
        &self,
        branch_id: ResourceId,
        git_ref: &str,
        merge_on_success: bool,
    ) -> StoreResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            INSERT INTO builds (id, branch_id, git_ref, state, merge_on_success, promoted, created_at, updated_at)
            VALUES ($1, $2, $3, 'partitioning', $4, FALSE, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(branch_id.as_uuid())
        .bind(git_ref)
        .bind(merge_on_success)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Duplicate(format!("live build for ref '{git_ref}'"))
            }
            _ => StoreError::Database(e),
        })?;
        record.try_into()
    }

    async fn get_build(&self, id: ResourceId) -> StoreResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>("SELECT * FROM builds WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("build {id}")))?;
        record.try_into()
    }

    async fn build_for_ref(
        &self,
        branch_id: ResourceId,
        git_ref: &str,
    ) -> StoreResult<Option<Build>> {
        let record = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE branch_id = $1 AND git_ref = $2 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(branch_id.as_uuid())
        .bind(git_ref)
        .fetch_optional(&self.pool)
        .await?;
        record.map(TryInto::try_into).transpose()
    }

    async fn live_builds_for_branch(&self, branch_id: ResourceId) -> StoreResult<Vec<Build>> {
        let records = sqlx::query_as::<_, BuildRecord>(&format!(
            "SELECT * FROM builds WHERE branch_id = $1 AND state NOT IN {TERMINAL_BUILD_STATES} ORDER BY created_at",
        ))
        .bind(branch_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        collect(records)
    }

    async fn latest_build_for_branch(&self, branch_id: ResourceId) -> StoreResult<Option<Build>> {
        let record = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE branch_id = $1 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(branch_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        record.map(TryInto::try_into).transpose()
    }

    async fn build_before(
        &self,
        branch_id: ResourceId,
        before: DateTime<Utc>,
    ) -> StoreResult<Option<Build>> {
        let record = sqlx::query_as::<_, BuildRecord>(
            "SELECT * FROM builds WHERE branch_id = $1 AND created_at < $2 ORDER BY created_at DESC LIMIT 1",
        )
        .bind(branch_id.as_uuid())
        .bind(before)
        .fetch_optional(&self.pool)
        .await?;
        record.map(TryInto::try_into).transpose()
    }

    async fn newer_build_exists(
        &self,
        branch_id: ResourceId,
        after: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM builds WHERE branch_id = $1 AND created_at > $2",
        )
        .bind(branch_id.as_uuid())
        .bind(after)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn last_green_ref(&self, branch_id: ResourceId) -> StoreResult<Option<String>> {
        let git_ref: Option<String> = sqlx::query_scalar(
            "SELECT git_ref FROM builds WHERE branch_id = $1 AND state = 'succeeded' ORDER BY created_at DESC LIMIT 1",
        )
        .bind(branch_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        Ok(git_ref)
    }

    async fn transition_build(
        &self,
        id: ResourceId,
        from: BuildState,
        to: BuildState,
    ) -> StoreResult<Option<Build>> {
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            UPDATE builds SET state = $3, updated_at = NOW()
            WHERE id = $1 AND state = $2
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(from.as_str())
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(record.try_into()?)),
            None => {
                // Lost the race; liveness marker still moves.
                self.touch_build(id).await?;
                Ok(None)
            }
        }
    }

    async fn touch_build(&self, id: ResourceId) -> StoreResult<()> {
        sqlx::query("UPDATE builds SET updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_build_error(&self, id: ResourceId, detail: &str) -> StoreResult<()> {
        sqlx::query("UPDATE builds SET error_details = $2, updated_at = NOW() WHERE id = $1")
            .bind(id.as_uuid())
            .bind(detail)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_promoted(&self, id: ResourceId) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE builds SET promoted = TRUE, updated_at = NOW() WHERE id = $1 AND promoted = FALSE",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn abort_build(&self, id: ResourceId) -> StoreResult<Option<Build>> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, BuildRecord>(&format!(
            r#"
            UPDATE builds SET state = 'aborted', merge_on_success = FALSE, updated_at = NOW()
            WHERE id = $1 AND state NOT IN {TERMINAL_BUILD_STATES}
            RETURNING *
            "#,
        ))
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(record) = record else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            UPDATE build_attempts SET state = 'aborted', finished_at = NOW()
            WHERE state = 'runnable'
              AND build_part_id IN (SELECT id FROM build_parts WHERE build_id = $1)
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(record.try_into()?))
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

        let mut tx = self.pool.begin().await?;

        let existing: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM build_parts WHERE build_id = $1")
                .bind(build_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        if existing > 0 {
            tx.rollback().await?;
            return Err(StoreError::AlreadyPartitioned(build_id));
        }

        let mut created = Vec::with_capacity(partitions.len());
        for partition in partitions {
            let part = sqlx::query_as::<_, PartRecord>(
                r#"
                INSERT INTO build_parts (id, build_id, kind, paths, queue, retry_budget, options, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(build_id.as_uuid())
            .bind(&partition.kind)
            .bind(serde_json::json!(partition.items))
            .bind(&partition.queue)
            .bind(partition.retry_budget as i32)
            .bind(partition.options.clone())
            .fetch_one(&mut *tx)
            .await?;

            let attempt = sqlx::query_as::<_, AttemptRecord>(
                r#"
                INSERT INTO build_attempts (id, build_part_id, state, created_at)
                VALUES ($1, $2, 'runnable', NOW())
                RETURNING *
                "#,
            )
            .bind(Uuid::now_v7())
            .bind(part.id)
            .fetch_one(&mut *tx)
            .await?;

            created.push((BuildPart::try_from(part)?, BuildAttempt::try_from(attempt)?));
        }

        let moved = sqlx::query(
            r#"
            UPDATE builds SET state = 'runnable', updated_at = NOW()
            WHERE id = $1 AND state IN ('partitioning', 'waiting_for_sync')
            "#,
        )
        .bind(build_id.as_uuid())
        .execute(&mut *tx)
        .await?;
        if moved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(StoreError::InvalidData(format!(
                "build {build_id} is not awaiting partitioning"
            )));
        }

        tx.commit().await?;
        Ok(created)
    }

    async fn get_part(&self, id: ResourceId) -> StoreResult<BuildPart> {
        let record = sqlx::query_as::<_, PartRecord>("SELECT * FROM build_parts WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("build part {id}")))?;
        record.try_into()
    }

    async fn parts_for_build(&self, build_id: ResourceId) -> StoreResult<Vec<BuildPart>> {
        let records = sqlx::query_as::<_, PartRecord>(
            "SELECT * FROM build_parts WHERE build_id = $1 ORDER BY created_at, id",
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        collect(records)
    }

    async fn count_parts(&self, build_id: ResourceId) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM build_parts WHERE build_id = $1")
            .bind(build_id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn get_attempt(&self, id: ResourceId) -> StoreResult<BuildAttempt> {
        let record =
            sqlx::query_as::<_, AttemptRecord>("SELECT * FROM build_attempts WHERE id = $1")
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("attempt {id}")))?;
        record.try_into()
    }

    async fn attempts_for_part(&self, part_id: ResourceId) -> StoreResult<Vec<BuildAttempt>> {
        let records = sqlx::query_as::<_, AttemptRecord>(
            "SELECT * FROM build_attempts WHERE build_part_id = $1 ORDER BY created_at, id",
        )
        .bind(part_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        collect(records)
    }

    async fn attempts_for_build(&self, build_id: ResourceId) -> StoreResult<Vec<BuildAttempt>> {
        let records = sqlx::query_as::<_, AttemptRecord>(
            r#"
            SELECT a.* FROM build_attempts a
            JOIN build_parts p ON p.id = a.build_part_id
            WHERE p.build_id = $1
            ORDER BY a.created_at, a.id
            "#,
        )
        .bind(build_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        collect(records)
    }

    async fn create_attempt(&self, part_id: ResourceId) -> StoreResult<BuildAttempt> {
        let record = sqlx::query_as::<_, AttemptRecord>(
            r#"
            INSERT INTO build_attempts (id, build_part_id, state, created_at)
            VALUES ($1, $2, 'runnable', NOW())
            RETURNING *
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(part_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn start_attempt(&self, id: ResourceId, builder: &str) -> StoreResult<BuildAttempt> {
        let record = sqlx::query_as::<_, AttemptRecord>(
            r#"
            UPDATE build_attempts SET state = 'running', builder = $2, started_at = NOW()
            WHERE id = $1 AND state = 'runnable'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(builder)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => record.try_into(),
            None => Err(self.attempt_conflict(id, AttemptState::Runnable).await?),
        }
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

        let record = sqlx::query_as::<_, AttemptRecord>(
            r#"
            UPDATE build_attempts SET state = $2, finished_at = NOW()
            WHERE id = $1 AND state = 'running'
            RETURNING *
            "#,
        )
        .bind(id.as_uuid())
        .bind(state.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => record.try_into(),
            None => Err(self.attempt_conflict(id, AttemptState::Running).await?),
        }
    }

    async fn stale_running_attempts(
        &self,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<BuildAttempt>> {
        let records = sqlx::query_as::<_, AttemptRecord>(
            "SELECT * FROM build_attempts WHERE state = 'running' AND started_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        collect(records)
    }

    async fn build_for_attempt(&self, attempt_id: ResourceId) -> StoreResult<Build> {
        let record = sqlx::query_as::<_, BuildRecord>(
            r#"
            SELECT b.* FROM builds b
            JOIN build_parts p ON p.build_id = b.id
            JOIN build_attempts a ON a.build_part_id = p.id
            WHERE a.id = $1
            "#,
        )
        .bind(attempt_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("build for attempt {attempt_id}")))?;
        record.try_into()
    }
}

impl PgStore {
    /// Build the conflict error for a failed optimistic mutation by reading
    /// the attempt's actual state.
    async fn attempt_conflict(
        &self,
        id: ResourceId,
        expected: AttemptState,
    ) -> StoreResult<StoreError> {
        let actual = self.get_attempt(id).await?;
        Ok(StoreError::AttemptConflict {
            attempt_id: id,
            expected,
            actual: actual.state,
        })
    }
}
