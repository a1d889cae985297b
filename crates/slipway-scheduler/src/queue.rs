//! Work queue transport backed by PostgreSQL.
//!
//! Workers claim jobs with SKIP LOCKED so independent worker processes never
//! contend on the same row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use slipway_core::queue::{WorkPayload, WorkQueue};
use sqlx::PgPool;

/// A queued job as workers see it.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct QueuedJob {
    pub id: uuid::Uuid,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Decode the payload the dispatcher enqueued.
    pub fn work_payload(&self) -> Result<WorkPayload, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Work queue backed by PostgreSQL.
pub struct PgWorkQueue {
    pool: PgPool,
}

impl PgWorkQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim the next available job on a queue.
    /// Uses SKIP LOCKED to prevent contention in distributed environments.
    pub async fn claim(&self, queue: &str, worker_id: &str) -> Result<Option<QueuedJob>, sqlx::Error> {
        let job = sqlx::query_as::<_, QueuedJob>(
            r#"
            UPDATE job_queue
            SET status = 'claimed', claimed_by = $2, claimed_at = NOW()
            WHERE id = (
                SELECT id FROM job_queue
                WHERE queue = $1 AND status = 'pending'
                ORDER BY created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(queue)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }

    /// Mark a claimed job as completed.
    pub async fn complete(&self, job_id: uuid::Uuid) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE job_queue SET status = 'completed' WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Release a claimed job back to pending (e.g., on worker crash recovery).
    pub async fn release(&self, job_id: uuid::Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE job_queue SET status = 'pending', claimed_by = NULL, claimed_at = NULL WHERE id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl WorkQueue for PgWorkQueue {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn enqueue(&self, queue: &str, payload: WorkPayload) -> slipway_core::Result<()> {
        let payload = serde_json::to_value(&payload)
            .map_err(|e| slipway_core::Error::Internal(format!("payload encoding: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO job_queue (id, queue, payload, status, created_at)
            VALUES ($1, $2, $3, 'pending', NOW())
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(queue)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| slipway_core::Error::QueueUnavailable(e.to_string()))?;
        Ok(())
    }
}
