//! PostgreSQL job queue for async handlers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use procbus::{AsyncHandlerJob, JobOutcome, JobQueue, WorkerContext};
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{is_valid_table_name, DEFAULT_JOB_TABLE};

/// Queue name used when neither the instruction nor the bus names one.
pub const DEFAULT_QUEUE: &str = "default";

/// A job leased to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub queue: String,
    pub attempt: i32,
    pub payload: serde_json::Value,
}

/// PostgreSQL job queue implementation.
///
/// Producers push through [`JobQueue`]; workers call
/// [`work_once`](Self::work_once) in a loop. A job whose worker died is
/// handed out again after its lease expires and
/// [`reclaim_expired`](Self::reclaim_expired) ran; the job itself skips
/// slots that already hold a final result.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    table: String,
    queues: Option<Vec<String>>,
    default_lease_ms: i64,
}

impl PgJobQueue {
    /// Create a queue over the `bus_jobs` table.
    ///
    /// # Default Settings
    ///
    /// - Lease timeout: 60 seconds
    /// - Claims from every queue
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_JOB_TABLE.to_string(),
            queues: None,
            default_lease_ms: 60_000,
        }
    }

    /// Use another table.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        anyhow::ensure!(
            is_valid_table_name(&table),
            "invalid job table name {table:?}"
        );
        self.table = table;
        Ok(self)
    }

    /// Only claim jobs from these queues.
    pub fn with_queues<S: Into<String>>(mut self, queues: impl IntoIterator<Item = S>) -> Self {
        self.queues = Some(queues.into_iter().map(Into::into).collect());
        self
    }

    /// How long a worker may hold a job before it counts as abandoned.
    ///
    /// [`work_once`](Self::work_once) renews the lease every third of this
    /// while a job runs.
    pub fn with_lease_timeout(mut self, lease_ms: i64) -> Self {
        self.default_lease_ms = lease_ms;
        self
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// DDL for the configured table.
    pub fn schema(&self) -> String {
        let table = &self.table;
        let index = table.replace('.', "_");
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                id UUID PRIMARY KEY,
                queue TEXT NOT NULL,
                payload JSONB NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
                attempt INTEGER NOT NULL DEFAULT 0,
                run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                worker_id TEXT,
                lease_expires_at TIMESTAMPTZ,
                error_message TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            CREATE INDEX IF NOT EXISTS idx_{index}_ready ON {table} (queue, run_at)
                WHERE status = 'pending';
            CREATE INDEX IF NOT EXISTS idx_{index}_lease ON {table} (lease_expires_at)
                WHERE status = 'running';
            "#
        )
    }

    /// Create the table and its indexes if missing.
    pub async fn install(&self) -> Result<()> {
        sqlx::raw_sql(&self.schema()).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert(
        &self,
        job: &AsyncHandlerJob,
        queue: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let payload = serde_json::to_value(job).context("failed to encode job")?;
        let queue = queue.unwrap_or(DEFAULT_QUEUE);

        sqlx::query(&format!(
            r#"
            INSERT INTO {} (id, queue, payload, run_at)
            VALUES ($1, $2, $3, $4)
            "#,
            self.table
        ))
        .bind(id)
        .bind(queue)
        .bind(payload)
        .bind(run_at)
        .execute(&self.pool)
        .await?;

        debug!(
            job_id = %id,
            queue,
            process_id = %job.process_id,
            handler = %job.handler,
            "job stored"
        );
        Ok(id)
    }

    /// Claim ready jobs for execution.
    ///
    /// Uses `FOR UPDATE SKIP LOCKED` so concurrent workers never claim the
    /// same job.
    pub async fn claim_ready(&self, worker_id: &str, limit: i64) -> Result<Vec<ClaimedJob>> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        let rows = sqlx::query(&format!(
            r#"
            WITH claimable AS (
                SELECT id
                FROM {table}
                WHERE status = 'pending'
                  AND run_at <= NOW()
                  AND ($4::text[] IS NULL OR queue = ANY($4))
                ORDER BY run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE {table}
            SET status = 'running',
                attempt = attempt + 1,
                worker_id = $2,
                lease_expires_at = $3,
                updated_at = NOW()
            WHERE id IN (SELECT id FROM claimable)
            RETURNING id, queue, attempt, payload
            "#,
            table = self.table
        ))
        .bind(limit)
        .bind(worker_id)
        .bind(lease_expires_at)
        .bind(self.queues.clone())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ClaimedJob> {
                Ok(ClaimedJob {
                    id: row.try_get("id")?,
                    queue: row.try_get("queue")?,
                    attempt: row.try_get("attempt")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    /// Mark a job as successfully completed.
    pub async fn mark_succeeded(&self, job_id: Uuid) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'succeeded',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
            self.table
        ))
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a job as failed. Failed jobs are not retried; the process already
    /// recorded the failure.
    pub async fn mark_failed(&self, job_id: Uuid, error: &str) -> Result<()> {
        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'failed',
                error_message = $1,
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE id = $2
            "#,
            self.table
        ))
        .bind(error)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Extend the lease for a running job.
    pub async fn heartbeat(&self, job_id: Uuid) -> Result<()> {
        let lease_expires_at = Utc::now() + Duration::milliseconds(self.default_lease_ms);

        sqlx::query(&format!(
            r#"
            UPDATE {}
            SET lease_expires_at = $1,
                updated_at = NOW()
            WHERE id = $2 AND status = 'running'
            "#,
            self.table
        ))
        .bind(lease_expires_at)
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// How often a running job's lease is renewed.
    fn heartbeat_period(&self) -> std::time::Duration {
        let period = u64::try_from(self.default_lease_ms / 3).unwrap_or(0);
        std::time::Duration::from_millis(period.max(1))
    }

    /// Run a job while renewing its lease, so a long handler is not
    /// reclaimed under a live worker.
    async fn run_leased<D>(
        &self,
        job_id: Uuid,
        job: &AsyncHandlerJob,
        ctx: &WorkerContext<D>,
    ) -> procbus::Result<JobOutcome>
    where
        D: Send + Sync + 'static,
    {
        let period = self.heartbeat_period();
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let run = job.run(ctx);
        tokio::pin!(run);

        loop {
            tokio::select! {
                outcome = &mut run => return outcome,
                _ = ticker.tick() => {
                    if let Err(e) = self.heartbeat(job_id).await {
                        warn!(job_id = %job_id, error = %e, "lease renewal failed");
                    }
                }
            }
        }
    }

    /// Claim up to `limit` jobs and run them one after another.
    ///
    /// Returns how many jobs were claimed; zero means the queue is idle.
    pub async fn work_once<D>(
        &self,
        ctx: &WorkerContext<D>,
        worker_id: &str,
        limit: i64,
    ) -> Result<usize>
    where
        D: Send + Sync + 'static,
    {
        let claimed = self.claim_ready(worker_id, limit).await?;
        let count = claimed.len();

        for claimed in claimed {
            let job: AsyncHandlerJob = match serde_json::from_value(claimed.payload) {
                Ok(job) => job,
                Err(e) => {
                    warn!(job_id = %claimed.id, error = %e, "undecodable job payload");
                    self.mark_failed(claimed.id, &format!("undecodable job: {e}"))
                        .await?;
                    continue;
                }
            };

            match self.run_leased(claimed.id, &job, ctx).await {
                Ok(outcome) => {
                    if !matches!(outcome, JobOutcome::Applied { .. }) {
                        debug!(job_id = %claimed.id, ?outcome, "job skipped");
                    }
                    self.mark_succeeded(claimed.id).await?;
                }
                Err(e) => {
                    warn!(
                        job_id = %claimed.id,
                        process_id = %job.process_id,
                        handler = %job.handler,
                        attempt = claimed.attempt,
                        error = %e,
                        "job failed"
                    );
                    self.mark_failed(claimed.id, &e.to_string()).await?;
                }
            }
        }

        Ok(count)
    }

    /// Reclaim abandoned jobs (lease expired).
    ///
    /// This should be run periodically by a maintenance worker.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = 'pending',
                worker_id = NULL,
                lease_expires_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND lease_expires_at < NOW()
            "#,
            self.table
        ))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Delete succeeded jobs last touched before `older_than`.
    pub async fn cleanup_succeeded(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(&format!(
            r#"
            DELETE FROM {}
            WHERE status = 'succeeded'
              AND updated_at < $1
            "#,
            self.table
        ))
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Get statistics about job queue health.
    pub async fn stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'running') as running,
                COUNT(*) FILTER (WHERE status = 'succeeded') as succeeded,
                COUNT(*) FILTER (WHERE status = 'failed') as failed
            FROM {}
            "#,
            self.table
        ))
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            pending: row.try_get("pending")?,
            running: row.try_get("running")?,
            succeeded: row.try_get("succeeded")?,
            failed: row.try_get("failed")?,
        })
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: AsyncHandlerJob, queue: Option<&str>) -> Result<Uuid> {
        self.insert(&job, queue, Utc::now()).await
    }

    async fn schedule(
        &self,
        job: AsyncHandlerJob,
        queue: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.insert(&job, queue, run_at).await
    }
}

impl std::fmt::Debug for PgJobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobQueue")
            .field("table", &self.table)
            .field("queues", &self.queues)
            .field("default_lease_ms", &self.default_lease_ms)
            .finish_non_exhaustive()
    }
}

/// Job queue statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed: i64,
}

impl QueueStats {
    /// Jobs not yet done.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> PgJobQueue {
        PgJobQueue::new(PgPool::connect_lazy("postgres://localhost/procbus").unwrap())
    }

    #[tokio::test]
    async fn defaults() {
        let queue = queue();
        assert_eq!(queue.table(), "bus_jobs");
        assert!(queue.queues.is_none());
        assert_eq!(queue.default_lease_ms, 60_000);
    }

    #[tokio::test]
    async fn worker_queue_filter_and_lease() {
        let queue = queue()
            .with_queues(["default", "custom"])
            .with_lease_timeout(5_000);
        assert_eq!(
            queue.queues.as_deref(),
            Some(&["default".to_string(), "custom".to_string()][..])
        );
        assert_eq!(queue.default_lease_ms, 5_000);
    }

    #[tokio::test]
    async fn lease_is_renewed_three_times_per_timeout() {
        assert_eq!(queue().heartbeat_period(), std::time::Duration::from_secs(20));
        assert_eq!(
            queue().with_lease_timeout(0).heartbeat_period(),
            std::time::Duration::from_millis(1)
        );
    }

    #[tokio::test]
    async fn custom_table_renders_schema() {
        let queue = queue().with_table("jobs.handler_jobs").unwrap();
        let schema = queue.schema();
        assert!(schema.contains("CREATE TABLE IF NOT EXISTS jobs.handler_jobs"));
        assert!(schema.contains("idx_jobs_handler_jobs_ready"));

        assert!(queue.with_table("jobs; --").is_err());
    }

    #[test]
    fn outstanding_counts_pending_and_running() {
        let stats = QueueStats {
            pending: 3,
            running: 2,
            succeeded: 10,
            failed: 1,
        };
        assert_eq!(stats.outstanding(), 5);
    }
}
