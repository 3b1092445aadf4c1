//! Work queue contract for async handlers.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::job::AsyncHandlerJob;

/// Transport that carries [`AsyncHandlerJob`]s to workers.
///
/// Implementations decide delivery, retries and visibility. A worker that
/// receives a job calls [`AsyncHandlerJob::run`] with its
/// [`WorkerContext`](crate::WorkerContext).
///
/// # Example
///
/// ```ignore
/// struct RedisQueue { client: redis::Client }
///
/// #[async_trait::async_trait]
/// impl JobQueue for RedisQueue {
///     async fn enqueue(&self, job: AsyncHandlerJob, queue: Option<&str>) -> Result<Uuid> {
///         let id = Uuid::new_v4();
///         let body = serde_json::to_string(&job)?;
///         self.client.lpush(queue.unwrap_or("default"), body).await?;
///         Ok(id)
///     }
///
///     async fn schedule(&self, job: AsyncHandlerJob, queue: Option<&str>, run_at: DateTime<Utc>) -> Result<Uuid> {
///         // sorted set keyed by run_at
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Push a job for immediate delivery. Returns the job id.
    async fn enqueue(&self, job: AsyncHandlerJob, queue: Option<&str>) -> Result<Uuid>;

    /// Push a job to be delivered at or after `run_at`.
    async fn schedule(
        &self,
        job: AsyncHandlerJob,
        queue: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid>;
}

/// A queue that rejects every job.
///
/// Installing it on a bus turns every async dispatch into an
/// [`Enqueue`](crate::BusError::Enqueue) error after the process was
/// persisted. Leave the queue unset to fail earlier with
/// `MissingConfiguration`.
pub struct NoOpJobQueue;

#[async_trait::async_trait]
impl JobQueue for NoOpJobQueue {
    async fn enqueue(&self, _job: AsyncHandlerJob, _queue: Option<&str>) -> Result<Uuid> {
        Err(anyhow!("async handlers not supported: no job queue configured"))
    }

    async fn schedule(
        &self,
        _job: AsyncHandlerJob,
        _queue: Option<&str>,
        _run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        Err(anyhow!("delayed handlers not supported: no job queue configured"))
    }
}
