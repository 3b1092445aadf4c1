//! Testing utilities for procbus.
//!
//! - [`RecordingJobQueue`] keeps pushed jobs in memory so a test decides
//!   when, in which order and how concurrently they run.
//! - [`EagerJobQueue`] runs every job the moment it is pushed, in the middle
//!   of the dispatch that pushed it.
//! - [`fixtures`] holds ready-made instructions and handlers.
//!
//! ```ignore
//! let queue = RecordingJobQueue::new();
//! let bus = Bus::multiple(repository.clone(), catalog.clone())
//!     .with_job_queue(Arc::new(queue.clone()))
//!     .map::<AsyncHelloCommand>([ASYNC_HELLO, ASYNC_HELLO_TOO])
//!     .build()?;
//!
//! let process = bus.dispatch(&AsyncHelloCommand::new("hi")).await?.unwrap();
//! assert_eq!(queue.len(), 2);
//!
//! for outcome in queue.run_concurrently(&ctx).await {
//!     outcome?;
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use procbus::{AsyncHandlerJob, JobOutcome, JobQueue, WorkerContext};
use uuid::Uuid;

pub mod fixtures;

/// A job as the queue received it.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub job: AsyncHandlerJob,
    pub queue: Option<String>,
    /// Set for scheduled jobs.
    pub run_at: Option<DateTime<Utc>>,
}

/// In-memory [`JobQueue`] that records jobs instead of delivering them.
#[derive(Clone, Default)]
pub struct RecordingJobQueue {
    jobs: Arc<Mutex<Vec<QueuedJob>>>,
    accepted: Arc<AtomicUsize>,
    limit: Option<usize>,
}

impl RecordingJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A queue that refuses every push.
    pub fn rejecting() -> Self {
        Self::rejecting_after(0)
    }

    /// A queue that accepts `accepted` pushes and refuses the rest.
    pub fn rejecting_after(accepted: usize) -> Self {
        Self {
            limit: Some(accepted),
            ..Self::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedJob>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(
        &self,
        job: AsyncHandlerJob,
        queue: Option<&str>,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<Uuid> {
        if let Some(limit) = self.limit {
            if self.accepted.fetch_add(1, Ordering::SeqCst) >= limit {
                return Err(anyhow!("queue is rejecting jobs"));
            }
        }
        let id = Uuid::new_v4();
        self.lock().push(QueuedJob {
            id,
            job,
            queue: queue.map(String::from),
            run_at,
        });
        Ok(id)
    }

    /// Snapshot of the waiting jobs in push order.
    pub fn jobs(&self) -> Vec<QueuedJob> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return every waiting job.
    pub fn take(&self) -> Vec<AsyncHandlerJob> {
        self.lock().drain(..).map(|queued| queued.job).collect()
    }

    /// Run every waiting job in push order, ignoring `run_at`.
    pub async fn run_all<D>(&self, ctx: &WorkerContext<D>) -> Vec<procbus::Result<JobOutcome>>
    where
        D: Send + Sync + 'static,
    {
        let mut outcomes = Vec::new();
        for job in self.take() {
            outcomes.push(job.run(ctx).await);
        }
        outcomes
    }

    /// Run every waiting job at once.
    pub async fn run_concurrently<D>(
        &self,
        ctx: &WorkerContext<D>,
    ) -> Vec<procbus::Result<JobOutcome>>
    where
        D: Send + Sync + 'static,
    {
        let jobs = self.take();
        join_all(jobs.iter().map(|job| job.run(ctx))).await
    }
}

#[async_trait]
impl JobQueue for RecordingJobQueue {
    async fn enqueue(&self, job: AsyncHandlerJob, queue: Option<&str>) -> Result<Uuid> {
        self.push(job, queue, None)
    }

    async fn schedule(
        &self,
        job: AsyncHandlerJob,
        queue: Option<&str>,
        run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.push(job, queue, Some(run_at))
    }
}

/// [`JobQueue`] that runs each job inside the push, ignoring `run_at`.
pub struct EagerJobQueue<D> {
    ctx: WorkerContext<D>,
    outcomes: Arc<Mutex<Vec<procbus::Result<JobOutcome>>>>,
}

impl<D> EagerJobQueue<D> {
    pub fn new(ctx: WorkerContext<D>) -> Self {
        Self {
            ctx,
            outcomes: Arc::default(),
        }
    }

    /// Remove and return the outcomes of the jobs run so far.
    pub fn take_outcomes(&self) -> Vec<procbus::Result<JobOutcome>> {
        let mut outcomes = self
            .outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        outcomes.drain(..).collect()
    }
}

impl<D> Clone for EagerJobQueue<D> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            outcomes: self.outcomes.clone(),
        }
    }
}

impl<D> EagerJobQueue<D>
where
    D: Send + Sync + 'static,
{
    async fn run(&self, job: AsyncHandlerJob) -> Result<Uuid> {
        let outcome = job.run(&self.ctx).await;
        self.outcomes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(outcome);
        Ok(Uuid::new_v4())
    }
}

#[async_trait]
impl<D> JobQueue for EagerJobQueue<D>
where
    D: Send + Sync + 'static,
{
    async fn enqueue(&self, job: AsyncHandlerJob, _queue: Option<&str>) -> Result<Uuid> {
        self.run(job).await
    }

    async fn schedule(
        &self,
        job: AsyncHandlerJob,
        _queue: Option<&str>,
        _run_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        self.run(job).await
    }
}
