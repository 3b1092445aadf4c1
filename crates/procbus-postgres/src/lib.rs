//! PostgreSQL backends for procbus.
//!
//! - [`PgProcessRepository`] stores processes. Handler completions are
//!   single-statement `jsonb_set` updates of one slot, so concurrent jobs for
//!   the same process never overwrite each other.
//! - [`PgJobQueue`] carries [`AsyncHandlerJob`](procbus::AsyncHandlerJob)s
//!   with named queues, delayed delivery and `FOR UPDATE SKIP LOCKED`
//!   claiming.
//!
//! # Database Schema
//!
//! ```sql
//! CREATE TABLE bus_processes (
//!     id UUID PRIMARY KEY,
//!     bus TEXT NOT NULL,
//!     process TEXT NOT NULL,
//!     status TEXT NOT NULL
//!         CHECK (status IN ('new', 'pending', 'finished', 'canceled')),
//!
//!     -- Aligned arrays: results[i] belongs to handlers[i]
//!     handlers JSONB NOT NULL,
//!     results JSONB NOT NULL,
//!     related JSONB,
//!     data JSONB,
//!
//!     pid BIGINT,
//!     committed_by BIGINT,
//!
//!     -- Epoch milliseconds
//!     committed_at BIGINT NOT NULL,
//!     started_at BIGINT,
//!     finished_at BIGINT
//! );
//!
//! CREATE INDEX idx_bus_processes_status ON bus_processes (status);
//!
//! CREATE TABLE bus_jobs (
//!     id UUID PRIMARY KEY,
//!     queue TEXT NOT NULL,
//!     payload JSONB NOT NULL,
//!
//!     status TEXT NOT NULL DEFAULT 'pending'
//!         CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
//!     attempt INTEGER NOT NULL DEFAULT 0,
//!     run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!
//!     worker_id TEXT,
//!     lease_expires_at TIMESTAMPTZ,
//!     error_message TEXT,
//!
//!     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//!
//! CREATE INDEX idx_bus_jobs_ready ON bus_jobs (queue, run_at)
//!     WHERE status = 'pending';
//! CREATE INDEX idx_bus_jobs_lease ON bus_jobs (lease_expires_at)
//!     WHERE status = 'running';
//! ```
//!
//! Both table names are configurable; [`PgProcessRepository::schema`] and
//! [`PgJobQueue::schema`] render the DDL for the configured names.
//!
//! # Usage
//!
//! ```rust,ignore
//! use procbus::{Bus, WorkerContext};
//! use procbus_postgres::{PgJobQueue, PgProcessRepository};
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/mydb").await?;
//! let repository = Arc::new(PgProcessRepository::new(pool.clone()));
//! let queue = Arc::new(PgJobQueue::new(pool));
//!
//! let bus = Bus::multiple(repository.clone(), catalog.clone())
//!     .with_job_queue(queue.clone())
//!     .map::<ResizeImage>([resize, thumbnail])
//!     .build()?;
//!
//! // worker loop
//! let ctx = WorkerContext::new(repository, catalog, Arc::new(instructions));
//! loop {
//!     if queue.work_once(&ctx, "worker-1", 10).await? == 0 {
//!         tokio::time::sleep(Duration::from_millis(500)).await;
//!     }
//! }
//! ```

mod queue;
mod repository;

pub use queue::{ClaimedJob, PgJobQueue, QueueStats, DEFAULT_QUEUE};
pub use repository::PgProcessRepository;

/// Default process table.
pub const DEFAULT_PROCESS_TABLE: &str = "bus_processes";

/// Default job table.
pub const DEFAULT_JOB_TABLE: &str = "bus_jobs";

/// Accept `table` or `schema.table`, each part a plain SQL identifier.
///
/// Table names are spliced into SQL text, so nothing else gets through.
pub(crate) fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() <= 2 && parts.iter().all(|part| is_identifier(part))
}

fn is_identifier(part: &str) -> bool {
    let mut chars = part.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    part.len() <= 63
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
