//! PostgreSQL process repository.

use async_trait::async_trait;
use procbus::{
    BusError, HandlerResult, Process, ProcessId, ProcessRecord, ProcessRepository, ProcessStats,
    ProcessStatus, Result, SubStatus,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

use crate::{is_valid_table_name, DEFAULT_PROCESS_TABLE};

const COLUMNS: &str = "id, bus, process, status, \
    handlers::text AS handlers, results::text AS results, \
    related::text AS related, data::text AS data, \
    pid, committed_by, committed_at, started_at, finished_at";

/// PostgreSQL process repository.
///
/// `apply_sub_result` is one `UPDATE` that rewrites a single slot of the
/// `results` array; `start`, `finish` and `cancel` lock the row with
/// `SELECT ... FOR UPDATE` and run the transition inside that transaction.
#[derive(Clone)]
pub struct PgProcessRepository {
    pool: PgPool,
    table: String,
}

impl PgProcessRepository {
    /// Repository over the `bus_processes` table.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            table: DEFAULT_PROCESS_TABLE.to_string(),
        }
    }

    /// Use another table. Fails unless the name is a plain identifier,
    /// optionally schema-qualified.
    pub fn with_table(mut self, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_valid_table_name(&table) {
            return Err(BusError::MissingConfiguration {
                message: format!("invalid process table name {table:?}"),
            });
        }
        self.table = table;
        Ok(self)
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
                bus TEXT NOT NULL,
                process TEXT NOT NULL,
                status TEXT NOT NULL
                    CHECK (status IN ('new', 'pending', 'finished', 'canceled')),
                handlers JSONB NOT NULL,
                results JSONB NOT NULL,
                related JSONB,
                data JSONB,
                pid BIGINT,
                committed_by BIGINT,
                committed_at BIGINT NOT NULL,
                started_at BIGINT,
                finished_at BIGINT
            );
            CREATE INDEX IF NOT EXISTS idx_{index}_status ON {table} (status);
            "#
        )
    }

    /// Create the table and its index if missing.
    pub async fn install(&self) -> Result<()> {
        sqlx::raw_sql(&self.schema())
            .execute(&self.pool)
            .await
            .map_err(BusError::storage)?;
        Ok(())
    }

    /// Lock the row, apply `change` and write the mutable fields back.
    ///
    /// A rejected transition rolls back and leaves the row untouched.
    async fn transition<F>(&self, id: ProcessId, change: F) -> Result<Process>
    where
        F: FnOnce(&mut Process) -> Result<bool> + Send,
    {
        let mut tx = self.pool.begin().await.map_err(BusError::storage)?;

        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM {} WHERE id = $1 FOR UPDATE",
            self.table
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(BusError::storage)?
        .ok_or(BusError::MissingProcess { id })?;

        let mut process = Process::from_record(&record_from_row(&row)?)?;
        if change(&mut process)? {
            self.update(&mut tx, &process).await?;
        }

        tx.commit().await.map_err(BusError::storage)?;
        Ok(process)
    }

    async fn update(&self, tx: &mut Transaction<'_, Postgres>, process: &Process) -> Result<()> {
        let record = process.to_record()?;
        let result = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET status = $2,
                results = $3::jsonb,
                related = $4::jsonb,
                data = $5::jsonb,
                started_at = $6,
                finished_at = $7
            WHERE id = $1
            "#,
            self.table
        ))
        .bind(record.id)
        .bind(&record.status)
        .bind(&record.results)
        .bind(&record.related)
        .bind(&record.data)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&mut **tx)
        .await
        .map_err(BusError::storage)?;

        if result.rows_affected() == 0 {
            return Err(BusError::storage(anyhow::anyhow!(
                "updating process [{}] affected no rows",
                record.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessRepository for PgProcessRepository {
    async fn retrieve(&self, id: ProcessId) -> Result<Process> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM {} WHERE id = $1", self.table))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(BusError::storage)?
            .ok_or(BusError::MissingProcess { id })?;

        Process::from_record(&record_from_row(&row)?)
    }

    async fn persist(&self, process: &mut Process) -> Result<()> {
        if process.is_persisted() {
            let mut tx = self.pool.begin().await.map_err(BusError::storage)?;
            self.update(&mut tx, process).await?;
            tx.commit().await.map_err(BusError::storage)?;
            return Ok(());
        }

        let record = process.to_record()?;
        let result = sqlx::query(&format!(
            r#"
            INSERT INTO {} (
                id, bus, process, status, handlers, results, related, data,
                pid, committed_by, committed_at, started_at, finished_at
            )
            VALUES ($1, $2, $3, $4, $5::jsonb, $6::jsonb, $7::jsonb, $8::jsonb,
                    $9, $10, $11, $12, $13)
            ON CONFLICT (id) DO NOTHING
            "#,
            self.table
        ))
        .bind(record.id)
        .bind(&record.bus)
        .bind(&record.process)
        .bind(&record.status)
        .bind(&record.handlers)
        .bind(&record.results)
        .bind(&record.related)
        .bind(&record.data)
        .bind(record.pid)
        .bind(record.committed_by)
        .bind(record.committed_at)
        .bind(record.started_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await
        .map_err(BusError::storage)?;

        if result.rows_affected() == 0 {
            return Err(BusError::storage(anyhow::anyhow!(
                "inserting process [{}] affected no rows",
                record.id
            )));
        }

        process.mark_as_persisted();
        debug!(process_id = %record.id, table = %self.table, "process inserted");
        Ok(())
    }

    async fn delete(&self, id: ProcessId) -> Result<()> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = $1", self.table))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(BusError::storage)?;

        if result.rows_affected() == 0 {
            debug!(process_id = %id, "delete of absent process ignored");
        }
        Ok(())
    }

    async fn count(&self, status: Option<&str>) -> Result<u64> {
        let status = status.map(str::parse::<ProcessStatus>).transpose()?;

        let row = sqlx::query(&format!(
            "SELECT COUNT(*) AS count FROM {} WHERE ($1::text IS NULL OR status = $1)",
            self.table
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(BusError::storage)?;

        count_column(&row, "count")
    }

    async fn start(&self, id: ProcessId) -> Result<Process> {
        self.transition(id, |process| {
            if !process.qualify_to_start() {
                return Ok(false);
            }
            process.start()?;
            Ok(true)
        })
        .await
    }

    async fn apply_sub_result(
        &self,
        id: ProcessId,
        slot: usize,
        status: SubStatus,
        result: &HandlerResult,
    ) -> Result<Process> {
        let index = i32::try_from(slot).map_err(|_| BusError::InvalidAction {
            message: format!("process [{id}] has no handler slot {slot}"),
        })?;

        let row = sqlx::query(&format!(
            r#"
            UPDATE {}
            SET results = jsonb_set(
                    results,
                    ARRAY[($2::int)::text],
                    jsonb_strip_nulls(jsonb_build_object(
                        'status', $3::text,
                        'feedback', COALESCE(to_jsonb($4::text), results -> ($2::int) -> 'feedback')
                    ))
                ),
                data = CASE WHEN $5::jsonb IS NULL THEN data
                            ELSE COALESCE(data, '[]'::jsonb) || $5::jsonb END,
                related = CASE WHEN $6::jsonb IS NULL THEN related
                               ELSE COALESCE(related, '[]'::jsonb) || $6::jsonb END
            WHERE id = $1
              AND $2::int < jsonb_array_length(results)
            RETURNING {COLUMNS}
            "#,
            self.table
        ))
        .bind(id)
        .bind(index)
        .bind(status.as_str())
        .bind(result.feedback.as_deref())
        .bind(data_items(result.data.as_ref()))
        .bind(related_items(result.related.as_deref())?)
        .fetch_optional(&self.pool)
        .await
        .map_err(BusError::storage)?;

        match row {
            Some(row) => Process::from_record(&record_from_row(&row)?),
            None => {
                // Distinguish a missing process from a bad slot.
                self.retrieve(id).await?;
                Err(BusError::InvalidAction {
                    message: format!("process [{id}] has no handler slot {slot}"),
                })
            }
        }
    }

    async fn finish(&self, id: ProcessId) -> Result<Process> {
        self.transition(id, |process| {
            if process.is_finished() {
                return Ok(false);
            }
            process.finish()?;
            Ok(true)
        })
        .await
    }

    async fn cancel(&self, id: ProcessId) -> Result<Process> {
        self.transition(id, |process| {
            process.cancel()?;
            Ok(true)
        })
        .await
    }

    async fn stats(&self) -> Result<ProcessStats> {
        let row = sqlx::query(&format!(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'new') as new,
                COUNT(*) FILTER (WHERE status = 'pending') as pending,
                COUNT(*) FILTER (WHERE status = 'finished') as finished,
                COUNT(*) FILTER (WHERE status = 'canceled') as canceled
            FROM {}
            "#,
            self.table
        ))
        .fetch_one(&self.pool)
        .await
        .map_err(BusError::storage)?;

        Ok(ProcessStats {
            new: count_column(&row, "new")?,
            pending: count_column(&row, "pending")?,
            finished: count_column(&row, "finished")?,
            canceled: count_column(&row, "canceled")?,
        })
    }
}

impl std::fmt::Debug for PgProcessRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgProcessRepository")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

fn record_from_row(row: &PgRow) -> Result<ProcessRecord> {
    let read = || -> std::result::Result<ProcessRecord, sqlx::Error> {
        Ok(ProcessRecord {
            id: row.try_get("id")?,
            bus: row.try_get("bus")?,
            process: row.try_get("process")?,
            status: row.try_get("status")?,
            handlers: row.try_get("handlers")?,
            results: row.try_get("results")?,
            related: row.try_get("related")?,
            data: row.try_get("data")?,
            pid: row.try_get("pid")?,
            committed_by: row.try_get("committed_by")?,
            committed_at: row.try_get("committed_at")?,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
        })
    };
    read().map_err(BusError::storage)
}

fn count_column(row: &PgRow, column: &str) -> Result<u64> {
    let count: i64 = row.try_get(column).map_err(BusError::storage)?;
    u64::try_from(count).map_err(BusError::storage)
}

/// Data to append, as JSON text. Arrays append element-wise; null appends
/// nothing.
fn data_items(data: Option<&Value>) -> Option<String> {
    match data {
        None | Some(Value::Null) => None,
        Some(Value::Array(items)) if items.is_empty() => None,
        Some(items @ Value::Array(_)) => Some(items.to_string()),
        Some(other) => Some(Value::Array(vec![other.clone()]).to_string()),
    }
}

fn related_items(related: Option<&[uuid::Uuid]>) -> Result<Option<String>> {
    match related {
        Some(ids) if !ids.is_empty() => Ok(Some(serde_json::to_string(ids)?)),
        _ => Ok(None),
    }
}
