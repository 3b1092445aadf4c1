//! Durable storage for processes.
//!
//! Besides whole-record `persist`, the contract exposes atomic per-process
//! operations (`start`, `apply_sub_result`, `finish`, `cancel`). Concurrent
//! jobs for one process use those, and each writes only its own handler
//! slot, so sibling results are never overwritten.
//!
//! ```text
//!   job A ──▶ apply_sub_result(id, 0, ..) ──┐
//!                                            ├──▶ row: results[0], results[1]
//!   job B ──▶ apply_sub_result(id, 1, ..) ──┘      (each write touches one slot)
//! ```

use anyhow::anyhow;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::process::{Process, ProcessId, ProcessRecord, ProcessStatus, SubStatus};
use crate::result::HandlerResult;

/// Storage contract for [`Process`] records.
#[async_trait]
pub trait ProcessRepository: Send + Sync + 'static {
    /// Fails with [`BusError::MissingProcess`] when absent.
    async fn retrieve(&self, id: ProcessId) -> Result<Process>;

    /// Insert when not yet persisted, otherwise update the mutable fields
    /// (status, results, related, data, started and finished timestamps).
    ///
    /// A write that affects no rows is a [`BusError::Storage`] failure.
    async fn persist(&self, process: &mut Process) -> Result<()>;

    /// Remove a process. Removing an absent process is not an error.
    async fn delete(&self, id: ProcessId) -> Result<()>;

    /// Count processes, optionally by status. The status string is
    /// validated before querying.
    async fn count(&self, status: Option<&str>) -> Result<u64>;

    /// Move to Pending if the process qualifies to start; otherwise leave it
    /// as is. Returns the stored state.
    async fn start(&self, id: ProcessId) -> Result<Process>;

    /// Record one handler's outcome in its slot and append its data and
    /// related ids, without touching other slots.
    async fn apply_sub_result(
        &self,
        id: ProcessId,
        slot: usize,
        status: SubStatus,
        result: &HandlerResult,
    ) -> Result<Process>;

    /// Move to Finished. A finished process is returned unchanged; one with
    /// unresolved handlers fails with [`BusError::InvalidAction`].
    async fn finish(&self, id: ProcessId) -> Result<Process>;

    /// Move to Canceled; only legal while the process is untouched.
    async fn cancel(&self, id: ProcessId) -> Result<Process>;

    async fn stats(&self) -> Result<ProcessStats>;
}

/// Process counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub new: u64,
    pub pending: u64,
    pub finished: u64,
    pub canceled: u64,
}

impl ProcessStats {
    pub fn total(&self) -> u64 {
        self.new + self.pending + self.finished + self.canceled
    }

    pub fn get(&self, status: ProcessStatus) -> u64 {
        match status {
            ProcessStatus::New => self.new,
            ProcessStatus::Pending => self.pending,
            ProcessStatus::Finished => self.finished,
            ProcessStatus::Canceled => self.canceled,
        }
    }

    fn add(&mut self, status: ProcessStatus) {
        match status {
            ProcessStatus::New => self.new += 1,
            ProcessStatus::Pending => self.pending += 1,
            ProcessStatus::Finished => self.finished += 1,
            ProcessStatus::Canceled => self.canceled += 1,
        }
    }
}

/// In-process repository backed by a concurrent map of storage records.
///
/// Every mutation holds the entry's lock for its whole read-modify-write, so
/// updates to one process are serialized.
#[derive(Debug, Default)]
pub struct MemoryProcessRepository {
    records: DashMap<ProcessId, ProcessRecord>,
}

impl MemoryProcessRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Raw stored record, for inspection.
    pub fn record(&self, id: ProcessId) -> Option<ProcessRecord> {
        self.records.get(&id).map(|r| r.clone())
    }

    fn mutate<F>(&self, id: ProcessId, change: F) -> Result<Process>
    where
        F: FnOnce(&mut Process) -> Result<()>,
    {
        let mut entry = self
            .records
            .get_mut(&id)
            .ok_or(BusError::MissingProcess { id })?;

        let mut process = Process::from_record(&entry)?;
        change(&mut process)?;
        *entry = process.to_record()?;
        Ok(process)
    }
}

#[async_trait]
impl ProcessRepository for MemoryProcessRepository {
    async fn retrieve(&self, id: ProcessId) -> Result<Process> {
        let record = self
            .records
            .get(&id)
            .ok_or(BusError::MissingProcess { id })?;
        Process::from_record(&record)
    }

    async fn persist(&self, process: &mut Process) -> Result<()> {
        let id = process.id();
        let record = process.to_record()?;

        if process.is_persisted() {
            let mut stored = self.records.get_mut(&id).ok_or_else(|| {
                BusError::storage(anyhow!("updating process [{id}] affected no rows"))
            })?;
            stored.status = record.status;
            stored.results = record.results;
            stored.related = record.related;
            stored.data = record.data;
            stored.started_at = record.started_at;
            stored.finished_at = record.finished_at;
            return Ok(());
        }

        match self.records.entry(id) {
            Entry::Occupied(_) => {
                return Err(BusError::storage(anyhow!(
                    "inserting process [{id}] affected no rows"
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        process.mark_as_persisted();
        debug!(process_id = %id, "process inserted");
        Ok(())
    }

    async fn delete(&self, id: ProcessId) -> Result<()> {
        if self.records.remove(&id).is_none() {
            debug!(process_id = %id, "delete of absent process ignored");
        }
        Ok(())
    }

    async fn count(&self, status: Option<&str>) -> Result<u64> {
        let status = status.map(str::parse::<ProcessStatus>).transpose()?;
        let stats = self.stats().await?;
        Ok(match status {
            Some(status) => stats.get(status),
            None => stats.total(),
        })
    }

    async fn start(&self, id: ProcessId) -> Result<Process> {
        self.mutate(id, |process| {
            if process.qualify_to_start() {
                process.start()?;
            }
            Ok(())
        })
    }

    async fn apply_sub_result(
        &self,
        id: ProcessId,
        slot: usize,
        status: SubStatus,
        result: &HandlerResult,
    ) -> Result<Process> {
        self.mutate(id, |process| {
            process.apply_handler_result_at(slot, status, result)
        })
    }

    async fn finish(&self, id: ProcessId) -> Result<Process> {
        self.mutate(id, |process| {
            if process.is_finished() {
                return Ok(());
            }
            process.finish()
        })
    }

    async fn cancel(&self, id: ProcessId) -> Result<Process> {
        self.mutate(id, Process::cancel)
    }

    async fn stats(&self) -> Result<ProcessStats> {
        let mut stats = ProcessStats::default();
        for record in self.records.iter() {
            stats.add(record.status.parse()?);
        }
        Ok(stats)
    }
}

/// A process after [`settle`].
pub(crate) struct Settled {
    pub process: Process,
    /// This call finished the process.
    pub finished: bool,
    /// The finished process was deleted.
    pub cleaned: bool,
}

/// Finish a process once every handler has reported, then delete it if it
/// succeeded and `clean_on_success` is set.
///
/// Only the writer whose per-slot update resolved the last open slot sees a
/// qualifying process, so exactly one caller finishes it.
pub(crate) async fn settle(
    repository: &dyn ProcessRepository,
    process: Process,
    clean_on_success: bool,
) -> Result<Settled> {
    if !process.qualify_as_finished() || process.is_finished() {
        return Ok(Settled {
            process,
            finished: false,
            cleaned: false,
        });
    }

    let id = process.id();
    let process = repository.finish(id).await?;
    debug!(process_id = %id, successful = process.is_successful(), "process finished");

    let cleaned = clean_on_success && process.is_successful();
    if cleaned {
        repository.delete(id).await?;
        debug!(process_id = %id, "successful process cleaned");
    }
    Ok(Settled {
        process,
        finished: true,
        cleaned,
    })
}
