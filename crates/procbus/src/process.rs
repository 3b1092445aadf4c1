//! The process state machine and its storage record.
//!
//! A [`Process`] tracks one dispatched instruction: an aggregate status plus
//! one sub-result per assigned handler. It performs no I/O; buses, jobs and
//! repositories drive it.
//!
//! ```text
//!              start()                 finish()
//!   ┌─────┐ ───────────▶ ┌─────────┐ ───────────▶ ┌──────────┐
//!   │ New │              │ Pending │              │ Finished │
//!   └─────┘              └─────────┘              └──────────┘
//!      │ cancel()
//!      ▼
//!   ┌──────────┐
//!   │ Canceled │ ── start() is allowed again while every sub-result is New
//!   └──────────┘
//! ```
//!
//! Sub-results live in a fixed array aligned with `handlers`; a handler's
//! slot is its position. Slot-addressed updates never touch sibling slots,
//! which is what lets repositories apply concurrent completions safely.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{BusError, Result};
use crate::result::HandlerResult;

/// Time-ordered process identifier.
pub type ProcessId = Uuid;

/// Epoch milliseconds below this value are taken to be second precision.
const MIN_MILLIS: i64 = 1 << 40;

/// Aggregate lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    New,
    Pending,
    Finished,
    Canceled,
}

impl ProcessStatus {
    pub const ALL: [ProcessStatus; 4] = [
        ProcessStatus::New,
        ProcessStatus::Pending,
        ProcessStatus::Finished,
        ProcessStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::New => "new",
            ProcessStatus::Pending => "pending",
            ProcessStatus::Finished => "finished",
            ProcessStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStatus {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BusError::invalid_action(format!("unknown process status [{s}]")))
    }
}

/// Outcome of one handler within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubStatus {
    New,
    Pending,
    Succeed,
    Failed,
}

impl SubStatus {
    pub const ALL: [SubStatus; 4] = [
        SubStatus::New,
        SubStatus::Pending,
        SubStatus::Succeed,
        SubStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SubStatus::New => "new",
            SubStatus::Pending => "pending",
            SubStatus::Succeed => "succeed",
            SubStatus::Failed => "failed",
        }
    }

    /// Succeed and Failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubStatus::Succeed | SubStatus::Failed)
    }
}

impl fmt::Display for SubStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubStatus {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| BusError::invalid_action(format!("unknown handler status [{s}]")))
    }
}

/// One handler's status and feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubResult {
    pub status: SubStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl SubResult {
    fn new() -> Self {
        Self {
            status: SubStatus::New,
            feedback: None,
        }
    }
}

/// Reporting shape of a process's results.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultsView<'a> {
    /// The process has exactly one handler.
    Single(&'a SubResult),
    /// One entry per handler, in declaration order.
    Keyed(Vec<(&'a str, &'a SubResult)>),
}

/// Durable record of one dispatched instruction.
#[derive(Debug, Clone)]
pub struct Process {
    id: ProcessId,
    bus: String,
    process: String,
    status: ProcessStatus,
    handlers: Vec<String>,
    results: Vec<SubResult>,
    related: Option<Vec<Uuid>>,
    data: Option<Vec<Value>>,
    pid: Option<u32>,
    committed_by: Option<i64>,
    committed_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    persisted: bool,
}

impl Process {
    /// Create a new process with one `New` sub-result per handler.
    pub fn create(
        bus: impl Into<String>,
        instruction: impl Into<String>,
        handlers: Vec<String>,
        committed_by: Option<i64>,
    ) -> Result<Self> {
        if handlers.is_empty() {
            return Err(BusError::invalid_action(
                "cannot create a process without handlers",
            ));
        }

        let results = vec![SubResult::new(); handlers.len()];

        Ok(Self {
            id: Uuid::now_v7(),
            bus: bus.into(),
            process: instruction.into(),
            status: ProcessStatus::New,
            handlers,
            results,
            related: None,
            data: None,
            pid: Some(std::process::id()),
            committed_by,
            committed_at: now(),
            started_at: None,
            finished_at: None,
            persisted: false,
        })
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn bus(&self) -> &str {
        &self.bus
    }

    /// Type name of the instruction this process tracks.
    pub fn instruction(&self) -> &str {
        &self.process
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn handlers(&self) -> &[String] {
        &self.handlers
    }

    /// Sub-results aligned with [`handlers`](Self::handlers).
    pub fn results(&self) -> &[SubResult] {
        &self.results
    }

    pub fn results_view(&self) -> ResultsView<'_> {
        match self.results.as_slice() {
            [only] => ResultsView::Single(only),
            _ => ResultsView::Keyed(
                self.handlers
                    .iter()
                    .map(String::as_str)
                    .zip(self.results.iter())
                    .collect(),
            ),
        }
    }

    pub fn related(&self) -> Option<&[Uuid]> {
        self.related.as_deref()
    }

    pub fn data(&self) -> Option<&[Value]> {
        self.data.as_deref()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn committed_by(&self) -> Option<i64> {
        self.committed_by
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn mark_as_persisted(&mut self) {
        self.persisted = true;
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProcessStatus::Pending
    }

    pub fn is_finished(&self) -> bool {
        self.status == ProcessStatus::Finished
    }

    pub fn is_canceled(&self) -> bool {
        self.status == ProcessStatus::Canceled
    }

    /// Finished with every handler succeeded.
    pub fn is_successful(&self) -> bool {
        self.is_finished()
            && self
                .results
                .iter()
                .all(|r| r.status == SubStatus::Succeed)
    }

    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status == SubStatus::Failed)
    }

    /// New or Canceled, and no handler has reported yet.
    pub fn qualify_to_start(&self) -> bool {
        matches!(self.status, ProcessStatus::New | ProcessStatus::Canceled)
            && self.results.iter().all(|r| r.status == SubStatus::New)
    }

    /// Every handler has reached Succeed or Failed.
    pub fn qualify_as_finished(&self) -> bool {
        self.results.iter().all(|r| r.status.is_terminal())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_pending() {
            return Err(BusError::invalid_action(format!(
                "process [{}] is already pending",
                self.id
            )));
        }
        if !self.qualify_to_start() {
            return Err(BusError::invalid_action(format!(
                "process [{}] does not qualify to start",
                self.id
            )));
        }

        self.status = ProcessStatus::Pending;
        self.started_at = Some(now());
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.is_finished() {
            return Err(BusError::invalid_action(format!(
                "process [{}] is already finished",
                self.id
            )));
        }
        if !self.qualify_as_finished() {
            return Err(BusError::invalid_action(format!(
                "process [{}] still has unresolved handlers",
                self.id
            )));
        }

        self.status = ProcessStatus::Finished;
        self.finished_at = Some(now());
        Ok(())
    }

    /// Cancel before any handler has started or reported.
    pub fn cancel(&mut self) -> Result<()> {
        let untouched = self.results.iter().all(|r| r.status == SubStatus::New);
        if self.status != ProcessStatus::New || !untouched {
            return Err(BusError::invalid_action(format!(
                "cannot cancel process [{}] in status {}",
                self.id, self.status
            )));
        }

        self.status = ProcessStatus::Canceled;
        self.finished_at = Some(now());
        Ok(())
    }

    /// Slot of a handler id: the first of its slots still unresolved,
    /// otherwise its first slot.
    pub fn slot_of(&self, handler: &str) -> Result<usize> {
        let mut slots = self
            .handlers
            .iter()
            .enumerate()
            .filter(|(_, h)| h.as_str() == handler)
            .map(|(slot, _)| slot)
            .peekable();

        let first = *slots.peek().ok_or_else(|| {
            BusError::invalid_action(format!(
                "handler [{handler}] is not assigned to process [{}]",
                self.id
            ))
        })?;

        Ok(slots
            .find(|&slot| !self.results[slot].status.is_terminal())
            .unwrap_or(first))
    }

    pub fn result_of(&self, handler: &str) -> Result<&SubResult> {
        let slot = self.slot_of(handler)?;
        Ok(&self.results[slot])
    }

    pub fn result_at(&self, slot: usize) -> Option<&SubResult> {
        self.results.get(slot)
    }

    /// Record a handler's outcome by handler id.
    pub fn apply_handler_result(
        &mut self,
        handler: &str,
        status: SubStatus,
        result: &HandlerResult,
    ) -> Result<()> {
        let slot = self.slot_of(handler)?;
        self.apply_handler_result_at(slot, status, result)
    }

    /// Record a handler's outcome by slot.
    pub fn apply_handler_result_at(
        &mut self,
        slot: usize,
        status: SubStatus,
        result: &HandlerResult,
    ) -> Result<()> {
        self.apply_result(slot, status, result.feedback.clone())?;
        self.apply_data(result.data.clone());
        self.apply_related(result.related.clone());
        Ok(())
    }

    /// Set a slot's status; feedback replaces the old one only when present.
    pub fn apply_result(
        &mut self,
        slot: usize,
        status: SubStatus,
        feedback: Option<String>,
    ) -> Result<()> {
        let id = self.id;
        let sub = self.results.get_mut(slot).ok_or_else(|| {
            BusError::invalid_action(format!("process [{id}] has no handler slot {slot}"))
        })?;

        sub.status = status;
        if feedback.is_some() {
            sub.feedback = feedback;
        }
        Ok(())
    }

    /// Append a payload. Arrays append element-wise; null and empty arrays
    /// are ignored.
    pub fn apply_data(&mut self, data: Option<Value>) {
        let items = match data {
            None | Some(Value::Null) => return,
            Some(Value::Array(items)) if items.is_empty() => return,
            Some(Value::Array(items)) => items,
            Some(other) => vec![other],
        };
        self.data.get_or_insert_with(Vec::new).extend(items);
    }

    pub fn apply_related(&mut self, related: Option<Vec<Uuid>>) {
        match related {
            Some(ids) if !ids.is_empty() => {
                self.related.get_or_insert_with(Vec::new).extend(ids)
            }
            _ => {}
        }
    }

    pub fn to_record(&self) -> Result<ProcessRecord> {
        Ok(ProcessRecord {
            id: self.id,
            bus: self.bus.clone(),
            process: self.process.clone(),
            status: self.status.as_str().to_string(),
            handlers: serde_json::to_string(&self.handlers)?,
            results: serde_json::to_string(&self.results)?,
            related: self.related.as_ref().map(serde_json::to_string).transpose()?,
            data: self.data.as_ref().map(serde_json::to_string).transpose()?,
            pid: self.pid.map(i64::from),
            committed_by: self.committed_by,
            committed_at: self.committed_at.timestamp_millis(),
            started_at: self.started_at.map(|t| t.timestamp_millis()),
            finished_at: self.finished_at.map(|t| t.timestamp_millis()),
        })
    }

    /// Rebuild a process from storage. The result is marked persisted.
    pub fn from_record(record: &ProcessRecord) -> Result<Self> {
        let status = record
            .status
            .parse::<ProcessStatus>()
            .map_err(|e| invalid("status", e))?;
        let handlers: Vec<String> = decode("handlers", &record.handlers)?;
        let results: Vec<SubResult> = decode("results", &record.results)?;

        if handlers.is_empty() {
            return Err(invalid("handlers", "no handlers assigned"));
        }
        if handlers.len() != results.len() {
            return Err(invalid(
                "results",
                format!("{} results for {} handlers", results.len(), handlers.len()),
            ));
        }

        let pid = record
            .pid
            .map(u32::try_from)
            .transpose()
            .map_err(|e| invalid("pid", e))?;

        Ok(Self {
            id: record.id,
            bus: record.bus.clone(),
            process: record.process.clone(),
            status,
            handlers,
            results,
            related: record
                .related
                .as_deref()
                .map(|raw| decode("related", raw))
                .transpose()?,
            data: record
                .data
                .as_deref()
                .map(|raw| decode("data", raw))
                .transpose()?,
            pid,
            committed_by: record.committed_by,
            committed_at: timestamp("committed_at", record.committed_at)?,
            started_at: record
                .started_at
                .map(|ms| timestamp("started_at", ms))
                .transpose()?,
            finished_at: record
                .finished_at
                .map(|ms| timestamp("finished_at", ms))
                .transpose()?,
            persisted: true,
        })
    }
}

/// Equality over stored fields; the transient `persisted` flag is ignored.
impl PartialEq for Process {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.bus == other.bus
            && self.process == other.process
            && self.status == other.status
            && self.handlers == other.handlers
            && self.results == other.results
            && self.related == other.related
            && self.data == other.data
            && self.pid == other.pid
            && self.committed_by == other.committed_by
            && self.committed_at == other.committed_at
            && self.started_at == other.started_at
            && self.finished_at == other.finished_at
    }
}

/// Flat storage shape of a [`Process`].
///
/// Nested fields are JSON text; timestamps are epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: Uuid,
    pub bus: String,
    pub process: String,
    pub status: String,
    pub handlers: String,
    pub results: String,
    pub related: Option<String>,
    pub data: Option<String>,
    pub pid: Option<i64>,
    pub committed_by: Option<i64>,
    pub committed_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
}

/// Current time at millisecond precision, so records round-trip exactly.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn invalid(field: &'static str, reason: impl ToString) -> BusError {
    BusError::InvalidRecord {
        field,
        reason: reason.to_string(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(field: &'static str, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| invalid(field, e))
}

fn timestamp(field: &'static str, millis: i64) -> Result<DateTime<Utc>> {
    if millis < MIN_MILLIS {
        return Err(invalid(
            field,
            format!("{millis} is not an epoch timestamp in milliseconds"),
        ));
    }
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| invalid(field, format!("{millis} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process(handlers: &[&str]) -> Process {
        Process::create(
            "test-bus",
            "app::HelloCommand",
            handlers.iter().map(|h| h.to_string()).collect(),
            Some(7),
        )
        .unwrap()
    }

    fn assert_invalid_action<T: fmt::Debug>(result: Result<T>) {
        assert!(
            matches!(result, Err(BusError::InvalidAction { .. })),
            "expected InvalidAction, got {result:?}"
        );
    }

    #[test]
    fn create_assigns_one_new_result_per_handler() {
        for n in 1..=5 {
            let handlers: Vec<String> = (0..n).map(|i| format!("h{i}")).collect();
            let p = Process::create("bus", "cmd", handlers, None).unwrap();

            assert_eq!(p.status(), ProcessStatus::New);
            assert_eq!(p.results().len(), n);
            assert!(p.results().iter().all(|r| r.status == SubStatus::New));
            assert!(!p.is_persisted());
            assert_eq!(p.pid(), Some(std::process::id()));
        }
    }

    #[test]
    fn create_without_handlers_fails() {
        assert_invalid_action(Process::create("bus", "cmd", vec![], None));
    }

    #[test]
    fn start_twice_fails() {
        let mut p = process(&["a"]);
        p.start().unwrap();
        assert!(p.is_pending());
        assert!(p.started_at().is_some());

        assert_invalid_action(p.start());
    }

    #[test]
    fn start_requires_untouched_results() {
        let mut p = process(&["a", "b"]);
        p.apply_handler_result("a", SubStatus::Succeed, &"ok".into())
            .unwrap();
        assert!(!p.qualify_to_start());
        assert_invalid_action(p.start());
    }

    #[test]
    fn canceled_process_may_start_again() {
        let mut p = process(&["a"]);
        p.cancel().unwrap();
        assert!(p.is_canceled());
        assert!(p.finished_at().is_some());

        p.start().unwrap();
        assert!(p.is_pending());
    }

    #[test]
    fn finish_requires_every_handler_resolved() {
        let mut p = process(&["a", "b"]);
        p.start().unwrap();
        assert_invalid_action(p.finish());

        p.apply_handler_result("a", SubStatus::Succeed, &HandlerResult::empty())
            .unwrap();
        p.apply_handler_result("b", SubStatus::Pending, &HandlerResult::empty())
            .unwrap();
        assert_invalid_action(p.finish());

        p.apply_handler_result("b", SubStatus::Failed, &"boom".into())
            .unwrap();
        p.finish().unwrap();
        assert!(p.is_finished());
        assert!(!p.is_successful());
        assert!(p.has_failures());

        assert_invalid_action(p.finish());
    }

    #[test]
    fn cancel_only_while_untouched() {
        let mut started = process(&["a"]);
        started.start().unwrap();
        assert_invalid_action(started.cancel());

        let mut reported = process(&["a"]);
        reported
            .apply_handler_result("a", SubStatus::Pending, &HandlerResult::empty())
            .unwrap();
        assert_invalid_action(reported.cancel());

        let mut finished = process(&["a"]);
        finished
            .apply_handler_result("a", SubStatus::Succeed, &HandlerResult::empty())
            .unwrap();
        finished.finish().unwrap();
        assert_invalid_action(finished.cancel());
    }

    #[test]
    fn successful_only_when_finished_and_all_succeed() {
        let mut p = process(&["a", "b"]);
        p.apply_handler_result("a", SubStatus::Succeed, &HandlerResult::empty())
            .unwrap();
        p.apply_handler_result("b", SubStatus::Succeed, &HandlerResult::empty())
            .unwrap();
        assert!(!p.is_successful());

        p.finish().unwrap();
        assert!(p.is_successful());
    }

    #[test]
    fn unknown_handler_is_rejected() {
        let mut p = process(&["a"]);
        assert_invalid_action(p.apply_handler_result(
            "missing",
            SubStatus::Succeed,
            &HandlerResult::empty(),
        ));
        assert_invalid_action(p.result_of("missing"));
        assert_invalid_action(p.apply_result(3, SubStatus::Succeed, None));
    }

    #[test]
    fn unknown_status_strings_are_rejected() {
        assert_eq!("succeed".parse::<SubStatus>().unwrap(), SubStatus::Succeed);
        assert_eq!(
            "canceled".parse::<ProcessStatus>().unwrap(),
            ProcessStatus::Canceled
        );
        assert_invalid_action("done".parse::<SubStatus>());
        assert_invalid_action("Succeeded".parse::<ProcessStatus>());
    }

    #[test]
    fn feedback_is_kept_when_update_has_none() {
        let mut p = process(&["a"]);
        p.apply_handler_result("a", SubStatus::Pending, &"working".into())
            .unwrap();
        p.apply_handler_result("a", SubStatus::Succeed, &HandlerResult::empty())
            .unwrap();

        let sub = p.result_of("a").unwrap();
        assert_eq!(sub.status, SubStatus::Succeed);
        assert_eq!(sub.feedback.as_deref(), Some("working"));
    }

    #[test]
    fn duplicate_handler_ids_address_distinct_slots() {
        let mut p = process(&["dup", "dup"]);
        p.apply_handler_result("dup", SubStatus::Succeed, &"first".into())
            .unwrap();
        p.apply_handler_result("dup", SubStatus::Failed, &"second".into())
            .unwrap();

        assert_eq!(p.result_at(0).unwrap().feedback.as_deref(), Some("first"));
        assert_eq!(p.result_at(1).unwrap().feedback.as_deref(), Some("second"));
        assert!(p.qualify_as_finished());
    }

    #[test]
    fn data_and_related_accumulate() {
        let mut p = process(&["a", "b"]);
        let child = Uuid::now_v7();

        p.apply_data(None);
        p.apply_data(Some(Value::Null));
        p.apply_data(Some(json!([])));
        assert!(p.data().is_none());

        p.apply_handler_result(
            "a",
            SubStatus::Succeed,
            &HandlerResult::empty()
                .with_data(json!([1, 2]))
                .with_related([child]),
        )
        .unwrap();
        p.apply_handler_result(
            "b",
            SubStatus::Succeed,
            &HandlerResult::empty().with_data(json!({"k": "v"})),
        )
        .unwrap();

        assert_eq!(p.data().unwrap(), &[json!(1), json!(2), json!({"k": "v"})]);
        assert_eq!(p.related().unwrap(), &[child]);
    }

    #[test]
    fn results_view_depends_on_handler_count() {
        let single = process(&["a"]);
        assert!(matches!(single.results_view(), ResultsView::Single(_)));

        let multi = process(&["a", "b"]);
        match multi.results_view() {
            ResultsView::Keyed(entries) => {
                let names: Vec<_> = entries.iter().map(|(h, _)| *h).collect();
                assert_eq!(names, ["a", "b"]);
            }
            other => panic!("expected keyed view, got {other:?}"),
        }
    }

    #[test]
    fn record_round_trip_keeps_every_field() {
        let mut p = process(&["a", "b"]);
        p.start().unwrap();
        p.apply_handler_result(
            "a",
            SubStatus::Succeed,
            &HandlerResult::feedback("done")
                .with_data(json!({"n": 1}))
                .with_related([Uuid::now_v7()]),
        )
        .unwrap();
        p.apply_handler_result("b", SubStatus::Failed, &"broke".into())
            .unwrap();
        p.finish().unwrap();

        let record = p.to_record().unwrap();
        assert_eq!(record.status, "finished");
        assert_eq!(record.handlers, r#"["a","b"]"#);
        assert_eq!(
            record.results,
            r#"[{"status":"succeed","feedback":"done"},{"status":"failed","feedback":"broke"}]"#
        );

        let restored = Process::from_record(&record).unwrap();
        assert_eq!(restored, p);
        assert!(restored.is_persisted());
        assert_eq!(restored.committed_at(), p.committed_at());
        assert_eq!(restored.finished_at(), p.finished_at());
    }

    #[test]
    fn record_with_second_precision_is_rejected() {
        let mut record = process(&["a"]).to_record().unwrap();
        record.committed_at /= 1000;

        let err = Process::from_record(&record).unwrap_err();
        assert!(matches!(
            err,
            BusError::InvalidRecord {
                field: "committed_at",
                ..
            }
        ));
    }

    #[test]
    fn record_with_misaligned_results_is_rejected() {
        let mut record = process(&["a", "b"]).to_record().unwrap();
        record.results = r#"[{"status":"new"}]"#.into();

        assert!(matches!(
            Process::from_record(&record),
            Err(BusError::InvalidRecord {
                field: "results",
                ..
            })
        ));
    }

    #[test]
    fn record_with_unknown_status_is_rejected() {
        let mut record = process(&["a"]).to_record().unwrap();
        record.status = "archived".into();

        assert!(matches!(
            Process::from_record(&record),
            Err(BusError::InvalidRecord { field: "status", .. })
        ));
    }
}
