//! Queued execution of one handler against one process.
//!
//! - [`AsyncHandlerJob`] - the serializable unit of work the bus enqueues
//! - [`WorkerContext`] - collaborators a worker injects when running jobs
//! - [`InstructionRegistry`] - turns queued payloads back into instructions
//! - [`JobOutcome`] - what running a job did
//!
//! # Worker loop
//!
//! Delivery policy (polling cadence, retries, concurrency) belongs to the
//! queue transport. A worker only needs to hand each job to `run`:
//!
//! ```ignore
//! let ctx = WorkerContext::new(repository, catalog, instructions);
//!
//! while let Some(job) = receiver.recv().await {
//!     if let Err(e) = job.run(&ctx).await {
//!         // the sub-result is already marked failed; decide about retries
//!         tracing::warn!(error = %e, "job failed");
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{BusError, DeserializationError, Result};
use crate::handler::{execute, HandlerCatalog, HandlerId};
use crate::instruction::{AnyInstruction, Instruction};
use crate::process::{Process, ProcessId, SubStatus};
use crate::repository::{settle, ProcessRepository};
use crate::result::HandlerResult;

/// One handler of one process, waiting in a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncHandlerJob {
    pub process_id: ProcessId,
    /// Instruction name, the key into the [`InstructionRegistry`].
    pub instruction: String,
    pub payload: serde_json::Value,
    pub handler: HandlerId,
    /// Position of the handler in the process.
    pub slot: usize,
    /// Delete the process once it finished successfully.
    pub clean_on_success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Result of running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The handler ran and its outcome was recorded.
    Applied {
        status: SubStatus,
        /// This job finished the process.
        finished: bool,
        /// The finished process was deleted.
        cleaned: bool,
    },
    /// The slot already held a final result; nothing ran.
    AlreadyResolved,
    /// The process was canceled; nothing ran.
    Canceled,
}

impl AsyncHandlerJob {
    pub fn new(
        process_id: ProcessId,
        instruction: impl Into<String>,
        payload: serde_json::Value,
        handler: impl Into<HandlerId>,
        slot: usize,
    ) -> Self {
        Self {
            process_id,
            instruction: instruction.into(),
            payload,
            handler: handler.into(),
            slot,
            clean_on_success: false,
            timeout_ms: None,
        }
    }

    pub fn with_clean_on_success(mut self, clean: bool) -> Self {
        self.clean_on_success = clean;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Run the job and fall back to [`failed`](Self::failed) when the job
    /// itself breaks. The triggering error is returned either way.
    pub async fn run<D>(&self, ctx: &WorkerContext<D>) -> Result<JobOutcome>
    where
        D: Send + Sync + 'static,
    {
        match self.handle(ctx).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                if err.is_infrastructure() {
                    if let Err(callback) = self.failed(ctx, &err).await {
                        error!(
                            process_id = %self.process_id,
                            handler = %self.handler,
                            error = %callback,
                            "failure callback could not record the disruption"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    /// Execute the handler and record its outcome.
    ///
    /// Handler errors and panics are recorded as `Failed` and do not make
    /// this return an error.
    pub async fn handle<D>(&self, ctx: &WorkerContext<D>) -> Result<JobOutcome>
    where
        D: Send + Sync + 'static,
    {
        let repository = ctx.repository();
        let process = repository.retrieve(self.process_id).await?;

        if process.is_canceled() {
            info!(process_id = %self.process_id, handler = %self.handler, "process canceled, handler skipped");
            return Ok(JobOutcome::Canceled);
        }
        if self.slot_status(&process)?.is_terminal() {
            debug!(process_id = %self.process_id, handler = %self.handler, "handler already resolved, redelivery skipped");
            return Ok(JobOutcome::AlreadyResolved);
        }

        if !process.is_pending() {
            repository.start(self.process_id).await?;
        }

        let instruction = ctx.instructions().decode(&self.instruction, &self.payload)?;
        let handler = ctx.catalog().resolve(&self.handler)?;

        let execution = execute(handler.as_ref(), instruction.as_any());
        let outcome = match self.timeout() {
            Some(duration) => tokio::time::timeout(duration, execution)
                .await
                .map_err(|_| BusError::Timeout {
                    handler: self.handler.clone(),
                    duration,
                })?,
            None => execution.await,
        };

        let (status, result) = match outcome {
            Ok(result) => {
                debug!(process_id = %self.process_id, handler = %self.handler, "async handler succeeded");
                (SubStatus::Succeed, result)
            }
            Err(e) => {
                warn!(process_id = %self.process_id, handler = %self.handler, error = %e, "async handler failed");
                (SubStatus::Failed, HandlerResult::feedback(e.to_string()))
            }
        };

        let process = repository
            .apply_sub_result(self.process_id, self.slot, status, &result)
            .await?;
        let settled = settle(repository, process, self.clean_on_success).await?;

        Ok(JobOutcome::Applied {
            status,
            finished: settled.finished,
            cleaned: settled.cleaned,
        })
    }

    /// Record that the job broke before its handler could report.
    ///
    /// A slot that already holds a final result is left alone.
    pub async fn failed<D>(&self, ctx: &WorkerContext<D>, error: &BusError) -> Result<()>
    where
        D: Send + Sync + 'static,
    {
        error!(
            process_id = %self.process_id,
            handler = %self.handler,
            error = %error,
            "async handler job failed"
        );

        let repository = ctx.repository();
        let process = repository.retrieve(self.process_id).await?;
        if process.is_canceled() || self.slot_status(&process)?.is_terminal() {
            return Ok(());
        }

        let result = HandlerResult::feedback(format!("Process disrupted: {error}"));
        let process = repository
            .apply_sub_result(self.process_id, self.slot, SubStatus::Failed, &result)
            .await?;
        settle(repository, process, self.clean_on_success).await?;
        Ok(())
    }

    fn slot_status(&self, process: &Process) -> Result<SubStatus> {
        match (process.handlers().get(self.slot), process.result_at(self.slot)) {
            (Some(handler), Some(sub)) if *handler == self.handler => Ok(sub.status),
            _ => Err(BusError::InvalidAction {
                message: format!(
                    "process [{}] has no slot {} for handler [{}]",
                    self.process_id, self.slot, self.handler
                ),
            }),
        }
    }
}

/// Collaborators a worker passes to [`AsyncHandlerJob::run`].
pub struct WorkerContext<D> {
    repository: Arc<dyn ProcessRepository>,
    catalog: Arc<HandlerCatalog<D>>,
    instructions: Arc<InstructionRegistry>,
}

impl<D> WorkerContext<D> {
    pub fn new(
        repository: Arc<dyn ProcessRepository>,
        catalog: Arc<HandlerCatalog<D>>,
        instructions: Arc<InstructionRegistry>,
    ) -> Self {
        Self {
            repository,
            catalog,
            instructions,
        }
    }

    pub fn repository(&self) -> &dyn ProcessRepository {
        self.repository.as_ref()
    }

    pub fn catalog(&self) -> &HandlerCatalog<D> {
        &self.catalog
    }

    pub fn instructions(&self) -> &InstructionRegistry {
        &self.instructions
    }
}

impl<D> Clone for WorkerContext<D> {
    fn clone(&self) -> Self {
        Self {
            repository: self.repository.clone(),
            catalog: self.catalog.clone(),
            instructions: self.instructions.clone(),
        }
    }
}

type DecodeFn =
    Box<dyn Fn(&serde_json::Value) -> serde_json::Result<Box<dyn AnyInstruction>> + Send + Sync>;

/// Maps instruction names to payload decoders.
///
/// ```ignore
/// let mut instructions = InstructionRegistry::new();
/// instructions.register::<SendReport>().register::<ResizeImage>();
/// ```
#[derive(Default)]
pub struct InstructionRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl InstructionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I>(&mut self) -> &mut Self
    where
        I: Instruction + DeserializeOwned,
    {
        self.decoders.insert(
            I::name(),
            Box::new(|payload: &serde_json::Value| -> serde_json::Result<Box<dyn AnyInstruction>> {
                let instruction: I = serde_json::from_value(payload.clone())?;
                Ok(Box::new(instruction) as Box<dyn AnyInstruction>)
            }),
        );
        self
    }

    pub fn decode(
        &self,
        name: &str,
        payload: &serde_json::Value,
    ) -> Result<Box<dyn AnyInstruction>, DeserializationError> {
        let decode = self
            .decoders
            .get(name)
            .ok_or_else(|| DeserializationError::UnknownInstruction(name.to_string()))?;

        decode(payload).map_err(|source| DeserializationError::InvalidPayload {
            instruction: name.to_string(),
            source,
        })
    }

    pub fn has(&self, name: &str) -> bool {
        self.decoders.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl std::fmt::Debug for InstructionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstructionRegistry")
            .field("registered", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{Handler, HandlerOptions};
    use crate::repository::MemoryProcessRepository;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct Greet {
        greeting: String,
    }

    impl Instruction for Greet {}

    struct Echo;

    #[async_trait]
    impl Handler<Greet> for Echo {
        async fn handle(&self, instruction: &Greet) -> anyhow::Result<HandlerResult> {
            Ok(instruction.greeting.as_str().into())
        }
    }

    struct Refuse;

    #[async_trait]
    impl Handler<Greet> for Refuse {
        async fn handle(&self, instruction: &Greet) -> anyhow::Result<HandlerResult> {
            Err(anyhow!("{}", instruction.greeting))
        }
    }

    struct Slow;

    #[async_trait]
    impl Handler<Greet> for Slow {
        async fn handle(&self, _: &Greet) -> anyhow::Result<HandlerResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HandlerResult::empty())
        }
    }

    struct Fixture {
        ctx: WorkerContext<()>,
        repo: Arc<MemoryProcessRepository>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryProcessRepository::new());
        let mut catalog = HandlerCatalog::new(());
        catalog
            .register_with::<Greet, _>(HandlerOptions::named("echo"), Echo)
            .unwrap();
        catalog
            .register_with::<Greet, _>(HandlerOptions::named("refuse"), Refuse)
            .unwrap();
        catalog
            .register_with::<Greet, _>(HandlerOptions::named("slow"), Slow)
            .unwrap();

        let mut instructions = InstructionRegistry::new();
        instructions.register::<Greet>();

        Fixture {
            ctx: WorkerContext::new(repo.clone(), Arc::new(catalog), Arc::new(instructions)),
            repo,
        }
    }

    async fn queued(fx: &Fixture, handlers: &[&str]) -> Vec<AsyncHandlerJob> {
        let mut process = Process::create(
            "bus",
            Greet::name(),
            handlers.iter().map(|h| h.to_string()).collect(),
            None,
        )
        .unwrap();
        fx.repo.persist(&mut process).await.unwrap();

        handlers
            .iter()
            .enumerate()
            .map(|(slot, handler)| {
                AsyncHandlerJob::new(
                    process.id(),
                    Greet::name(),
                    json!({"greeting": "Hello world"}),
                    *handler,
                    slot,
                )
            })
            .collect()
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = AsyncHandlerJob::new(uuid::Uuid::now_v7(), "greet", json!({"a": 1}), "echo", 2)
            .with_clean_on_success(true)
            .with_timeout(Duration::from_millis(1500));

        let raw = serde_json::to_string(&job).unwrap();
        let back: AsyncHandlerJob = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, job);
        assert_eq!(back.timeout(), Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn single_job_starts_applies_and_finishes() {
        let fx = fixture();
        let jobs = queued(&fx, &["echo"]).await;

        let outcome = jobs[0].run(&fx.ctx).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Applied {
                status: SubStatus::Succeed,
                finished: true,
                cleaned: false,
            }
        );

        let process = fx.repo.retrieve(jobs[0].process_id).await.unwrap();
        assert!(process.is_successful());
        assert!(process.started_at().is_some());
        assert_eq!(
            process.result_of("echo").unwrap().feedback.as_deref(),
            Some("Hello world")
        );
    }

    #[tokio::test]
    async fn clean_on_success_deletes_successful_process() {
        let fx = fixture();
        let job = queued(&fx, &["echo"]).await.remove(0).with_clean_on_success(true);

        let outcome = job.run(&fx.ctx).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Applied { cleaned: true, .. }));
        assert!(fx.repo.is_empty());
    }

    #[tokio::test]
    async fn failed_process_survives_clean_on_success() {
        let fx = fixture();
        let job = queued(&fx, &["refuse"]).await.remove(0).with_clean_on_success(true);

        let outcome = job.run(&fx.ctx).await.unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Applied {
                status: SubStatus::Failed,
                finished: true,
                cleaned: false,
            }
        );

        let process = fx.repo.retrieve(job.process_id).await.unwrap();
        assert!(process.is_finished());
        assert_eq!(
            process.result_of("refuse").unwrap().feedback.as_deref(),
            Some("Hello world")
        );
    }

    #[tokio::test]
    async fn only_the_last_job_finishes_the_process() {
        let fx = fixture();
        let jobs = queued(&fx, &["echo", "refuse"]).await;

        let first = jobs[1].run(&fx.ctx).await.unwrap();
        assert!(matches!(first, JobOutcome::Applied { finished: false, .. }));
        let pending = fx.repo.retrieve(jobs[0].process_id).await.unwrap();
        assert!(pending.is_pending());

        let second = jobs[0].run(&fx.ctx).await.unwrap();
        assert!(matches!(second, JobOutcome::Applied { finished: true, .. }));
    }

    #[tokio::test]
    async fn redelivered_job_is_skipped() {
        let fx = fixture();
        let jobs = queued(&fx, &["echo"]).await;

        jobs[0].run(&fx.ctx).await.unwrap();
        let before = fx.repo.retrieve(jobs[0].process_id).await.unwrap();

        assert_eq!(jobs[0].run(&fx.ctx).await.unwrap(), JobOutcome::AlreadyResolved);
        let after = fx.repo.retrieve(jobs[0].process_id).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn canceled_process_is_not_executed() {
        let fx = fixture();
        let jobs = queued(&fx, &["echo"]).await;
        fx.repo.cancel(jobs[0].process_id).await.unwrap();

        assert_eq!(jobs[0].run(&fx.ctx).await.unwrap(), JobOutcome::Canceled);
        let process = fx.repo.retrieve(jobs[0].process_id).await.unwrap();
        assert_eq!(process.result_at(0).unwrap().status, SubStatus::New);
    }

    #[tokio::test]
    async fn timeout_records_disruption() {
        let fx = fixture();
        let job = queued(&fx, &["slow"])
            .await
            .remove(0)
            .with_timeout(Duration::from_millis(50));

        let err = job.run(&fx.ctx).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout { .. }));

        let process = fx.repo.retrieve(job.process_id).await.unwrap();
        assert!(process.is_finished());
        let sub = process.result_at(0).unwrap();
        assert_eq!(sub.status, SubStatus::Failed);
        assert!(sub
            .feedback
            .as_deref()
            .unwrap()
            .starts_with("Process disrupted: "));
    }

    #[tokio::test]
    async fn undecodable_payload_records_disruption() {
        let fx = fixture();
        let mut job = queued(&fx, &["echo"]).await.remove(0);
        job.payload = json!({"unexpected": true});

        let err = job.run(&fx.ctx).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::Deserialization(DeserializationError::InvalidPayload { .. })
        ));

        let process = fx.repo.retrieve(job.process_id).await.unwrap();
        assert_eq!(process.result_at(0).unwrap().status, SubStatus::Failed);
    }

    #[tokio::test]
    async fn missing_process_is_returned_without_callback() {
        let fx = fixture();
        let job = AsyncHandlerJob::new(uuid::Uuid::now_v7(), Greet::name(), json!({}), "echo", 0);

        assert!(matches!(
            job.run(&fx.ctx).await,
            Err(BusError::MissingProcess { .. })
        ));
    }

    #[test]
    fn registry_reports_unknown_instruction() {
        let registry = InstructionRegistry::new();
        assert!(registry.is_empty());
        assert!(matches!(
            registry.decode("nope", &json!({})),
            Err(DeserializationError::UnknownInstruction(name)) if name == "nope"
        ));
    }
}
