//! Dispatch orchestration.
//!
//! The [`Bus`] maps triggers to handler ids, creates a [`Process`] for every
//! dispatched instruction and drives each handler either inline or through
//! the [`JobQueue`].
//!
//! ```text
//! dispatch(instruction)
//!     │
//!     ├─ trigger ──▶ handler ids ──▶ Process::create (New, one New slot each)
//!     │
//!     └─ for each slot
//!          ├─ async instruction, handler not force-sync
//!          │     persist process (once) ─▶ enqueue AsyncHandlerJob
//!          └─ otherwise
//!                start ─▶ run handler ─▶ record Succeed/Failed ─▶ finish?
//!                      ─▶ persist per policy
//! ```
//!
//! A bus is either single-handler (one handler per trigger) or
//! multi-handler (fan-out).
//!
//! # Example
//!
//! ```ignore
//! let mut catalog = HandlerCatalog::new(deps);
//! let hello = catalog.register::<HelloCommand, _>(HelloHandler)?;
//!
//! let bus = Bus::single(Arc::new(MemoryProcessRepository::new()), Arc::new(catalog))
//!     .with_config(BusConfig::default().with_name("app"))
//!     .with_job_queue(queue)
//!     .map::<HelloCommand>([hello])
//!     .build()?;
//!
//! let process = bus.dispatch(&HelloCommand::new("Hello world")).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::actor::{ActorProvider, NoActor};
use crate::config::BusConfig;
use crate::error::{BusError, Result};
use crate::handler::{execute, HandlerCatalog, HandlerId};
use crate::instruction::{AnyInstruction, Instruction, QueueOptions, Trigger};
use crate::job::AsyncHandlerJob;
use crate::process::{Process, SubStatus};
use crate::queue::JobQueue;
use crate::repository::{settle, ProcessRepository};
use crate::result::HandlerResult;

type HandlerList = SmallVec<[HandlerId; 2]>;

/// How many handlers a trigger may map to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly one handler per trigger.
    Single,
    /// Any number of handlers per trigger.
    Multiple,
}

/// Resolves handlers for instructions and tracks each dispatch as a process.
pub struct Bus<D> {
    config: BusConfig,
    arity: Arity,
    repository: Arc<dyn ProcessRepository>,
    catalog: Arc<HandlerCatalog<D>>,
    queue: Option<Arc<dyn JobQueue>>,
    actor: Arc<dyn ActorProvider>,
    mappings: HashMap<Trigger, HandlerList>,
}

/// Builder for [`Bus`]. Mappings are validated in [`build`](Self::build).
pub struct BusBuilder<D> {
    config: BusConfig,
    arity: Arity,
    repository: Arc<dyn ProcessRepository>,
    catalog: Arc<HandlerCatalog<D>>,
    queue: Option<Arc<dyn JobQueue>>,
    actor: Arc<dyn ActorProvider>,
    mappings: HashMap<Trigger, HandlerList>,
}

impl<D: Send + Sync + 'static> BusBuilder<D> {
    fn new(
        arity: Arity,
        repository: Arc<dyn ProcessRepository>,
        catalog: Arc<HandlerCatalog<D>>,
    ) -> Self {
        Self {
            config: BusConfig::default(),
            arity,
            repository,
            catalog,
            queue: None,
            actor: Arc::new(NoActor),
            mappings: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Enables async handlers.
    pub fn with_job_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_actor(mut self, actor: Arc<dyn ActorProvider>) -> Self {
        self.actor = actor;
        self
    }

    /// Map handler ids to the trigger `T`, adding to earlier mappings.
    pub fn map<T: ?Sized + 'static>(
        self,
        handlers: impl IntoIterator<Item = impl Into<HandlerId>>,
    ) -> Self {
        self.map_trigger(Trigger::of::<T>(), handlers)
    }

    pub fn map_trigger(
        mut self,
        trigger: Trigger,
        handlers: impl IntoIterator<Item = impl Into<HandlerId>>,
    ) -> Self {
        merge(self.mappings.entry(trigger).or_default(), handlers);
        self
    }

    /// Validate every mapping and build the bus.
    pub fn build(self) -> Result<Bus<D>> {
        for (trigger, handlers) in &self.mappings {
            check_mapping(self.arity, &self.catalog, trigger, handlers)?;
        }

        Ok(Bus {
            config: self.config,
            arity: self.arity,
            repository: self.repository,
            catalog: self.catalog,
            queue: self.queue,
            actor: self.actor,
            mappings: self.mappings,
        })
    }
}

fn merge(list: &mut HandlerList, handlers: impl IntoIterator<Item = impl Into<HandlerId>>) {
    for handler in handlers {
        let handler = handler.into();
        if !list.contains(&handler) {
            list.push(handler);
        }
    }
}

fn check_mapping<D: Send + Sync + 'static>(
    arity: Arity,
    catalog: &HandlerCatalog<D>,
    trigger: &Trigger,
    handlers: &[HandlerId],
) -> Result<()> {
    let invalid = |reason: String| BusError::InvalidHandler {
        trigger: trigger.name().to_string(),
        reason,
    };

    if handlers.is_empty() {
        return Err(invalid("no handler ids mapped".to_string()));
    }
    if arity == Arity::Single && handlers.len() > 1 {
        return Err(invalid(format!(
            "single-handler bus accepts one handler, {} mapped",
            handlers.len()
        )));
    }
    if let Some(unknown) = handlers.iter().find(|h| !catalog.contains(h)) {
        return Err(invalid(format!("handler [{unknown}] is not registered")));
    }
    Ok(())
}

impl<D: Send + Sync + 'static> Bus<D> {
    /// Builder for a bus that allows one handler per trigger.
    pub fn single(
        repository: Arc<dyn ProcessRepository>,
        catalog: Arc<HandlerCatalog<D>>,
    ) -> BusBuilder<D> {
        BusBuilder::new(Arity::Single, repository, catalog)
    }

    /// Builder for a bus that fans out to every mapped handler.
    pub fn multiple(
        repository: Arc<dyn ProcessRepository>,
        catalog: Arc<HandlerCatalog<D>>,
    ) -> BusBuilder<D> {
        BusBuilder::new(Arity::Multiple, repository, catalog)
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// True when the bus can enqueue async handlers.
    pub fn supports_async(&self) -> bool {
        self.queue.is_some()
    }

    /// Add handlers to a trigger's mapping.
    ///
    /// The merged mapping is validated; on failure the bus is unchanged.
    pub fn map(
        &mut self,
        trigger: Trigger,
        handlers: impl IntoIterator<Item = impl Into<HandlerId>>,
    ) -> Result<()> {
        let mut merged = self.mappings.get(&trigger).cloned().unwrap_or_default();
        merge(&mut merged, handlers);
        check_mapping(self.arity, &self.catalog, &trigger, &merged)?;
        self.mappings.insert(trigger, merged);
        Ok(())
    }

    pub fn has_handler(&self, trigger: &Trigger) -> bool {
        self.mappings.contains_key(trigger)
    }

    /// Handler ids mapped to the trigger.
    pub fn handler(&self, trigger: &Trigger) -> Result<Vec<HandlerId>> {
        let handlers = self
            .mappings
            .get(trigger)
            .ok_or_else(|| BusError::MissingHandler {
                trigger: trigger.name().to_string(),
            })?;

        check_mapping(self.arity, &self.catalog, trigger, handlers)?;
        Ok(handlers.to_vec())
    }

    /// Dispatch an instruction under its own trigger.
    ///
    /// Returns `None` when nothing is mapped and the bus tolerates that.
    pub async fn dispatch<I: Instruction>(&self, instruction: &I) -> Result<Option<Process>> {
        self.dispatch_any(instruction, None).await
    }

    /// Dispatch an instruction under an explicit trigger.
    pub async fn dispatch_as<I: Instruction>(
        &self,
        instruction: &I,
        trigger: Trigger,
    ) -> Result<Option<Process>> {
        self.dispatch_any(instruction, Some(trigger)).await
    }

    /// Command-bus spelling of [`dispatch`](Self::dispatch).
    pub async fn publish<I: Instruction>(&self, command: &I) -> Result<Option<Process>> {
        self.dispatch(command).await
    }

    /// Dispatch several instructions against one trigger.
    ///
    /// Every instruction is dispatched; results come back in order.
    pub async fn dispatch_multiple(
        &self,
        trigger: Trigger,
        instructions: &[&dyn AnyInstruction],
    ) -> Vec<Result<Option<Process>>> {
        let mut results = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            let result = self.dispatch_any(*instruction, Some(trigger)).await;
            if let Err(e) = &result {
                warn!(
                    bus = %self.config.name,
                    trigger = %trigger,
                    error = %e,
                    "dispatch failed, continuing with remaining instructions"
                );
            }
            results.push(result);
        }
        results
    }

    pub async fn dispatch_any(
        &self,
        instruction: &dyn AnyInstruction,
        trigger: Option<Trigger>,
    ) -> Result<Option<Process>> {
        let trigger = trigger
            .or_else(|| instruction.get_trigger())
            .ok_or_else(|| {
                BusError::missing_configuration(format!(
                    "instruction {} is not its own trigger and none was given",
                    instruction.instruction_name()
                ))
            })?;

        if !self.has_handler(&trigger) {
            if self.config.throw_when_no_handler {
                return Err(BusError::MissingHandler {
                    trigger: trigger.name().to_string(),
                });
            }
            debug!(bus = %self.config.name, trigger = %trigger, "no handler mapped, dispatch skipped");
            return Ok(None);
        }

        let handlers = self.handler(&trigger)?;
        let run_async =
            self.config.always_async || instruction.get_execution_mode().is_async();
        let queued = run_async && handlers.iter().any(|h| !self.catalog.is_force_sync(h));
        let plan = if queued {
            Some(self.async_plan(instruction)?)
        } else {
            None
        };

        let mut process = Process::create(
            self.config.name.as_str(),
            instruction.instruction_name(),
            handlers.clone(),
            self.actor.actor_id(),
        )?;
        debug!(
            bus = %self.config.name,
            process_id = %process.id(),
            trigger = %trigger,
            handlers = handlers.len(),
            "dispatching"
        );

        // Queued processes are cleaned by whichever slot finishes them.
        let clean_on_success = plan.is_some() && self.config.clean_when_finished;
        for (slot, handler) in handlers.iter().enumerate() {
            match &plan {
                Some(plan) if !self.catalog.is_force_sync(handler) => {
                    if let Err(err) = self.enqueue(&mut process, plan, slot, handler).await {
                        self.disrupt(&process, slot, &err).await;
                        return Err(err);
                    }
                }
                _ => {
                    self.run_inline(&mut process, instruction, slot, handler, clean_on_success)
                        .await?;
                }
            }
        }

        Ok(Some(process))
    }

    /// Check everything async dispatch needs before anything is written.
    fn async_plan(&self, instruction: &dyn AnyInstruction) -> Result<AsyncPlan> {
        let queue = self.queue.clone().ok_or_else(|| {
            BusError::missing_configuration(format!(
                "bus {} has no job queue for async instruction {}",
                self.config.name,
                instruction.instruction_name()
            ))
        })?;
        let payload = match instruction.get_serialize_to_json() {
            Some(payload) => payload?,
            None => {
                return Err(BusError::missing_configuration(format!(
                    "async instruction {} does not serialize itself; add auto_serialize!()",
                    instruction.instruction_name()
                )))
            }
        };

        Ok(AsyncPlan {
            queue,
            payload,
            instruction: instruction.instruction_name(),
            options: instruction.get_queue_options(),
        })
    }

    async fn enqueue(
        &self,
        process: &mut Process,
        plan: &AsyncPlan,
        slot: usize,
        handler: &str,
    ) -> Result<()> {
        if !process.is_persisted() {
            self.repository.persist(process).await?;
        }

        let mut job = AsyncHandlerJob::new(
            process.id(),
            plan.instruction,
            plan.payload.clone(),
            handler,
            slot,
        )
        .with_clean_on_success(self.config.clean_when_finished);
        if let Some(timeout) = plan.options.timeout {
            job = job.with_timeout(timeout);
        }

        let queue_name = plan
            .options
            .queue
            .as_deref()
            .or(self.config.default_queue.as_deref());

        let pushed = match plan.options.delay {
            Some(delay) => {
                let delay = chrono::Duration::from_std(delay).map_err(|e| {
                    BusError::missing_configuration(format!("delay out of range: {e}"))
                })?;
                plan.queue.schedule(job, queue_name, Utc::now() + delay).await
            }
            None => plan.queue.enqueue(job, queue_name).await,
        };
        let job_id = pushed.map_err(|source| BusError::Enqueue {
            handler: handler.to_string(),
            source,
        })?;

        debug!(
            process_id = %process.id(),
            handler,
            %job_id,
            queue = ?queue_name,
            "handler queued"
        );
        Ok(())
    }

    async fn run_inline(
        &self,
        process: &mut Process,
        instruction: &dyn AnyInstruction,
        slot: usize,
        handler_id: &str,
        clean_on_success: bool,
    ) -> Result<()> {
        let id = process.id();

        if process.qualify_to_start() {
            if process.is_persisted() {
                *process = self.repository.start(id).await?;
            } else {
                process.start()?;
            }
        }

        let handler = self.catalog.resolve(handler_id)?;
        let (status, result, failure) =
            match execute(handler.as_ref(), instruction.as_any()).await {
                Ok(result) => {
                    debug!(process_id = %id, handler = handler_id, "handler succeeded");
                    (SubStatus::Succeed, result, None)
                }
                Err(e) => {
                    error!(process_id = %id, handler = handler_id, error = %e, "handler failed");
                    (SubStatus::Failed, HandlerResult::feedback(e.to_string()), Some(e))
                }
            };

        if process.is_persisted() {
            // Async siblings may be writing to the same row.
            let updated = self
                .repository
                .apply_sub_result(id, slot, status, &result)
                .await?;
            *process = settle(self.repository.as_ref(), updated, clean_on_success)
                .await?
                .process;
        } else {
            process.apply_handler_result_at(slot, status, &result)?;
            if process.qualify_as_finished() {
                process.finish()?;
            }
            if self.config.persist_sync_instructions
                || (self.config.persist_failed && process.has_failures())
            {
                self.repository.persist(process).await?;
            }
        }

        match failure {
            Some(source) if self.config.stop_on_exception => Err(BusError::Handler {
                handler: handler_id.to_string(),
                source,
            }),
            _ => Ok(()),
        }
    }

    /// Mark the slots a failed push left without a job, starting at `from`,
    /// so the stored process can still finish.
    async fn disrupt(&self, process: &Process, from: usize, error: &BusError) {
        if !process.is_persisted() {
            return;
        }
        let id = process.id();
        let result = HandlerResult::feedback(format!("Process disrupted: {error}"));

        let recorded: Result<()> = async {
            let mut stored = self.repository.start(id).await?;
            for slot in from..process.handlers().len() {
                stored = self
                    .repository
                    .apply_sub_result(id, slot, SubStatus::Failed, &result)
                    .await?;
            }
            settle(self.repository.as_ref(), stored, false).await?;
            Ok(())
        }
        .await;

        match recorded {
            Ok(()) => warn!(
                process_id = %id,
                from_slot = from,
                error = %error,
                "unqueued handlers marked disrupted"
            ),
            Err(e) => error!(process_id = %id, error = %e, "could not record the disruption"),
        }
    }
}

struct AsyncPlan {
    queue: Arc<dyn JobQueue>,
    payload: serde_json::Value,
    instruction: &'static str,
    options: QueueOptions,
}

impl<D> std::fmt::Debug for Bus<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("name", &self.config.name)
            .field("arity", &self.arity)
            .field("triggers", &self.mappings.len())
            .field("async", &self.queue.is_some())
            .finish_non_exhaustive()
    }
}
