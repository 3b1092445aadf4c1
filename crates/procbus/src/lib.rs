//! # Procbus
//!
//! A command/event bus that tracks every dispatch as a durable process.
//!
//! ## Core Concepts
//!
//! - [`Instruction`] = a command or event handed to the bus
//! - [`Handler`] = the code that acts on one instruction type
//! - [`Process`] = the record of one dispatch: which handlers ran, how each
//!   ended, and whether the whole thing is finished
//!
//! A handler either runs inline during [`Bus::dispatch`] or, for async
//! instructions, as an [`AsyncHandlerJob`] delivered by a [`JobQueue`] to a
//! worker. Both paths write their outcome into the same process.
//!
//! ## Architecture
//!
//! ```text
//! caller
//!     │
//!     ▼ dispatch()
//! Bus ── trigger ──▶ handler ids ──▶ Process (New)
//!     │
//!     ├─► sync handler ──▶ HandlerCatalog.resolve ──▶ handle() ──┐
//!     │                                                          │
//!     └─► async handler ──▶ JobQueue.enqueue(AsyncHandlerJob)    │
//!                                   │                            │
//!                                   ▼ worker                     │
//!                          AsyncHandlerJob.run(ctx) ─────────────┤
//!                                                                ▼
//!                                         ProcessRepository (per-slot writes)
//! ```
//!
//! ## Process Lifecycle
//!
//! 1. **New** - created with one `New` sub-result per handler
//! 2. **Pending** - the first handler started
//! 3. **Finished** - every handler ended in `Succeed` or `Failed`
//! 4. **Canceled** - stopped before any handler ran
//!
//! A finished process is successful only when every handler succeeded.
//!
//! ## Example
//!
//! ```ignore
//! use procbus::{auto_serialize, self_trigger, async_trait, Bus, Handler,
//!     HandlerCatalog, HandlerResult, Instruction, MemoryProcessRepository};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct HelloCommand { greeting: String }
//!
//! impl Instruction for HelloCommand {
//!     self_trigger!();
//!     auto_serialize!();
//! }
//!
//! struct HelloHandler;
//!
//! #[async_trait]
//! impl Handler<HelloCommand> for HelloHandler {
//!     async fn handle(&self, cmd: &HelloCommand) -> anyhow::Result<HandlerResult> {
//!         Ok(cmd.greeting.as_str().into())
//!     }
//! }
//!
//! let mut catalog = HandlerCatalog::new(());
//! let hello = catalog.register::<HelloCommand, _>(HelloHandler)?;
//!
//! let bus = Bus::single(Arc::new(MemoryProcessRepository::new()), Arc::new(catalog))
//!     .map::<HelloCommand>([hello])
//!     .build()?;
//!
//! let process = bus.dispatch(&HelloCommand { greeting: "Hello world".into() }).await?;
//! assert!(process.unwrap().is_successful());
//! ```

mod actor;
mod bus;
mod config;
mod error;
mod handler;
mod instruction;
mod instruction_macro;
mod process;
mod queue;
mod repository;
mod result;

// Worker side of async handlers
pub mod job;

pub use actor::{ActorProvider, FixedActor, NoActor};
pub use bus::{Arity, Bus, BusBuilder};
pub use config::BusConfig;
pub use error::{BusError, DeserializationError, Result};
pub use handler::{Handler, HandlerCatalog, HandlerId, HandlerOptions};
pub use instruction::{AnyInstruction, ExecutionMode, Instruction, QueueOptions, Trigger};
pub use job::{AsyncHandlerJob, InstructionRegistry, JobOutcome, WorkerContext};
pub use process::{
    Process, ProcessId, ProcessRecord, ProcessStatus, ResultsView, SubResult, SubStatus,
};
pub use queue::{JobQueue, NoOpJobQueue};
pub use repository::{MemoryProcessRepository, ProcessRepository, ProcessStats};
pub use result::HandlerResult;

pub use async_trait::async_trait;
