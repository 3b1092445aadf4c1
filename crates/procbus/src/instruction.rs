//! Instructions, triggers and execution modes.
//!
//! An [`Instruction`] is a typed payload describing what should happen. The
//! bus looks handlers up by [`Trigger`], which is usually the instruction's
//! own type.
//!
//! # Example
//!
//! ```ignore
//! use procbus::{auto_serialize, self_trigger, ExecutionMode, Instruction, QueueOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct SendReport {
//!     account_id: i64,
//! }
//!
//! impl Instruction for SendReport {
//!     fn execution_mode(&self) -> ExecutionMode {
//!         ExecutionMode::Async
//!     }
//!
//!     fn queue_options(&self) -> QueueOptions {
//!         QueueOptions::default().on_queue("reports")
//!     }
//!
//!     self_trigger!();
//!     auto_serialize!();
//! }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::time::Duration;

/// Whether handlers for an instruction run inline or through the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Run on the caller's task during `dispatch`.
    #[default]
    Sync,

    /// Persist the process and enqueue one job per handler.
    ///
    /// The bus needs a job queue, and the instruction must serialize itself
    /// (see [`auto_serialize!`](crate::auto_serialize)).
    Async,
}

impl ExecutionMode {
    pub fn is_async(&self) -> bool {
        matches!(self, ExecutionMode::Async)
    }
}

/// Per-instruction routing for queued handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Named queue; the bus default applies when unset.
    pub queue: Option<String>,
    /// Postpone the job by this long.
    pub delay: Option<Duration>,
    /// Give up on the handler after this long.
    pub timeout: Option<Duration>,
}

impl QueueOptions {
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Key the bus uses to find handlers.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Trigger {
    type_id: TypeId,
    name: &'static str,
}

impl Trigger {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Trigger({})", self.name)
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A typed request for work.
pub trait Instruction: Any + Send + Sync + 'static {
    /// Stable name, used to decode queued payloads back into this type.
    ///
    /// Defaults to the Rust type name. Override it if queued jobs must
    /// survive a rename.
    fn name() -> &'static str
    where
        Self: Sized,
    {
        std::any::type_name::<Self>()
    }

    /// Defaults to [`ExecutionMode::Sync`].
    fn execution_mode(&self) -> ExecutionMode {
        ExecutionMode::Sync
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions::default()
    }

    /// The trigger this instruction answers to when dispatched without one.
    ///
    /// `None` by default, so plain instructions need an explicit trigger.
    /// [`self_trigger!`](crate::self_trigger) makes the type its own trigger.
    fn trigger(&self) -> Option<Trigger> {
        None
    }

    /// JSON payload for the queue. Required for async execution.
    ///
    /// `None` means the type cannot be queued at all; `Some(Err(_))` is a
    /// value that failed to serialize.
    fn serialize_to_json(&self) -> Option<serde_json::Result<serde_json::Value>> {
        None
    }
}

/// Object-safe view of an [`Instruction`].
pub trait AnyInstruction: Send + Sync {
    fn instruction_name(&self) -> &'static str;
    fn get_execution_mode(&self) -> ExecutionMode;
    fn get_queue_options(&self) -> QueueOptions;
    fn get_trigger(&self) -> Option<Trigger>;
    fn get_serialize_to_json(&self) -> Option<serde_json::Result<serde_json::Value>>;
    fn as_any(&self) -> &(dyn Any + Send + Sync);
}

impl<I: Instruction> AnyInstruction for I {
    fn instruction_name(&self) -> &'static str {
        I::name()
    }

    fn get_execution_mode(&self) -> ExecutionMode {
        self.execution_mode()
    }

    fn get_queue_options(&self) -> QueueOptions {
        self.queue_options()
    }

    fn get_trigger(&self) -> Option<Trigger> {
        self.trigger()
    }

    fn get_serialize_to_json(&self) -> Option<serde_json::Result<serde_json::Value>> {
        self.serialize_to_json()
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

impl fmt::Debug for dyn AnyInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyInstruction")
            .field("name", &self.instruction_name())
            .finish_non_exhaustive()
    }
}
