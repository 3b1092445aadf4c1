//! Structured error type for procbus.
//!
//! `BusError` gives callers pattern-matchable failures instead of a generic
//! `anyhow::Error`. Handler bodies and queue transports still return
//! `anyhow::Result`; those errors are wrapped at the boundary.
//!
//! # Propagation
//!
//! - Handler failures are recorded as a `Failed` sub-result and swallowed,
//!   unless the bus is configured to stop on exception, in which case the
//!   failure surfaces as [`BusError::Handler`] after it has been recorded.
//! - Everything else (contract violations, missing handlers or processes,
//!   misconfiguration, storage failures) propagates unchanged.
//!
//! # Example
//!
//! ```ignore
//! match bus.dispatch(&cmd).await {
//!     Ok(Some(process)) => println!("{} -> {:?}", process.id(), process.status()),
//!     Ok(None) => println!("nobody listens to this one"),
//!     Err(BusError::MissingHandler { trigger }) => eprintln!("unmapped: {trigger}"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Result alias used across the crate.
pub type Result<T, E = BusError> = std::result::Result<T, E>;

/// Errors raised by the bus, processes, jobs and repositories.
#[derive(Debug, Error)]
pub enum BusError {
    /// No handler is mapped for the trigger.
    #[error("no handler registered for trigger {trigger}")]
    MissingHandler {
        /// Name of the trigger that was looked up.
        trigger: String,
    },

    /// A mapped handler is unusable, or the arity does not fit the bus.
    #[error("invalid handler for trigger {trigger}: {reason}")]
    InvalidHandler {
        /// Name of the trigger whose mapping is invalid.
        trigger: String,
        /// What is wrong with the mapping.
        reason: String,
    },

    /// Repository lookup found no process with this id.
    #[error("process {id} does not exist")]
    MissingProcess {
        /// The id that was looked up.
        id: Uuid,
    },

    /// A process transition was attempted outside its precondition.
    #[error("invalid action: {message}")]
    InvalidAction {
        /// Description of the rejected transition.
        message: String,
    },

    /// The bus was asked for work it is not configured to perform.
    #[error("missing configuration: {message}")]
    MissingConfiguration {
        /// What is missing.
        message: String,
    },

    /// A storage record could not be turned back into a process.
    #[error("invalid process record field {field}: {reason}")]
    InvalidRecord {
        /// Column name.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// A handler factory failed to build the handler.
    #[error("handler {handler} cannot be resolved: {source}")]
    Unresolvable {
        /// Handler id.
        handler: String,
        /// Factory error.
        #[source]
        source: anyhow::Error,
    },

    /// A handler failed and the bus is configured to stop on exception.
    #[error("handler {handler} failed: {source}")]
    Handler {
        /// Handler id.
        handler: String,
        /// The handler's error.
        #[source]
        source: anyhow::Error,
    },

    /// A queued handler exceeded its timeout.
    #[error("handler {handler} timed out after {duration:?}")]
    Timeout {
        /// Handler id.
        handler: String,
        /// The configured timeout.
        duration: Duration,
    },

    /// Instruction payload could not be (de)serialized.
    #[error(transparent)]
    Deserialization(#[from] DeserializationError),

    /// JSON encoding failed.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The work queue refused the job.
    #[error("failed to enqueue job for handler {handler}: {source}")]
    Enqueue {
        /// Handler id.
        handler: String,
        /// Transport error.
        #[source]
        source: anyhow::Error,
    },

    /// The storage backend failed, or a write affected no rows.
    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),
}

impl BusError {
    pub(crate) fn invalid_action(message: impl Into<String>) -> Self {
        BusError::InvalidAction {
            message: message.into(),
        }
    }

    pub(crate) fn missing_configuration(message: impl Into<String>) -> Self {
        BusError::MissingConfiguration {
            message: message.into(),
        }
    }

    /// Wraps a backend error as a storage failure.
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        BusError::Storage(err.into())
    }

    /// True when the error means the job infrastructure broke, as opposed to
    /// the process having vanished or the call being malformed.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            BusError::Unresolvable { .. }
                | BusError::Timeout { .. }
                | BusError::Deserialization(_)
                | BusError::Serialization(_)
                | BusError::Storage(_)
        )
    }
}

/// Failures turning a queued payload back into an instruction.
#[derive(Debug, Error)]
pub enum DeserializationError {
    /// No deserializer registered under this instruction name.
    #[error("unknown instruction type: {0}")]
    UnknownInstruction(String),

    /// The payload did not match the instruction's shape.
    #[error("invalid payload for {instruction}: {source}")]
    InvalidPayload {
        /// Instruction name.
        instruction: String,
        /// Decoder error.
        #[source]
        source: serde_json::Error,
    },
}
