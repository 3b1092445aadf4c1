//! Bus configuration.

use serde::Deserialize;

/// Behaviour switches for a [`Bus`](crate::Bus).
///
/// Deserializable from any serde source; missing fields take the defaults
/// below.
///
/// | field | default |
/// |---|---|
/// | `name` | `"bus"` |
/// | `clean_when_finished` | `true` |
/// | `persist_failed` | `true` |
/// | `persist_sync_instructions` | `true` |
/// | `stop_on_exception` | `false` |
/// | `throw_when_no_handler` | `true` |
/// | `always_async` | `false` |
/// | `default_queue` | none |
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Recorded on every process as its originating bus.
    pub name: String,
    /// Delete a queued process once it finished successfully.
    pub clean_when_finished: bool,
    /// Write processes with a failed handler even when sync processes are
    /// not persisted.
    pub persist_failed: bool,
    /// Write processes whose handlers all ran inline.
    pub persist_sync_instructions: bool,
    /// Re-raise handler failures after recording them.
    pub stop_on_exception: bool,
    /// Fail dispatch when no handler is mapped, instead of returning `None`.
    pub throw_when_no_handler: bool,
    /// Treat every instruction as async.
    pub always_async: bool,
    /// Queue used when an instruction names none.
    pub default_queue: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            name: "bus".to_string(),
            clean_when_finished: true,
            persist_failed: true,
            persist_sync_instructions: true,
            stop_on_exception: false,
            throw_when_no_handler: true,
            always_async: false,
            default_queue: None,
        }
    }
}

impl BusConfig {
    /// Preset for a command bus: inline commands leave no trace unless they
    /// fail, and handler failures reach the caller.
    pub fn command_bus() -> Self {
        Self {
            name: "command-bus".to_string(),
            persist_sync_instructions: false,
            stop_on_exception: true,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_clean_when_finished(mut self, clean: bool) -> Self {
        self.clean_when_finished = clean;
        self
    }

    pub fn with_persist_failed(mut self, persist: bool) -> Self {
        self.persist_failed = persist;
        self
    }

    pub fn with_persist_sync_instructions(mut self, persist: bool) -> Self {
        self.persist_sync_instructions = persist;
        self
    }

    pub fn with_stop_on_exception(mut self, stop: bool) -> Self {
        self.stop_on_exception = stop;
        self
    }

    pub fn with_throw_when_no_handler(mut self, throw: bool) -> Self {
        self.throw_when_no_handler = throw;
        self
    }

    pub fn with_always_async(mut self, always: bool) -> Self {
        self.always_async = always;
        self
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }
}
