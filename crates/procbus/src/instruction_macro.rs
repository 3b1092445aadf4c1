//! Macros for reducing instruction boilerplate.

/// Auto-implement `serialize_to_json()` for instructions that derive `Serialize`.
///
/// Async instructions need a JSON payload so a worker can rebuild them. Use
/// this inside the `Instruction` impl block instead of writing the method.
///
/// # Example
///
/// ```ignore
/// use procbus::{auto_serialize, ExecutionMode, Instruction};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct ResizeImage {
///     upload_id: Uuid,
///     width: u32,
/// }
///
/// impl Instruction for ResizeImage {
///     fn execution_mode(&self) -> ExecutionMode {
///         ExecutionMode::Async
///     }
///
///     auto_serialize!();
/// }
/// ```
#[macro_export]
macro_rules! auto_serialize {
    () => {
        fn serialize_to_json(&self) -> Option<serde_json::Result<serde_json::Value>> {
            Some(serde_json::to_value(self))
        }
    };
}

/// Make an instruction its own trigger, so `dispatch` needs no explicit one.
///
/// ```ignore
/// impl Instruction for ResizeImage {
///     self_trigger!();
/// }
///
/// bus.dispatch(&ResizeImage { upload_id, width: 640 }).await?;
/// ```
#[macro_export]
macro_rules! self_trigger {
    () => {
        fn trigger(&self) -> Option<$crate::Trigger> {
            Some($crate::Trigger::of::<Self>())
        }
    };
}
