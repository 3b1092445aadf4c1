//! Normalized handler return values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// What a handler reports back, reduced to the three parts a process keeps.
///
/// Handlers usually build one through a `From` conversion:
///
/// ```ignore
/// Ok("sent".into())                        // feedback "sent"
/// Ok(42.into())                            // feedback "42"
/// Ok(json!({"id": 7}).into())              // feedback "{\"id\":7}"
/// Ok(HandlerResult::empty().with_related([child_id]))
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandlerResult {
    /// Short text stored on the handler's sub-result.
    pub feedback: Option<String>,
    /// Opaque payload appended to the process `data`.
    pub data: Option<Value>,
    /// Processes this handler caused.
    pub related: Option<Vec<Uuid>>,
}

impl HandlerResult {
    /// No feedback, data or related processes.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Feedback only.
    pub fn feedback(text: impl Into<String>) -> Self {
        Self {
            feedback: Some(text.into()),
            ..Self::default()
        }
    }

    /// Attach a payload for the process `data` list.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Attach ids of processes this handler caused.
    pub fn with_related(mut self, related: impl IntoIterator<Item = Uuid>) -> Self {
        self.related = Some(related.into_iter().collect());
        self
    }

    /// Feedback text for an arbitrary JSON value.
    ///
    /// Scalars become their plain string form, arrays and objects their JSON
    /// text, and `null` no feedback at all.
    pub fn normalize(value: &Value) -> Option<String> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Array(_) | Value::Object(_) => Some(value.to_string()),
        }
    }
}

impl From<()> for HandlerResult {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}

impl From<String> for HandlerResult {
    fn from(text: String) -> Self {
        Self::feedback(text)
    }
}

impl From<&str> for HandlerResult {
    fn from(text: &str) -> Self {
        Self::feedback(text)
    }
}

impl From<bool> for HandlerResult {
    fn from(flag: bool) -> Self {
        Self::feedback(flag.to_string())
    }
}

macro_rules! numeric_feedback {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for HandlerResult {
                fn from(n: $ty) -> Self {
                    Self::feedback(n.to_string())
                }
            }
        )*
    };
}

numeric_feedback!(i32, i64, u32, u64, usize, f64);

impl From<Value> for HandlerResult {
    fn from(value: Value) -> Self {
        Self {
            feedback: Self::normalize(&value),
            ..Self::default()
        }
    }
}

impl<T: Into<HandlerResult>> From<Option<T>> for HandlerResult {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or_default()
    }
}
