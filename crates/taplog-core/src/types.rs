//! Shared event and context types.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload produced by a per-event-type processing function.
/// Opaque to the scheduler.
pub type ReportedEvent = Value;

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// Pending count reached the threshold.
    Threshold,
    /// The interval window elapsed with events pending.
    Interval,
    /// Owning context torn down.
    Unmount,
    /// Page or process is closing.
    PageClosing,
    /// Batching disabled: one event per flush.
    Immediate,
    /// Explicit flush that leaves the scheduler running.
    Manual,
}

impl FlushReason {
    /// Value passed to the sink as `unloading`.
    pub fn is_unloading(&self) -> bool {
        matches!(self, FlushReason::PageClosing)
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlushReason::Threshold => write!(f, "threshold"),
            FlushReason::Interval => write!(f, "interval"),
            FlushReason::Unmount => write!(f, "unmount"),
            FlushReason::PageClosing => write!(f, "page-closing"),
            FlushReason::Immediate => write!(f, "immediate"),
            FlushReason::Manual => write!(f, "manual"),
        }
    }
}

/// Reporting context handed to processing functions next to their params.
///
/// Clones share the same underlying value.
#[derive(Debug, Clone, Default)]
pub struct LogContext {
    inner: Arc<RwLock<Value>>,
}

impl LogContext {
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    /// Snapshot of the current context.
    pub fn get(&self) -> Value {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the whole context.
    pub fn set(&self, value: Value) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = value;
    }

    /// Shallow-merge the keys of `patch` into the context.
    /// A non-object context is replaced by the patch.
    pub fn merge(&self, patch: Value) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match (&mut *guard, patch) {
            (Value::Object(current), Value::Object(patch)) => {
                for (key, value) in patch {
                    current.insert(key, value);
                }
            }
            (slot, patch) => {
                tracing::debug!("context is not an object, replacing it");
                *slot = patch;
            }
        }
    }
}
