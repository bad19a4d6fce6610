//! # Taplog Core
//!
//! Shared error type, configuration, and event types used by every Taplog crate.

pub mod config;
pub mod error;
pub mod types;

pub use config::{BatchPolicy, InitConfig, InitFailurePolicy, SinkConfig, SinkKind, TaplogConfig};
pub use error::{Result, TaplogError};
pub use types::{FlushReason, LogContext, ReportedEvent};
