//! # Taplog Scheduler
//!
//! Batched, ordered delivery of analytics events reported from a UI or
//! any other host that has a "mount / unmount / closing" lifecycle.
//!
//! ## Design Principles
//! - Events reach the sink in the order `report` was called, even when
//!   their processing functions finish out of order
//! - Nothing is processed before the one-time init action settles
//! - Tokio timers only, no work while nothing is pending
//! - Forced flushes on lifecycle signals complete before `emit` returns
//!
//! ## Architecture
//! ```text
//! Logger (capture)
//!   ├── "click"     → EventHandler
//!   ├── "page_view" → EventHandler
//!   └── report() → BatchScheduler (engine)
//!                    ├── InitGate (gate)        — waits for init
//!                    ├── order tickets          — reorder buffer
//!                    ├── BatchQueue (queue)     — threshold drain
//!                    ├── interval timer         — window flush
//!                    └── FlushSink (sink)
//!                          ├── FnSink (closure)
//!                          ├── ChannelSink (mpsc)
//!                          ├── StdoutSink (JSON lines)
//!                          └── WebhookSink (HTTP POST)
//!
//! LifecycleSignals (lifecycle)
//!   ├── Unmount     → shutdown, unloading = false
//!   └── PageClosing → shutdown, unloading = true
//! ```

pub mod capture;
pub mod engine;
pub mod gate;
pub mod lifecycle;
pub mod queue;
pub mod sink;

pub use capture::{EventHandler, HandlerFn, Logger, LoggerBuilder, handler_fn};
pub use engine::{BatchScheduler, Phase, SchedulerStats};
pub use gate::{GateOpener, GateState, InitGate};
pub use lifecycle::{LifecycleSignals, Signal, Subscription, spawn_ctrl_c};
pub use queue::BatchQueue;
pub use sink::{Batch, ChannelSink, FlushSink, FnSink, StdoutSink, WebhookSink, sink_fn};
