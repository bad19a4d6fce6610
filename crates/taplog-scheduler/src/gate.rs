//! Init gate — one-time, possibly async, initialization that every
//! append and the interval timer wait on.
//!
//! Settlement is published on a `watch` channel so any number of waiters
//! (queued reports, the timer task) observe the same outcome.

use std::future::Future;
use std::time::Duration;

use taplog_core::{Result, TaplogError};
use tokio::sync::watch;

/// Outcome of the init action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Ready,
    Failed(String),
}

impl GateState {
    pub fn is_settled(&self) -> bool {
        !matches!(self, GateState::Pending)
    }
}

/// Read side of the gate. Cheap to clone.
#[derive(Debug, Clone)]
pub struct InitGate {
    rx: watch::Receiver<GateState>,
}

/// Write side of a manually driven gate.
#[derive(Debug)]
pub struct GateOpener {
    tx: watch::Sender<GateState>,
}

impl GateOpener {
    /// Settle the gate. Only the first call has any effect.
    pub fn settle(&self, outcome: Result<()>) {
        let state = match outcome {
            Ok(()) => GateState::Ready,
            Err(e) => GateState::Failed(e.to_string()),
        };
        let changed = self.tx.send_if_modified(|current| {
            if current.is_settled() {
                return false;
            }
            *current = state.clone();
            true
        });
        if !changed {
            return;
        }
        match state {
            GateState::Failed(reason) => tracing::error!("❌ Init action failed: {reason}"),
            _ => tracing::info!("🚦 Init settled, gate open"),
        }
    }

    pub fn open(&self) {
        self.settle(Ok(()));
    }
}

impl InitGate {
    /// Gate that is open from the start (no init action configured).
    pub fn ready() -> Self {
        let (_tx, rx) = watch::channel(GateState::Ready);
        Self { rx }
    }

    /// Pending gate settled by the returned opener.
    pub fn manual() -> (GateOpener, Self) {
        let (tx, rx) = watch::channel(GateState::Pending);
        (GateOpener { tx }, Self { rx })
    }

    /// Run `action` on the current tokio runtime and settle when it finishes.
    pub fn spawn<F>(action: F) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        Self::spawn_with_timeout(action, None)
    }

    /// Like [`InitGate::spawn`], but an action still running after `timeout`
    /// settles the gate as failed.
    pub fn spawn_with_timeout<F>(action: F, timeout: Option<Duration>) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (opener, gate) = Self::manual();
        tokio::spawn(async move {
            let outcome = match timeout {
                Some(limit) => tokio::time::timeout(limit, action)
                    .await
                    .unwrap_or_else(|_| {
                        Err(TaplogError::InitFailed(format!(
                            "init timed out after {}ms",
                            limit.as_millis()
                        )))
                    }),
                None => action.await,
            };
            opener.settle(outcome);
        });
        gate
    }

    /// Current state without waiting.
    pub fn state(&self) -> GateState {
        self.rx.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.rx.borrow().is_settled()
    }

    /// Wait until the gate settles. Never returns `Pending`.
    ///
    /// An opener dropped before settling (e.g. the init task panicked)
    /// counts as a failure.
    pub async fn wait(&self) -> GateState {
        let mut rx = self.rx.clone();
        match rx.wait_for(GateState::is_settled).await {
            Ok(state) => state.clone(),
            Err(_) => GateState::Failed("init action aborted before settling".into()),
        }
    }
}
