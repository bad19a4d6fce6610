//! Batch scheduler engine — gates, orders, batches, and flushes events.
//!
//! One scheduler serves one logging context. Appends take an order ticket
//! the moment they are submitted, wait for the init gate, run their
//! processing function, then commit strictly in ticket order. Committed
//! events land in the [`BatchQueue`]; a flush happens when the threshold is
//! reached, when the interval window elapses, or on a lifecycle signal.
//!
//! Sinks run on the committing caller's stack with the state lock released.
//! A sink must not call back into its own scheduler.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use taplog_core::{BatchPolicy, FlushReason, InitFailurePolicy, Result, TaplogError};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::gate::{GateState, InitGate};
use crate::lifecycle::{LifecycleSignals, Signal, Subscription};
use crate::queue::BatchQueue;
use crate::sink::{Batch, FlushSink};

/// Scheduler phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Init has not settled; nothing is appended and the timer is disarmed.
    Gated,
    /// Accepting appends.
    Idle,
    /// Shut down. Terminal.
    Terminated,
}

/// Point-in-time counters for one scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub phase: Phase,
    pub pending: usize,
    /// Processed events waiting on an earlier, still-running submission.
    pub parked: usize,
    pub timer_armed: bool,
    pub flushes: u64,
    pub events_flushed: u64,
    pub sink_failures: u64,
}

struct State<T> {
    queue: BatchQueue<T>,
    phase: Phase,
    timer_armed: bool,
    window_start: Instant,
    next_commit: u64,
    parked: BTreeMap<u64, Option<T>>,
    flushes: u64,
    events_flushed: u64,
}

struct Inner<T> {
    id: String,
    policy: BatchPolicy,
    on_init_failure: InitFailurePolicy,
    gate: InitGate,
    sink: Box<dyn FlushSink<T>>,
    state: Mutex<State<T>>,
    /// Held from drain to sink return so batches reach the sink in drain order.
    delivery: Mutex<()>,
    reset: Arc<Notify>,
    closed: watch::Sender<bool>,
    next_ticket: AtomicU64,
    sink_failures: AtomicU64,
    timer: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<Subscription>>,
}

/// Handle to a batch scheduler. Clones share the same queue and timer.
///
/// Dropping the last handle tears the scheduler down like an unmount.
pub struct BatchScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for BatchScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> BatchScheduler<T> {
    /// Create a scheduler and start its gate watcher / interval timer.
    /// Must be called inside a tokio runtime.
    pub fn new<S>(policy: BatchPolicy, gate: InitGate, sink: S) -> Result<Self>
    where
        S: FlushSink<T> + 'static,
    {
        Self::build(policy, InitFailurePolicy::default(), gate, sink, None)
    }

    /// Like [`BatchScheduler::new`], also subscribing to `signals` so that
    /// `Unmount` and `PageClosing` shut the scheduler down.
    pub fn with_lifecycle<S>(
        policy: BatchPolicy,
        gate: InitGate,
        sink: S,
        signals: &LifecycleSignals,
    ) -> Result<Self>
    where
        S: FlushSink<T> + 'static,
    {
        Self::build(policy, InitFailurePolicy::default(), gate, sink, Some(signals))
    }

    pub(crate) fn build<S>(
        policy: BatchPolicy,
        on_init_failure: InitFailurePolicy,
        gate: InitGate,
        sink: S,
        signals: Option<&LifecycleSignals>,
    ) -> Result<Self>
    where
        S: FlushSink<T> + 'static,
    {
        policy.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TaplogError::config("BatchScheduler must be created inside a tokio runtime")
        })?;

        let id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let (closed, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            id,
            on_init_failure,
            gate: gate.clone(),
            sink: Box::new(sink),
            state: Mutex::new(State {
                queue: BatchQueue::new(&policy),
                phase: Phase::Gated,
                timer_armed: false,
                window_start: Instant::now(),
                next_commit: 0,
                parked: BTreeMap::new(),
                flushes: 0,
                events_flushed: 0,
            }),
            policy,
            delivery: Mutex::new(()),
            reset: Arc::new(Notify::new()),
            closed,
            next_ticket: AtomicU64::new(0),
            sink_failures: AtomicU64::new(0),
            timer: Mutex::new(None),
            subscription: Mutex::new(None),
        });

        if let Some(signals) = signals {
            let weak = Arc::downgrade(&inner);
            let sub = signals.subscribe(move |signal| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_signal(signal);
                }
            });
            *lock(&inner.subscription) = Some(sub);
        }

        let handle = runtime.spawn(run_timer(
            Arc::downgrade(&inner),
            gate,
            inner.reset.clone(),
            inner.policy.interval(),
        ));
        *lock(&inner.timer) = Some(handle);

        tracing::info!(
            "🗂️ [{}] Scheduler created (enabled={}, threshold={}, interval={}ms)",
            inner.id,
            inner.policy.enabled,
            inner.policy.threshold_size,
            inner.policy.interval_ms
        );
        Ok(Self { inner })
    }

    /// Submit one event for processing.
    ///
    /// The call order of `submit` is the order events reach the sink, no
    /// matter when each `process` future completes. The returned future
    /// waits for the init gate, runs `process`, and commits its output; it
    /// resolves with the processing error if `process` fails, in which case
    /// nothing is appended. Every returned future must be driven or
    /// dropped: an undriven one holds back later events.
    pub fn submit<P, Fut>(&self, process: P) -> impl Future<Output = Result<()>> + Send + 'static
    where
        P: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let ticket = Ticket::take(self.inner.clone());
        async move {
            if ticket.inner.is_closed() {
                return Err(TaplogError::Closed);
            }
            ticket.inner.pass_gate().await?;
            let event = process().await?;
            ticket.commit(event)
        }
    }

    /// Append an already processed event, with the same gating and ordering
    /// as [`BatchScheduler::submit`].
    pub fn append(&self, event: T) -> impl Future<Output = Result<()>> + Send + 'static {
        self.submit(move || async move { Ok(event) })
    }
}

impl<T> BatchScheduler<T> {
    /// Flush pending events now if the timer is armed. Returns the count flushed.
    pub fn on_interval_tick(&self) -> usize {
        let state = self.inner.lock_state();
        self.inner.tick(state)
    }

    /// Drain and deliver everything pending, without terminating.
    /// An empty queue never reaches the sink.
    pub fn force_flush(&self, unloading: bool) -> usize {
        let reason = if unloading {
            FlushReason::PageClosing
        } else {
            FlushReason::Manual
        };
        self.inner.flush_pending(reason)
    }

    /// Cancel the timer, flush everything, and terminate. Idempotent.
    pub fn shutdown(&self, unloading: bool) -> usize {
        let reason = if unloading {
            FlushReason::PageClosing
        } else {
            FlushReason::Unmount
        };
        self.inner.shutdown(reason)
    }

    /// Owning context torn down.
    pub fn unmount(&self) -> usize {
        self.shutdown(false)
    }

    /// Page or process closing.
    pub fn page_closing(&self) -> usize {
        self.shutdown(true)
    }

    pub fn phase(&self) -> Phase {
        self.inner.lock_state().phase
    }

    pub fn pending(&self) -> usize {
        self.inner.lock_state().queue.len()
    }

    pub fn gate(&self) -> &InitGate {
        &self.inner.gate
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.inner.policy
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.lock_state();
        SchedulerStats {
            phase: state.phase,
            pending: state.queue.len(),
            parked: state.parked.values().filter(|e| e.is_some()).count(),
            timer_armed: state.timer_armed,
            flushes: state.flushes,
            events_flushed: state.events_flushed,
            sink_failures: self.inner.sink_failures.load(Ordering::Relaxed),
        }
    }
}

impl<T> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State<T>> {
        lock(&self.state)
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait for init, or for shutdown, whichever comes first.
    async fn pass_gate(&self) -> Result<()> {
        let outcome = tokio::select! {
            outcome = self.gate.wait() => outcome,
            _ = wait_closed(self.closed.subscribe()) => return Err(TaplogError::Closed),
        };
        if self.settle(outcome.clone()) {
            return Ok(());
        }
        if self.is_closed() {
            return Err(TaplogError::Closed);
        }
        match outcome {
            GateState::Failed(reason) => Err(TaplogError::InitFailed(reason)),
            _ => Err(TaplogError::Closed),
        }
    }

    /// Apply the gate outcome. Returns true when appends may proceed.
    fn settle(&self, outcome: GateState) -> bool {
        let proceed = match &outcome {
            GateState::Ready => true,
            GateState::Failed(_) => self.on_init_failure == InitFailurePolicy::Proceed,
            GateState::Pending => false,
        };
        let mut state = self.lock_state();
        match state.phase {
            Phase::Terminated => return false,
            Phase::Idle => return true,
            Phase::Gated if !proceed => return false,
            Phase::Gated => {}
        }
        state.phase = Phase::Idle;
        if self.policy.enabled {
            state.timer_armed = true;
            state.window_start = Instant::now();
        }
        drop(state);
        if let GateState::Failed(reason) = outcome {
            tracing::warn!("⚠️ [{}] Init failed ({reason}), proceeding anyway", self.id);
        }
        tracing::debug!("⏱️ [{}] Gate open, interval timer armed", self.id);
        self.reset.notify_one();
        true
    }

    fn commit(&self, ticket: u64, event: Option<T>) -> Result<()> {
        let mut state = self.lock_state();
        if state.phase == Phase::Terminated {
            return Err(TaplogError::Closed);
        }
        state.parked.insert(ticket, event);

        let reason = if self.policy.enabled {
            FlushReason::Threshold
        } else {
            FlushReason::Immediate
        };
        let mut batches = Vec::new();
        loop {
            let next = state.next_commit;
            let Some(entry) = state.parked.remove(&next) else {
                break;
            };
            state.next_commit += 1;
            if let Some(event) = entry {
                if let Some(batch) = state.queue.push(event) {
                    batches.push((batch, reason));
                }
            }
        }
        tracing::debug!(
            "📥 [{}] Ticket {} committed (pending: {}, parked: {})",
            self.id,
            ticket,
            state.queue.len(),
            state.parked.len()
        );
        self.deliver(state, batches);
        Ok(())
    }

    fn tick(&self, mut state: MutexGuard<'_, State<T>>) -> usize {
        if state.phase != Phase::Idle || !state.timer_armed {
            return 0;
        }
        state.window_start = Instant::now();
        if state.queue.is_empty() {
            tracing::debug!("⏱️ [{}] Interval tick, nothing pending", self.id);
            return 0;
        }
        let events = state.queue.drain();
        let count = events.len();
        self.deliver(state, vec![(events, FlushReason::Interval)]);
        count
    }

    fn tick_if_due(&self, interval: Duration) -> usize {
        let state = self.lock_state();
        if Instant::now() < state.window_start + interval {
            // Window was reset by a flush while the timer slept
            return 0;
        }
        self.tick(state)
    }

    fn flush_pending(&self, reason: FlushReason) -> usize {
        let mut state = self.lock_state();
        let events = state.queue.drain();
        let count = events.len();
        if count > 0 {
            self.deliver(state, vec![(events, reason)]);
        }
        count
    }

    fn on_signal(&self, signal: Signal) {
        let reason = match signal {
            Signal::Unmount => FlushReason::Unmount,
            Signal::PageClosing => FlushReason::PageClosing,
        };
        self.shutdown(reason);
    }

    fn shutdown(&self, reason: FlushReason) -> usize {
        let mut state = self.lock_state();
        if state.phase == Phase::Terminated {
            tracing::debug!("[{}] Shutdown ignored, already terminated", self.id);
            return 0;
        }
        state.phase = Phase::Terminated;
        state.timer_armed = false;
        self.closed.send_replace(true);

        if let Some(timer) = lock(&self.timer).take() {
            timer.abort();
        }
        let subscription = lock(&self.subscription).take();

        // Processed events parked behind a still-running submission go out
        // too, after everything already committed.
        let parked = std::mem::take(&mut state.parked);
        let mut events = state.queue.drain();
        events.extend(parked.into_values().flatten());
        let count = events.len();

        tracing::info!(
            "🛑 [{}] Scheduler terminated ({}), flushing {} events",
            self.id,
            reason,
            count
        );
        if count > 0 {
            self.deliver(state, vec![(events, reason)]);
        } else {
            drop(state);
        }
        drop(subscription);
        count
    }

    /// Hand drained batches to the sink, in order, outside the state lock.
    fn deliver(&self, mut state: MutexGuard<'_, State<T>>, batches: Vec<(Vec<T>, FlushReason)>) {
        if batches.is_empty() {
            return;
        }
        for (events, _) in &batches {
            state.flushes += 1;
            state.events_flushed += events.len() as u64;
        }
        state.window_start = Instant::now();

        let _delivery = lock(&self.delivery);
        drop(state);
        self.reset.notify_one();

        for (events, reason) in batches {
            self.invoke_sink(events, reason);
        }
    }

    fn invoke_sink(&self, events: Vec<T>, reason: FlushReason) {
        let batch = Batch::new(events, reason);
        let count = batch.len();
        tracing::info!(
            "📤 [{}] Flushing {} events ({}, unloading={})",
            self.id,
            count,
            reason,
            batch.unloading
        );

        let result =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.sink.flush_batch(batch)));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("⚠️ [{}] Flush sink failed for {} events: {e}", self.id, count);
            }
            Err(panic) => {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".into());
                tracing::error!("💥 [{}] Flush sink panicked: {msg}", self.id);
            }
        }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.shutdown(FlushReason::Unmount);
    }
}

/// Order slot for one submission. Released as a no-op if dropped uncommitted.
struct Ticket<T> {
    inner: Arc<Inner<T>>,
    number: u64,
    done: bool,
}

impl<T> Ticket<T> {
    fn take(inner: Arc<Inner<T>>) -> Self {
        let number = inner.next_ticket.fetch_add(1, Ordering::SeqCst);
        Self {
            inner,
            number,
            done: false,
        }
    }

    fn commit(mut self, event: T) -> Result<()> {
        self.done = true;
        self.inner.commit(self.number, Some(event))
    }
}

impl<T> Drop for Ticket<T> {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.inner.commit(self.number, None);
        }
    }
}

/// Gate watcher and interval timer. Holds only a weak handle so the
/// scheduler can be dropped while the timer sleeps.
async fn run_timer<T: Send + 'static>(
    weak: Weak<Inner<T>>,
    gate: InitGate,
    reset: Arc<Notify>,
    interval: Duration,
) {
    let outcome = gate.wait().await;
    {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.settle(outcome) || !inner.policy.enabled {
            return;
        }
    }

    loop {
        let deadline = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let state = inner.lock_state();
            if state.phase == Phase::Terminated {
                return;
            }
            state.window_start + interval
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.tick_if_due(interval);
            }
            _ = reset.notified() => {}
        }
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    let _ = closed.wait_for(|c| *c).await;
}

fn lock<M>(mutex: &Mutex<M>) -> MutexGuard<'_, M> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
