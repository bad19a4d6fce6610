//! Lifecycle signals — "context unmounted" and "page/process closing".
//!
//! Hosts emit signals on a shared hub; schedulers subscribe at construction
//! and drop their subscription at teardown. Listeners run synchronously on
//! the emitter's stack so a forced flush completes before `emit` returns.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// A host lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// The owning logging context was torn down.
    Unmount,
    /// The page or process is about to close.
    PageClosing,
}

impl Signal {
    /// Value passed to the sink on the resulting forced flush.
    pub fn is_unloading(&self) -> bool {
        matches!(self, Signal::PageClosing)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Unmount => write!(f, "unmount"),
            Signal::PageClosing => write!(f, "page-closing"),
        }
    }
}

type Listener = Arc<dyn Fn(Signal) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(lid, _)| *lid != id);
    }
}

/// Signal hub shared between the host and its schedulers.
#[derive(Clone, Default)]
pub struct LifecycleSignals {
    registry: Arc<Registry>,
}

impl LifecycleSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. It stays registered until the returned
    /// subscription is cancelled or dropped.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Signal) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver `signal` to every current listener, in subscription order.
    /// Returns how many listeners ran.
    pub fn emit(&self, signal: Signal) -> usize {
        // Snapshot so listeners may unsubscribe while being called
        let listeners: Vec<Listener> = self
            .registry
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        tracing::info!("📡 Lifecycle signal '{}' → {} listeners", signal, listeners.len());
        for listener in &listeners {
            let call = std::panic::AssertUnwindSafe(|| listener(signal));
            let result = std::panic::catch_unwind(call);
            if result.is_err() {
                tracing::error!("💥 Lifecycle listener panicked on '{}'", signal);
            }
        }
        listeners.len()
    }

    pub fn unmount(&self) -> usize {
        self.emit(Signal::Unmount)
    }

    pub fn page_closing(&self) -> usize {
        self.emit(Signal::PageClosing)
    }

    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl std::fmt::Debug for LifecycleSignals {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleSignals")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle for one registered listener.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Unregister now.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Forward the process interrupt (Ctrl-C) as `PageClosing`.
pub fn spawn_ctrl_c(signals: LifecycleSignals) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("🛑 Interrupt received, closing");
                signals.page_closing();
            }
            Err(e) => tracing::warn!("⚠️ Cannot listen for Ctrl-C: {e}"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_listeners() {
        let signals = LifecycleSignals::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let _sub = signals.subscribe(move |s| seen2.lock().unwrap().push(s));

        assert_eq!(signals.unmount(), 1);
        assert_eq!(signals.page_closing(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![Signal::Unmount, Signal::PageClosing]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let signals = LifecycleSignals::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let sub = signals.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(signals.listener_count(), 1);

        sub.cancel();
        assert_eq!(signals.listener_count(), 0);
        assert_eq!(signals.page_closing(), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let signals = LifecycleSignals::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let _a = signals.subscribe(|_| panic!("listener bug"));
        let _b = signals.subscribe(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(signals.unmount(), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signal_flags() {
        assert!(Signal::PageClosing.is_unloading());
        assert!(!Signal::Unmount.is_unloading());
    }
}
