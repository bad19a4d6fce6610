//! Event capture — the `Logger` front end.
//!
//! Maps event types ("click", "page_view", ...) to processing functions and
//! feeds their output through a [`BatchScheduler`]. A report waits for the
//! init gate before its handler runs; handler failures come back to the
//! caller of `report` and never reach the queue.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use taplog_core::{
    BatchPolicy, InitConfig, LogContext, ReportedEvent, Result, TaplogConfig, TaplogError,
};
use tokio::task::JoinHandle;

use crate::engine::{BatchScheduler, SchedulerStats};
use crate::gate::InitGate;
use crate::lifecycle::LifecycleSignals;
use crate::sink::FlushSink;

pub const CLICK: &str = "click";
pub const PAGE_VIEW: &str = "page_view";

/// Per-event-type processing function.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Turn raw params into the reported event.
    ///
    /// `context` is the logger's shared context: read it with `get()`, and
    /// `set()`/`merge()` changes are visible to every later report.
    async fn process(&self, params: Value, context: LogContext) -> Result<ReportedEvent>;
}

/// Handler backed by an async closure.
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `|params, context| async { ... }` as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Value, LogContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReportedEvent>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> EventHandler for HandlerFn<F>
where
    F: Fn(Value, LogContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ReportedEvent>> + Send + 'static,
{
    async fn process(&self, params: Value, context: LogContext) -> Result<ReportedEvent> {
        (self.f)(params, context).await
    }
}

type InitAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Builder for [`Logger`].
pub struct LoggerBuilder {
    init: Option<InitAction>,
    init_config: InitConfig,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    context: Value,
    policy: BatchPolicy,
    sink: Option<Box<dyn FlushSink<ReportedEvent>>>,
    signals: Option<LifecycleSignals>,
}

impl Default for LoggerBuilder {
    fn default() -> Self {
        Self {
            init: None,
            init_config: InitConfig::default(),
            handlers: HashMap::new(),
            context: Value::Object(Default::default()),
            policy: BatchPolicy::default(),
            sink: None,
            signals: None,
        }
    }
}

impl LoggerBuilder {
    /// Take batch policy and init settings from a loaded config.
    pub fn config(mut self, config: &TaplogConfig) -> Self {
        self.policy = config.batch.clone();
        self.init_config = config.init.clone();
        self
    }

    /// One-time init action; reports wait until it settles.
    pub fn init<F, Fut>(mut self, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.init = Some(Box::new(move || action().boxed()));
        self
    }

    pub fn init_config(mut self, init_config: InitConfig) -> Self {
        self.init_config = init_config;
        self
    }

    /// Register the processing function for `event_type`. A later
    /// registration for the same type replaces the earlier one.
    pub fn handler<H>(mut self, event_type: impl Into<String>, handler: H) -> Self
    where
        H: EventHandler + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
        self
    }

    /// Initial reporting context.
    pub fn context(mut self, initial: Value) -> Self {
        self.context = initial;
        self
    }

    pub fn policy(mut self, policy: BatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: FlushSink<ReportedEvent> + 'static,
    {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Shut down on `Unmount` / `PageClosing` emitted on `signals`.
    pub fn lifecycle(mut self, signals: &LifecycleSignals) -> Self {
        self.signals = Some(signals.clone());
        self
    }

    /// Start the init action and the scheduler. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Logger> {
        let sink = self
            .sink
            .ok_or_else(|| TaplogError::config("a flush sink is required"))?;
        self.policy.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|_| TaplogError::config("Logger must be built inside a tokio runtime"))?;

        let gate = match self.init {
            Some(action) => InitGate::spawn_with_timeout(action(), self.init_config.timeout()),
            None => InitGate::ready(),
        };
        let scheduler = BatchScheduler::build(
            self.policy,
            self.init_config.on_failure,
            gate,
            sink,
            self.signals.as_ref(),
        )?;

        tracing::info!(
            "🧭 Logger ready with {} event types: {:?}",
            self.handlers.len(),
            self.handlers.keys().collect::<Vec<_>>()
        );
        Ok(Logger {
            handlers: self.handlers,
            context: LogContext::new(self.context),
            scheduler,
        })
    }
}

/// Instrumentation entry point for one logging context.
pub struct Logger {
    handlers: HashMap<String, Arc<dyn EventHandler>>,
    context: LogContext,
    scheduler: BatchScheduler<ReportedEvent>,
}

impl Logger {
    pub fn builder() -> LoggerBuilder {
        LoggerBuilder::default()
    }

    /// Report one event.
    ///
    /// Call order is preserved all the way to the sink. The future resolves
    /// once the handler ran and its output was accepted, or with the
    /// handler's error.
    pub fn report(&self, event_type: &str, params: Value) -> BoxFuture<'static, Result<()>> {
        let Some(handler) = self.handlers.get(event_type).cloned() else {
            return futures::future::ready(Err(TaplogError::UnknownEventType(
                event_type.to_string(),
            )))
            .boxed();
        };
        let context = self.context.clone();
        let event_type = event_type.to_string();

        self.scheduler
            .submit(move || async move {
                tracing::debug!("🖱️ Processing '{}' event", event_type);
                handler
                    .process(params, context)
                    .await
                    .map_err(|e| match e {
                        e @ TaplogError::Handler { .. } => e,
                        other => TaplogError::handler(event_type, other.to_string()),
                    })
            })
            .boxed()
    }

    /// Fire-and-forget variant of [`Logger::report`]. Order is fixed at call
    /// time; failures are logged.
    pub fn spawn_report(&self, event_type: &str, params: Value) -> JoinHandle<Result<()>> {
        let event_type_owned = event_type.to_string();
        let report = self.report(event_type, params);
        tokio::spawn(async move {
            let result = report.await;
            if let Err(e) = &result {
                tracing::warn!("⚠️ Report '{}' failed: {e}", event_type_owned);
            }
            result
        })
    }

    pub fn click(&self, params: Value) -> BoxFuture<'static, Result<()>> {
        self.report(CLICK, params)
    }

    pub fn page_view(&self, params: Value) -> BoxFuture<'static, Result<()>> {
        self.report(PAGE_VIEW, params)
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    pub fn scheduler(&self) -> &BatchScheduler<ReportedEvent> {
        &self.scheduler
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Deliver whatever is pending without shutting down.
    pub fn flush(&self) -> usize {
        self.scheduler.force_flush(false)
    }

    pub fn unmount(&self) -> usize {
        self.scheduler.unmount()
    }

    pub fn page_closing(&self) -> usize {
        self.scheduler.page_closing()
    }

    pub fn shutdown(&self, unloading: bool) -> usize {
        self.scheduler.shutdown(unloading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::sink_fn;
    use taplog_core::InitFailurePolicy;
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
    const EPS: Duration = Duration::from_millis(10);

    type Flushed = Arc<Mutex<Vec<(Vec<Value>, bool)>>>;

    fn recording_sink() -> (Flushed, impl FlushSink<Value>) {
        let flushed: Flushed = Arc::new(Mutex::new(Vec::new()));
        let log = flushed.clone();
        let sink = sink_fn(move |events: Vec<Value>, unloading| {
            log.lock().unwrap().push((events, unloading));
            Ok(())
        });
        (flushed, sink)
    }

    fn echo() -> impl EventHandler {
        handler_fn(|params, _ctx| async move { Ok(params) })
    }

    fn builder(sink: impl FlushSink<Value> + 'static) -> LoggerBuilder {
        Logger::builder()
            .policy(BatchPolicy::new(5, FLUSH_INTERVAL))
            .handler(CLICK, echo())
            .sink(sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_clicks_flush_once() {
        let (flushed, sink) = recording_sink();
        let logger = builder(sink).build().unwrap();
        let params = json!({"a": 1});

        logger.click(params.clone()).await.unwrap();
        assert!(flushed.lock().unwrap().is_empty());
        for _ in 0..4 {
            logger.click(params.clone()).await.unwrap();
        }
        assert_eq!(*flushed.lock().unwrap(), vec![(vec![params; 5], false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flush() {
        let (flushed, sink) = recording_sink();
        let logger = builder(sink).build().unwrap();
        for _ in 0..3 {
            logger.click(json!({"a": 1})).await.unwrap();
        }
        assert!(flushed.lock().unwrap().is_empty());

        sleep(FLUSH_INTERVAL + EPS).await;
        assert_eq!(*flushed.lock().unwrap(), vec![(vec![json!({"a": 1}); 3], false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmount_and_browser_close() {
        let signals = LifecycleSignals::new();
        let (flushed, sink) = recording_sink();
        let logger = builder(sink).lifecycle(&signals).build().unwrap();
        logger.click(json!({"a": 1})).await.unwrap();
        logger.click(json!({"a": 1})).await.unwrap();

        signals.unmount();
        assert_eq!(*flushed.lock().unwrap(), vec![(vec![json!({"a": 1}); 2], false)]);

        let (flushed, sink) = recording_sink();
        let logger = builder(sink).lifecycle(&signals).build().unwrap();
        logger.click(json!({"a": 1})).await.unwrap();
        logger.click(json!({"a": 1})).await.unwrap();

        signals.page_closing();
        assert_eq!(*flushed.lock().unwrap(), vec![(vec![json!({"a": 1}); 2], true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_wait_for_init() {
        let (flushed, sink) = recording_sink();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        let logger = builder(sink)
            .init(|| async {
                sleep(Duration::from_millis(300)).await;
                Ok(())
            })
            .handler(
                CLICK,
                handler_fn(move |params, _ctx| {
                    counted.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(params) }
                }),
            )
            .build()
            .unwrap();

        logger.spawn_report(CLICK, json!({"a": 1}));
        logger.spawn_report(CLICK, json!({"a": 1}));
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(300) + EPS).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(flushed.lock().unwrap().is_empty());

        sleep(FLUSH_INTERVAL).await;
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_view_then_click_keep_call_order() {
        let (flushed, sink) = recording_sink();
        let logger = Logger::builder()
            .policy(BatchPolicy::new(2, FLUSH_INTERVAL))
            .handler(
                PAGE_VIEW,
                handler_fn(|params, _ctx| async move {
                    sleep(Duration::from_millis(1000)).await;
                    Ok(json!({"page_view": params}))
                }),
            )
            .handler(
                CLICK,
                handler_fn(|params, _ctx| async move {
                    sleep(Duration::from_millis(500)).await;
                    Ok(json!({"click": params}))
                }),
            )
            .sink(sink)
            .build()
            .unwrap();

        let view = logger.spawn_report(PAGE_VIEW, json!({"a": 1}));
        let click = logger.spawn_report(CLICK, json!({"b": 1}));
        click.await.unwrap().unwrap();
        view.await.unwrap().unwrap();

        assert_eq!(
            *flushed.lock().unwrap(),
            vec![(
                vec![json!({"page_view": {"a": 1}}), json!({"click": {"b": 1}})],
                false
            )]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_reaches_handler() {
        let (flushed, sink) = recording_sink();
        let logger = builder(sink)
            .context(json!({"user": "u1"}))
            .handler(
                CLICK,
                handler_fn(|params, ctx: LogContext| async move {
                    Ok(json!({"params": params, "ctx": ctx.get()}))
                }),
            )
            .build()
            .unwrap();

        logger.context().merge(json!({"screen": "home"}));
        logger.click(json!({"a": 1})).await.unwrap();
        logger.flush();

        let flushed = flushed.lock().unwrap();
        assert_eq!(
            flushed[0].0[0],
            json!({"params": {"a": 1}, "ctx": {"user": "u1", "screen": "home"}})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_updates_shared_context() {
        let (flushed, sink) = recording_sink();
        let logger = builder(sink)
            .handler(
                PAGE_VIEW,
                handler_fn(|params: Value, ctx: LogContext| async move {
                    ctx.merge(json!({"screen": params["screen"].clone()}));
                    Ok(json!({"page_view": params}))
                }),
            )
            .handler(
                CLICK,
                handler_fn(|params, ctx: LogContext| async move {
                    Ok(json!({"click": params, "ctx": ctx.get()}))
                }),
            )
            .build()
            .unwrap();

        logger.page_view(json!({"screen": "cart"})).await.unwrap();
        logger.click(json!({"b": 1})).await.unwrap();
        assert_eq!(logger.context().get(), json!({"screen": "cart"}));

        logger.flush();
        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed[0].0[1], json!({"click": {"b": 1}, "ctx": {"screen": "cart"}}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_policy_from_config() {
        let (flushed, sink) = recording_sink();
        let mut config = TaplogConfig::default();
        config.batch.threshold_size = 2;
        let logger = Logger::builder()
            .config(&config)
            .handler(CLICK, echo())
            .sink(sink)
            .build()
            .unwrap();
        assert_eq!(logger.scheduler().policy().threshold_size, 2);

        logger.click(json!({"a": 1})).await.unwrap();
        logger.click(json!({"a": 2})).await.unwrap();
        assert_eq!(
            *flushed.lock().unwrap(),
            vec![(vec![json!({"a": 1}), json!({"a": 2})], false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_timeout_rejects_reports() {
        let (flushed, sink) = recording_sink();
        let mut config = TaplogConfig::default();
        config.init = InitConfig {
            on_failure: InitFailurePolicy::Reject,
            timeout_ms: Some(100),
        };
        let logger = builder(sink)
            .config(&config)
            .init(|| async {
                sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .build()
            .unwrap();

        let err = logger.click(json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, TaplogError::InitFailed(reason) if reason.contains("timed out")));
        assert_eq!(logger.stats().pending, 0);

        sleep(FLUSH_INTERVAL * 2).await;
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[test]
    fn test_build_with_init_outside_runtime_errors() {
        let (_flushed, sink) = recording_sink();
        let result = builder(sink).init(|| async { Ok(()) }).build();
        assert!(matches!(result, Err(TaplogError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_event_type() {
        let (_flushed, sink) = recording_sink();
        let logger = builder(sink).build().unwrap();
        let err = logger.page_view(json!({})).await.unwrap_err();
        assert!(matches!(err, TaplogError::UnknownEventType(t) if t == PAGE_VIEW));
        assert_eq!(logger.event_types(), vec![CLICK]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_error_is_wrapped_and_not_queued() {
        let (_flushed, sink) = recording_sink();
        let logger = builder(sink)
            .handler(
                CLICK,
                handler_fn(|_params, _ctx| async {
                    Err(TaplogError::Other("bad params".into()))
                }),
            )
            .build()
            .unwrap();

        match logger.click(json!({})).await {
            Err(TaplogError::Handler { event_type, message }) => {
                assert_eq!(event_type, CLICK);
                assert!(message.contains("bad params"));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(logger.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_build_requires_sink() {
        let result = Logger::builder().handler(CLICK, echo()).build();
        assert!(matches!(result, Err(TaplogError::Config(_))));
    }
}
