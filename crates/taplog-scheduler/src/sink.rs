//! Flush sinks: where drained batches go.
//!
//! The scheduler hands each sink an owned snapshot and never waits on,
//! retries, or re-queues a delivery. Sinks that do I/O should hand off
//! quickly (channel, spawned task) since they run on the caller's stack.

use chrono::{DateTime, Utc};
use serde::Serialize;
use taplog_core::{FlushReason, Result, TaplogError};
use tokio::sync::mpsc;

/// One delivered batch.
#[derive(Debug, Clone, Serialize)]
pub struct Batch<T> {
    pub events: Vec<T>,
    /// True only when the page/process is closing.
    pub unloading: bool,
    pub reason: FlushReason,
    pub flushed_at: DateTime<Utc>,
}

impl<T> Batch<T> {
    pub fn new(events: Vec<T>, reason: FlushReason) -> Self {
        Self {
            events,
            unloading: reason.is_unloading(),
            reason,
            flushed_at: Utc::now(),
        }
    }

    /// Batch built from a bare `(events, unloading)` call, where the real
    /// trigger is unknown.
    pub(crate) fn from_flag(events: Vec<T>, unloading: bool) -> Self {
        let reason = if unloading {
            FlushReason::PageClosing
        } else {
            FlushReason::Unmount
        };
        Self::new(events, reason)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// User-supplied destination for flushed events.
pub trait FlushSink<T>: Send + Sync {
    /// Deliver `events` in append order.
    fn flush(&self, events: Vec<T>, unloading: bool) -> Result<()>;

    /// Entry point used by the scheduler. Override to see the flush reason.
    fn flush_batch(&self, batch: Batch<T>) -> Result<()> {
        self.flush(batch.events, batch.unloading)
    }
}

impl<T, S> FlushSink<T> for Box<S>
where
    S: FlushSink<T> + ?Sized,
{
    fn flush(&self, events: Vec<T>, unloading: bool) -> Result<()> {
        (**self).flush(events, unloading)
    }

    fn flush_batch(&self, batch: Batch<T>) -> Result<()> {
        (**self).flush_batch(batch)
    }
}

/// Sink backed by a plain closure.
pub struct FnSink<F> {
    f: F,
}

/// Wrap `|events, unloading| -> Result<()>` as a sink.
pub fn sink_fn<T, F>(f: F) -> FnSink<F>
where
    F: Fn(Vec<T>, bool) -> Result<()> + Send + Sync,
{
    FnSink { f }
}

impl<T, F> FlushSink<T> for FnSink<F>
where
    F: Fn(Vec<T>, bool) -> Result<()> + Send + Sync,
{
    fn flush(&self, events: Vec<T>, unloading: bool) -> Result<()> {
        (self.f)(events, unloading)
    }
}

/// Forwards every batch into an unbounded tokio channel.
pub struct ChannelSink<T> {
    tx: mpsc::UnboundedSender<Batch<T>>,
}

impl<T> ChannelSink<T> {
    pub fn new(tx: mpsc::UnboundedSender<Batch<T>>) -> Self {
        Self { tx }
    }

    /// Sink plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Batch<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl<T: Send> FlushSink<T> for ChannelSink<T> {
    fn flush(&self, events: Vec<T>, unloading: bool) -> Result<()> {
        self.flush_batch(Batch::from_flag(events, unloading))
    }

    fn flush_batch(&self, batch: Batch<T>) -> Result<()> {
        self.tx
            .send(batch)
            .map_err(|_| TaplogError::sink("batch receiver dropped"))
    }
}

/// Prints each batch as one JSON line on stdout.
#[derive(Debug, Default)]
pub struct StdoutSink;

impl<T: Serialize + Send> FlushSink<T> for StdoutSink {
    fn flush(&self, events: Vec<T>, unloading: bool) -> Result<()> {
        let line = serde_json::to_string(&serde_json::json!({
            "events": events,
            "unloading": unloading,
        }))?;
        println!("{line}");
        Ok(())
    }

    fn flush_batch(&self, batch: Batch<T>) -> Result<()> {
        println!("{}", serde_json::to_string(&batch)?);
        Ok(())
    }
}

/// POSTs each batch as JSON to a URL on a spawned task.
///
/// Delivery outcome is only logged. A batch flushed while the runtime is
/// shutting down may never leave the process.
pub struct WebhookSink {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl<T: Serialize + Send> FlushSink<T> for WebhookSink {
    fn flush(&self, events: Vec<T>, unloading: bool) -> Result<()> {
        self.flush_batch(Batch::from_flag(events, unloading))
    }

    fn flush_batch(&self, batch: Batch<T>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| TaplogError::sink(format!("no tokio runtime for webhook: {e}")))?;
        let body = serde_json::to_value(&batch)?;
        let count = batch.len();

        let mut req = self
            .client
            .post(&self.url)
            .json(&body)
            .timeout(std::time::Duration::from_secs(10));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let url = self.url.clone();
        handle.spawn(async move {
            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!("✅ Webhook delivered {} events to {}", count, url);
                }
                Ok(resp) => {
                    tracing::warn!("⚠️ Webhook {} answered {}", url, resp.status());
                }
                Err(e) => {
                    tracing::warn!("⚠️ Webhook send to {} failed: {e}", url);
                }
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_fn_sink_receives_flag() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sink = sink_fn(move |events: Vec<u32>, unloading| {
            seen2.lock().unwrap().push((events, unloading));
            Ok(())
        });

        sink.flush_batch(Batch::new(vec![1, 2], FlushReason::PageClosing)).unwrap();
        sink.flush_batch(Batch::new(vec![3], FlushReason::Threshold)).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![(vec![1, 2], true), (vec![3], false)]);
    }

    #[tokio::test]
    async fn test_channel_sink_keeps_reason() {
        let (sink, mut rx) = ChannelSink::channel();
        sink.flush_batch(Batch::new(vec!["a"], FlushReason::Interval)).unwrap();

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.events, vec!["a"]);
        assert_eq!(batch.reason, FlushReason::Interval);
        assert!(!batch.unloading);
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (sink, rx) = ChannelSink::<u8>::channel();
        drop(rx);
        let err = sink.flush(vec![1], false).unwrap_err();
        assert!(matches!(err, TaplogError::Sink(_)));
    }

    #[test]
    fn test_webhook_without_runtime_errors() {
        let sink = WebhookSink::new("http://127.0.0.1:9/events");
        let result = FlushSink::<u8>::flush(&sink, vec![1], false);
        assert!(matches!(result, Err(TaplogError::Sink(_))));
    }
}
