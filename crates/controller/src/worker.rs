//! The reconcile loop: one key at a time from the queue, resolved against the mirror.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use refuge_core::Event;
use refuge_kubehub::Informer;
use refuge_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::ProcessError;
use crate::normalize;

pub(crate) struct Worker<I> {
    pub(crate) kind: String,
    pub(crate) queue: WorkQueue<String>,
    pub(crate) informer: Arc<I>,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) max_attempts: u32,
    pub(crate) stop: CancellationToken,
}

/// Releases the in-flight key however processing ends. A panic counts as a failed
/// attempt: the key is re-added through the rate limiter, or forgotten once out of attempts.
struct DoneGuard<'a> {
    queue: &'a WorkQueue<String>,
    key: &'a String,
    max_attempts: u32,
}

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            if self.queue.num_requeues(self.key).saturating_add(1) < self.max_attempts {
                error!(key = %self.key, "panic while processing (will retry)");
                self.queue.add_rate_limited(self.key.clone());
            } else {
                error!(key = %self.key, "panic while processing (giving up)");
                self.queue.forget(self.key);
            }
        }
        self.queue.done(self.key);
    }
}

impl<I: Informer> Worker<I> {
    pub(crate) async fn run(&self) {
        while self.process_next_item().await {}
        debug!(kind = %self.kind, "worker loop finished");
    }

    /// Returns false once the queue is shut down or a stop was requested.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else { return false };
        let _done = DoneGuard { queue: &self.queue, key: &key, max_attempts: self.max_attempts };
        if self.stop.is_cancelled() {
            debug!(key = %key, "stop requested; leaving key unprocessed");
            return false;
        }

        let started = Instant::now();
        match self.process_item(&key).await {
            Ok(()) => self.queue.forget(&key),
            Err(e) => {
                counter!("controller_process_errors_total", 1, "kind" => self.kind.clone());
                // the attempt that just failed is not yet counted in num_requeues
                if self.queue.num_requeues(&key).saturating_add(1) < self.max_attempts {
                    error!(key = %key, error = %e, "error processing (will retry)");
                    self.queue.add_rate_limited(key.clone());
                } else {
                    error!(key = %key, error = %e, "error processing (giving up)");
                    counter!("controller_dropped_keys_total", 1, "kind" => self.kind.clone());
                    self.queue.forget(&key);
                }
            }
        }
        histogram!("controller_process_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.clone());
        true
    }

    async fn process_item(&self, key: &str) -> Result<(), ProcessError> {
        let found = self
            .informer
            .get_by_key(key)
            .map_err(|source| ProcessError::Lookup { key: key.to_string(), source })?;

        let event = match found {
            None => Event::delete(key, self.kind.as_str()),
            Some(obj) => {
                debug!(
                    key = %key,
                    api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("-"),
                    "found object"
                );
                let yaml =
                    normalize::normalize(obj).map_err(|source| ProcessError::Marshal { key: key.to_string(), source })?;
                Event::upsert(key, self.kind.as_str(), yaml)
            }
        };
        self.emit(event).await
    }

    /// Blocking send into the shared sink; a full sink holds the worker back.
    async fn emit(&self, event: Event) -> Result<(), ProcessError> {
        let action = event.action;
        tokio::select! {
            biased;
            sent = self.events.send(event) => {
                if sent.is_err() {
                    return Err(ProcessError::SinkClosed);
                }
            }
            _ = self.stop.cancelled() => {
                debug!("stop requested while sink was full; event dropped");
                return Ok(());
            }
        }
        counter!("controller_events_total", 1, "kind" => self.kind.clone(), "action" => action.as_str());
        Ok(())
    }
}
