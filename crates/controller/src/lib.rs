//! Refuge controller: watches one resource kind and emits a normalized [`Event`] for
//! every object that is created, updated or deleted.
//!
//! Change callbacks from the [`Informer`] push keys into a [`WorkQueue`]; a single worker
//! pulls keys, looks the object up fresh in the mirror, strips volatile fields and sends
//! an upsert (or a delete when the object is gone) into a bounded channel shared by all
//! controllers.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use metrics::counter;
use refuge_core::{ChangeHandler, Event};
use refuge_kubehub::Informer;
use refuge_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

mod error;
pub mod normalize;
mod worker;

pub use error::ProcessError;

use worker::Worker;

/// Per-controller knobs.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Period of full replays of the mirror into the queue; `None` disables resync.
    pub resync: Option<Duration>,
    /// Processing attempts per key before it is dropped until its next change.
    pub max_attempts: u32,
    /// Pause before a panicked worker is started again.
    pub restart_period: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self { resync: Some(Duration::from_secs(900)), max_attempts: 6, restart_period: Duration::from_secs(1) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Running,
    Stopping,
    Stopped,
}

/// Controller for one watched kind. Single use: once stopped it cannot be started again.
pub struct Controller<I: Informer> {
    kind: String,
    config: ControllerConfig,
    informer: Arc<I>,
    queue: WorkQueue<String>,
    events: mpsc::Sender<Event>,
    stop: CancellationToken,
    state: Mutex<State>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    span: Span,
}

impl<I: Informer> Controller<I> {
    pub fn new(informer: Arc<I>, events: mpsc::Sender<Event>, kind: impl Into<String>, config: ControllerConfig) -> Self {
        let kind = kind.into();
        let span = info_span!("controller", kind = %kind);
        Self {
            queue: WorkQueue::new(kind.clone()),
            kind,
            config,
            informer,
            events,
            stop: CancellationToken::new(),
            state: Mutex::new(State::Created),
            tasks: Mutex::new(Vec::new()),
            span,
        }
    }

    pub fn kind(&self) -> &str { &self.kind }

    pub fn state(&self) -> State { *self.lock_state() }

    /// The controller's change queue.
    pub fn queue(&self) -> &WorkQueue<String> { &self.queue }

    fn lock_state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launch the mirror and, once it has synced, the worker. Returns immediately.
    pub fn start(&self) {
        {
            let mut st = self.lock_state();
            if *st != State::Created {
                warn!(kind = %self.kind, state = ?*st, "start ignored; controller already started");
                return;
            }
            *st = State::Running;
        }
        info!(parent: &self.span, "starting controller");

        let informer_task = {
            let informer = Arc::clone(&self.informer);
            let handler: Arc<dyn ChangeHandler> = Arc::new(self.queue.clone());
            let resync = self.config.resync;
            let stop = self.stop.child_token();
            tokio::spawn(
                async move {
                    if let Err(e) = informer.run(handler, resync, stop).await {
                        error!(error = %e, "informer failed");
                    }
                }
                .instrument(self.span.clone()),
            )
        };

        let worker = Arc::new(Worker {
            kind: self.kind.clone(),
            queue: self.queue.clone(),
            informer: Arc::clone(&self.informer),
            events: self.events.clone(),
            max_attempts: self.config.max_attempts,
            stop: self.stop.clone(),
        });
        let supervisor = tokio::spawn(
            supervise(worker, Arc::clone(&self.informer), self.config.restart_period, self.stop.clone())
                .instrument(self.span.clone()),
        );

        self.lock_tasks().extend([informer_task, supervisor]);
    }

    /// Signal stop, shut the queue down and wait for the worker and mirror to exit.
    /// Keys still queued are left unprocessed; no event is sent once this returns.
    pub async fn stop(&self) {
        {
            let mut st = self.lock_state();
            match *st {
                State::Running => *st = State::Stopping,
                State::Created => {
                    *st = State::Stopped;
                    self.stop.cancel();
                    self.queue.shut_down();
                    return;
                }
                State::Stopping | State::Stopped => {
                    warn!(kind = %self.kind, "stop ignored; controller already stopping");
                    return;
                }
            }
        }
        self.stop.cancel();
        self.queue.shut_down();

        let tasks = std::mem::take(&mut *self.lock_tasks());
        for task in tasks {
            if let Err(e) = task.await {
                error!(parent: &self.span, error = %e, "controller task failed");
            }
        }
        *self.lock_state() = State::Stopped;
        info!(parent: &self.span, "stopped controller");
    }
}

impl<I: Informer> Drop for Controller<I> {
    fn drop(&mut self) {
        // tasks of a controller dropped without stop() must not outlive it
        self.stop.cancel();
        self.queue.shut_down();
    }
}

/// Wait for the mirror, then keep one worker running until it exits cleanly or stop fires.
async fn supervise<I: Informer>(
    worker: Arc<Worker<I>>,
    informer: Arc<I>,
    restart_period: Duration,
    stop: CancellationToken,
) {
    tokio::select! {
        _ = informer.wait_synced() => {}
        _ = stop.cancelled() => {
            error!("timed out waiting for caches to sync");
            return;
        }
    }
    info!("caches synced; starting worker");

    loop {
        let w = Arc::clone(&worker);
        let handle = tokio::spawn(async move { w.run().await }.instrument(Span::current()));
        match handle.await {
            Ok(()) => break,
            Err(e) if e.is_panic() => {
                counter!("controller_worker_restarts_total", 1, "kind" => worker.kind.clone());
                error!("worker panicked; restarting in {:?}", restart_period);
            }
            Err(e) => {
                error!(error = %e, "worker task aborted");
                break;
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(restart_period) => {}
            _ = stop.cancelled() => break,
        }
    }
    debug!("worker supervision ended");
}
