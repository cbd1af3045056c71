//! Lifecycle controller and worker pool.
//!
//! `run` waits for the change source to sync, spawns a fixed pool of
//! workers that pull keys from the queue and reconcile them, and on
//! shutdown closes the queue and waits for every worker to drain.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt as _;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use super::adapter::EventAdapter;
use super::expectations::ControllerExpectations;
use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::event::DeadLetter;
use crate::model::{ObjectKey, Resource};
use crate::queue::WorkQueue;
use crate::queue::rate_limit::RateLimiter;
use crate::source::{ChangeSource, SyncOutcome, wait_for_cache_sync};
use crate::telemetry::metrics::{ControllerMetrics, RunResult};
use crate::telemetry::reconcile::{record_outcome, start_reconcile_span};

/// Drives the state behind one key toward its desired state.
///
/// Must be idempotent: the same key can be reconciled any number of times.
/// An error requeues the key with backoff.
///
/// Runs on the async worker pool. Blocking I/O or heavy computation belongs
/// in `tokio::task::spawn_blocking`, otherwise it stalls a runtime thread
/// and every worker scheduled on it.
pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, key: &ObjectKey) -> impl Future<Output = anyhow::Result<()>> + Send;
}

impl<F, Fut> Reconciler for F
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    fn reconcile(&self, key: &ObjectKey) -> impl Future<Output = anyhow::Result<()>> + Send {
        self(key.clone())
    }
}

/// State shared by every worker.
struct Shared<R> {
    name: String,
    run_id: Uuid,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: R,
    max_retries: Option<u32>,
    dead_letters: Option<mpsc::UnboundedSender<DeadLetter>>,
    metrics: ControllerMetrics,
}

impl<R: Reconciler> Shared<R> {
    /// Pull one key and reconcile it. Returns false once the queue is shut
    /// down.
    async fn process_next_item(&self, worker: usize) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let span = start_reconcile_span(&self.name, &self.run_id, worker, &key);
        async {
            let start = Instant::now();
            // The call sits inside the block so a panic while building the future
            // is caught as well.
            let result = AssertUnwindSafe(async { self.reconciler.reconcile(&key).await })
                .catch_unwind()
                .await;
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

            match result {
                Ok(Ok(())) => {
                    record_outcome(&span, "ok");
                    self.metrics.record_run(&self.name, RunResult::Ok, duration_ms);
                    self.queue.forget(&key);
                    debug!(controller = %self.name, %key, duration_ms, "processed");
                }
                Ok(Err(e)) => {
                    record_outcome(&span, "error");
                    self.metrics
                        .record_run(&self.name, RunResult::Error, duration_ms);
                    self.handle_failure(&key, format!("{e:#}"));
                }
                Err(payload) => {
                    record_outcome(&span, "panic");
                    self.metrics
                        .record_run(&self.name, RunResult::Panic, duration_ms);
                    let reason = format!("reconcile panicked: {}", panic_message(payload.as_ref()));
                    error!(controller = %self.name, %key, worker, %reason, "recovered panic");
                    self.handle_failure(&key, reason);
                }
            }

            self.queue.done(&key);
        }
        .instrument(span.clone())
        .await;

        true
    }

    fn handle_failure(&self, key: &ObjectKey, reason: String) {
        let failures = self.queue.num_requeues(key);

        match self.max_retries {
            Some(max) if failures >= max => {
                let attempts = failures.saturating_add(1);
                error!(
                    controller = %self.name,
                    %key,
                    attempts,
                    %reason,
                    "dropping key after exhausting retries"
                );
                self.queue.forget(key);
                self.metrics.record_dropped(&self.name);
                if let Some(tx) = &self.dead_letters {
                    let letter = DeadLetter {
                        controller: self.name.clone(),
                        run_id: self.run_id,
                        key: key.clone(),
                        attempts,
                        last_error: reason,
                        at: Utc::now(),
                    };
                    if tx.send(letter).is_err() {
                        warn!(controller = %self.name, %key, "dead letter receiver is gone");
                    }
                }
            }
            _ => {
                info!(controller = %self.name, %key, %reason, failures, "reenqueuing");
                self.metrics.record_requeue(&self.name);
                self.queue.add_rate_limited(key.clone());
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

async fn run_worker<R: Reconciler>(shared: Arc<Shared<R>>, worker: usize) {
    debug!(controller = %shared.name, worker, "worker started");
    while shared.process_next_item(worker).await {}
    debug!(controller = %shared.name, worker, "worker stopped");
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// A reconciliation controller for one change source.
pub struct Controller<S, R> {
    shared: Arc<Shared<R>>,
    source: Arc<S>,
    config: ControllerConfig,
    shutdown: Arc<Notify>,
}

impl<S, R> Clone for Controller<S, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<S, R> Controller<S, R>
where
    S: ChangeSource,
    S::Object: Resource,
    R: Reconciler,
{
    /// Start building a controller named `name`.
    pub fn builder(name: impl Into<String>, source: Arc<S>, reconciler: R) -> ControllerBuilder<S, R> {
        ControllerBuilder {
            name: name.into(),
            source,
            reconciler,
            config: ControllerConfig::default(),
            limiter: None,
            expectations: None,
            dead_letters: None,
            metrics: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn run_id(&self) -> Uuid {
        self.shared.run_id
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.shared.queue
    }

    /// Signal `run` to stop. Safe to call before `run` starts.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`Controller::shutdown`] is called.
    ///
    /// Waits for the change source to sync before spawning workers. Fails
    /// with [`Error::CacheSync`] if it does not sync in time; no key is
    /// reconciled in that case. Fails with [`Error::Config`] if the config
    /// asks for zero workers. Call at most once per controller.
    pub async fn run(&self) -> Result<()> {
        let name = &self.shared.name;
        let queue = &self.shared.queue;
        if self.config.workers == 0 {
            queue.shut_down();
            return Err(Error::Config(format!(
                "controller {name} needs at least one worker"
            )));
        }
        info!(controller = %name, run_id = %self.shared.run_id, "starting controller");

        let outcome = tokio::select! {
            _ = self.shutdown.notified() => {
                info!(controller = %name, "stopped before cache sync");
                queue.shut_down();
                return Ok(());
            }
            outcome = wait_for_cache_sync(
                self.source.as_ref(),
                self.config.sync_poll_interval,
                self.config.cache_sync_timeout,
            ) => outcome,
        };

        if outcome == SyncOutcome::TimedOut {
            queue.shut_down();
            let waited = self.config.cache_sync_timeout.unwrap_or_default();
            error!(controller = %name, ?waited, "change source never synced");
            return Err(Error::CacheSync {
                controller: name.clone(),
                waited,
            });
        }

        info!(controller = %name, workers = self.config.workers, "cache synced, starting workers");
        let mut workers = JoinSet::new();
        for worker in 0..self.config.workers {
            workers.spawn(run_worker(Arc::clone(&self.shared), worker));
        }

        self.shutdown.notified().await;
        info!(controller = %name, "stopping controller");
        queue.shut_down();

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(controller = %name, error = %e, "worker task failed");
            }
        }
        info!(controller = %name, "controller stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Wires a controller's collaborators together.
///
/// `build` registers the event adapter with the source, so notifications
/// start filling the queue immediately; workers only start with `run`.
pub struct ControllerBuilder<S, R> {
    name: String,
    source: Arc<S>,
    reconciler: R,
    config: ControllerConfig,
    limiter: Option<Box<dyn RateLimiter<ObjectKey>>>,
    expectations: Option<Arc<ControllerExpectations>>,
    dead_letters: Option<mpsc::UnboundedSender<DeadLetter>>,
    metrics: Option<ControllerMetrics>,
}

impl<S, R> ControllerBuilder<S, R>
where
    S: ChangeSource,
    S::Object: Resource,
    R: Reconciler,
{
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Override the limiter derived from the config's backoff settings.
    pub fn rate_limiter(mut self, limiter: impl RateLimiter<ObjectKey> + 'static) -> Self {
        self.limiter = Some(Box::new(limiter));
        self
    }

    /// Release expectations for keys whose objects are deleted.
    pub fn expectations(mut self, expectations: Arc<ControllerExpectations>) -> Self {
        self.expectations = Some(expectations);
        self
    }

    /// Receive a [`DeadLetter`] for every key dropped after `max_retries`.
    pub fn dead_letters(mut self, tx: mpsc::UnboundedSender<DeadLetter>) -> Self {
        self.dead_letters = Some(tx);
        self
    }

    pub fn metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Controller<S, R> {
        let limiter = self
            .limiter
            .unwrap_or_else(|| Box::new(self.config.rate_limiter()) as Box<dyn RateLimiter<ObjectKey>>);
        let queue = Arc::new(WorkQueue::new(self.name.clone(), limiter));
        let metrics = self.metrics.unwrap_or_else(ControllerMetrics::global);

        let mut adapter = EventAdapter::new(self.name.clone(), Arc::clone(&queue), metrics.clone());
        if let Some(expectations) = self.expectations {
            adapter = adapter.with_expectations(expectations);
        }
        self.source.add_event_handler(Arc::new(adapter));

        Controller {
            shared: Arc::new(Shared {
                name: self.name,
                run_id: Uuid::new_v4(),
                queue,
                reconciler: self.reconciler,
                max_retries: self.config.max_retries,
                dead_letters: self.dead_letters,
                metrics,
            }),
            source: self.source,
            config: self.config,
            shutdown: Arc::new(Notify::new()),
        }
    }
}
