//! Worker pools draining the task queues.
//!
//! A [`Foreman`] owns N workers on one queue. Each worker pops the next task
//! across orgs, rebuilds it through the task registry, loads the org's assets
//! and runs the task under its timeout. Panics are caught and counted; the
//! worker carries on with the next task. Tasks are acknowledged with
//! [`queue::done`] whatever their outcome.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::queue::{self, PoppedTask};
use super::TaskError;
use crate::runtime::Runtime;
use crate::shutdown::ShutdownSignal;

/// How long an idle worker sleeps before polling again
const IDLE_SLEEP: Duration = Duration::from_millis(500);

/// Backoff after a Redis error
const ERROR_SLEEP: Duration = Duration::from_secs(5);

/// Outcome of running one task.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    Failed(TaskError),
    Panicked(String),
}

/// Counters shared by a foreman's workers.
#[derive(Debug, Default)]
pub struct ForemanStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub panicked: AtomicU64,
}

impl ForemanStats {
    fn record(&self, outcome: &Outcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        match outcome {
            Outcome::Completed => {}
            Outcome::Failed(_) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Panicked(_) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.panicked.load(Ordering::Relaxed),
        )
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Runs a task future under a timeout, turning panics into an outcome.
pub async fn run_guarded<F>(timeout: Duration, fut: F) -> Outcome
where
    F: Future<Output = Result<(), TaskError>>,
{
    match tokio::time::timeout(timeout, AssertUnwindSafe(fut).catch_unwind()).await {
        Ok(Ok(Ok(()))) => Outcome::Completed,
        Ok(Ok(Err(err))) => Outcome::Failed(err),
        Ok(Err(payload)) => Outcome::Panicked(panic_message(payload.as_ref())),
        Err(_) => Outcome::Failed(TaskError::Timeout(timeout)),
    }
}

pub struct Foreman {
    rt: Arc<Runtime>,
    queue: &'static str,
    workers: usize,
    stats: Arc<ForemanStats>,
}

impl Foreman {
    pub fn new(rt: Arc<Runtime>, queue: &'static str, workers: usize) -> Self {
        Self {
            rt,
            queue,
            workers,
            stats: Arc::new(ForemanStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ForemanStats> {
        self.stats.clone()
    }

    /// Spawns the workers. They stop polling once `shutdown` fires, after
    /// finishing the task they are on.
    pub fn start(&self, shutdown: &ShutdownSignal) -> Vec<JoinHandle<()>> {
        info!(queue = self.queue, workers = self.workers, "Starting foreman");

        (0..self.workers)
            .map(|id| {
                let worker = Worker {
                    id,
                    name: format!("{}-{}-{id}", self.rt.config.worker_name(), self.queue),
                    rt: self.rt.clone(),
                    queue: self.queue,
                    stats: self.stats.clone(),
                };
                let shutdown = shutdown.clone();
                tokio::spawn(async move { worker.run(shutdown).await })
            })
            .collect()
    }
}

struct Worker {
    id: usize,
    name: String,
    rt: Arc<Runtime>,
    queue: &'static str,
    stats: Arc<ForemanStats>,
}

impl Worker {
    async fn run(self, shutdown: ShutdownSignal) {
        debug!(worker = %self.name, "Worker started");

        while !shutdown.is_shutdown() {
            let popped = match queue::pop(&self.rt.rp, self.queue).await {
                Ok(popped) => popped,
                Err(err) => {
                    error!(worker = %self.name, error = %err, "Error popping task");
                    sleep_unless_shutdown(&shutdown, ERROR_SLEEP).await;
                    continue;
                }
            };

            match popped {
                Some(popped) => {
                    let org_id = popped.org_id;
                    self.handle(popped).await;
                    if let Err(err) = queue::done(&self.rt.rp, self.queue, org_id).await {
                        error!(worker = %self.name, org_id = %org_id, error = %err, "Error marking task done");
                    }
                }
                None => sleep_unless_shutdown(&shutdown, IDLE_SLEEP).await,
            }
        }

        let (processed, failed, panicked) = self.stats.snapshot();
        info!(worker = %self.name, id = self.id, processed, failed, panicked, "Worker stopped");
    }

    async fn handle(&self, popped: PoppedTask) {
        let PoppedTask { org_id, envelope } = popped;
        let started = Instant::now();

        let outcome = match self.rt.tasks.read(&envelope) {
            Ok(task) => match self.rt.assets.get(&self.rt.db, org_id, task.with_assets()).await {
                Ok(oa) => {
                    let timeout = task.timeout(&self.rt.config.tasks);
                    run_guarded(timeout, task.perform(&self.rt, &oa)).await
                }
                Err(err) => Outcome::Failed(err.into()),
            },
            Err(err) => Outcome::Failed(err),
        };

        self.stats.record(&outcome);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Completed => {
                debug!(task_type = %envelope.task_type, org_id = %org_id, elapsed_ms, "Task complete");
            }
            Outcome::Failed(err) => {
                error!(task_type = %envelope.task_type, org_id = %org_id, elapsed_ms, error = %err, "Task failed");
            }
            Outcome::Panicked(msg) => {
                error!(task_type = %envelope.task_type, org_id = %org_id, elapsed_ms, panic = %msg, "Task panicked");
            }
        }

        let processed = self.stats.processed.load(Ordering::Relaxed);
        if processed > 0 && processed % 100 == 0 {
            let (processed, failed, panicked) = self.stats.snapshot();
            info!(queue = self.queue, processed, failed, panicked, "Foreman statistics");
        }
    }
}

async fn sleep_unless_shutdown(shutdown: &ShutdownSignal, duration: Duration) {
    tokio::select! {
        _ = shutdown.recv() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

/// Waits for workers to drain, giving up after the shutdown timeout.
pub async fn drain(handles: Vec<JoinHandle<()>>, timeout: Duration) {
    let joined = futures::future::join_all(handles);
    if tokio::time::timeout(timeout, joined).await.is_err() {
        warn!(timeout_secs = timeout.as_secs(), "Workers did not stop in time");
    }
}
