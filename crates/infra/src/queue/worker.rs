//! In-process periodic invoker for dispatched batches.
//!
//! Hosts that already have a scheduler (cron, a job system) can call
//! `QueueRuntime::drain` themselves; this worker is the default.

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use super::runtime::{DrainReport, QueueRuntime, TaskHandler};
use super::store::{DurableStore, StoreError};
use super::types::BatchKey;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often to poll for dispatched batches when idle
    pub poll_interval: Duration,
    /// Name for logging and the worker thread
    pub name: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            name: "docqueue-worker".to_string(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub batches_processed: u64,
    pub batches_completed: u64,
    pub batches_cancelled: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_retried: u64,
    pub tasks_dropped: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn record(&mut self, report: &DrainReport) {
        if !report.waiting {
            self.batches_processed += 1;
            if report.cancelled {
                self.batches_cancelled += 1;
            } else {
                self.batches_completed += 1;
            }
        }
        self.tasks_succeeded += u64::from(report.succeeded);
        self.tasks_failed += u64::from(report.failed_attempts());
        self.tasks_retried += u64::from(report.retried);
        self.tasks_dropped += u64::from(report.dropped);
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown. The batch being drained finishes first.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Claims dispatched batches from a store and drains them with a runtime.
pub struct QueueWorker<S: DurableStore, H: TaskHandler> {
    store: S,
    runtime: QueueRuntime<H>,
}

impl<S, H> QueueWorker<S, H>
where
    S: DurableStore + 'static,
    H: TaskHandler + 'static,
{
    pub fn new(store: S, runtime: QueueRuntime<H>) -> Self {
        Self { store, runtime }
    }

    /// Drain every dispatched batch once, synchronously.
    ///
    /// Batches whose head task is scheduled for later are released again
    /// after the sweep so they are not claimed twice in one call.
    pub fn run_once(&self) -> Result<WorkerStats, StoreError> {
        let mut stats = WorkerStats::default();
        let mut waiting: Vec<BatchKey> = Vec::new();

        let result = self.sweep(&mut stats, &mut waiting);

        for key in &waiting {
            self.store.release(key)?;
        }

        result.map(|()| stats)
    }

    fn sweep(&self, stats: &mut WorkerStats, waiting: &mut Vec<BatchKey>) -> Result<(), StoreError> {
        while let Some(key) = self.store.claim_next()? {
            let report = self.drain_claimed(&key)?;
            stats.record(&report);
            if report.waiting {
                waiting.push(key);
            }
        }
        Ok(())
    }

    /// Spawn the worker in a background thread.
    pub fn spawn(self, config: WorkerConfig) -> std::io::Result<WorkerHandle>
    where
        S: Send,
        H: Send,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                worker_loop(self, config, shutdown_rx, stats_clone);
            })?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }

    fn drain_claimed(&self, key: &BatchKey) -> Result<DrainReport, StoreError> {
        debug!(batch = %key, "claimed batch");
        let result = self.runtime.drain(&self.store, key);
        if !matches!(result, Ok(ref report) if report.waiting) {
            // A finished batch is already deleted; releasing is a no-op then.
            self.store.release(key)?;
        }
        result
    }
}

fn worker_loop<S, H>(
    worker: QueueWorker<S, H>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: DurableStore + 'static,
    H: TaskHandler + 'static,
{
    info!(worker = %config.name, "queue worker started");
    let start_time = Instant::now();

    loop {
        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        match worker.run_once() {
            Ok(sweep) => {
                if let Ok(mut s) = stats.lock() {
                    s.batches_processed += sweep.batches_processed;
                    s.batches_completed += sweep.batches_completed;
                    s.batches_cancelled += sweep.batches_cancelled;
                    s.tasks_succeeded += sweep.tasks_succeeded;
                    s.tasks_failed += sweep.tasks_failed;
                    s.tasks_retried += sweep.tasks_retried;
                    s.tasks_dropped += sweep.tasks_dropped;
                }
            }
            Err(e) => {
                error!(worker = %config.name, error = %e, "failed to drain dispatched batches");
            }
        }

        match shutdown_rx.recv_timeout(config.poll_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(worker = %config.name, "queue worker stopped");
}
