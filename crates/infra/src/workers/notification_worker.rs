use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use herald_core::NotificationStatus;

use crate::config::WorkerConfig;
use crate::dispatch::{DispatchExecutor, DispatchOutcome, DispatchReport, EmailProvider};
use crate::recovery::{RecoveryReport, RecoverySweeper};
use crate::store::{NotificationStore, StoreError};

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub ticks_run: u64,
    /// Ticks skipped because the previous one was still running.
    pub ticks_overlapped: u64,
    pub claim_errors: u64,
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub dropped: u64,
    pub superseded: u64,
    pub unrecorded: u64,
    /// Stale claims handed back to the pool by the recovery sweep.
    pub requeued: u64,
}

impl WorkerStats {
    fn record_batch(&mut self, batch: &BatchSummary) {
        self.ticks_run += 1;
        if batch.aborted.is_some() {
            self.claim_errors += 1;
        }
        for report in &batch.dispatched {
            match report.outcome {
                DispatchOutcome::Sent { .. } => self.sent += 1,
                DispatchOutcome::Retrying { .. } => self.retried += 1,
                DispatchOutcome::Failed { .. } => self.failed += 1,
                DispatchOutcome::Dropped { .. } => self.dropped += 1,
                DispatchOutcome::Superseded => self.superseded += 1,
                DispatchOutcome::Unrecorded { .. } => self.unrecorded += 1,
            }
        }
    }

    fn record_sweep(&mut self, sweep: &RecoveryReport) {
        self.requeued += sweep.requeued;
        self.dropped += sweep.dropped;
    }
}

/// Result of one tick's batch loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
    pub dispatched: Vec<DispatchReport>,
    /// Set when the claim query failed and the batch stopped early.
    pub aborted: Option<String>,
}

impl BatchSummary {
    /// How many dispatched records ended up in `status`.
    pub fn count(&self, status: NotificationStatus) -> usize {
        self.dispatched
            .iter()
            .filter(|r| r.outcome.status() == Some(status))
            .count()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TickReport {
    Disabled,
    /// Another tick was still running on this worker.
    Overlapping,
    Ran(BatchSummary),
}

/// Clears the running flag on drop, including on unwind.
struct RunningGuard<'a>(&'a AtomicBool);

impl<'a> RunningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Recurring dispatch driver for one process.
///
/// Each tick claims and dispatches up to `batch_size` notifications, stopping
/// at the first empty claim. Ticks never overlap on the same worker; running
/// more worker processes is how throughput scales.
pub struct NotificationWorker<S, P> {
    executor: DispatchExecutor<S, P>,
    sweeper: RecoverySweeper<S>,
    config: WorkerConfig,
    running: AtomicBool,
    stats: Arc<Mutex<WorkerStats>>,
}

impl<S, P> NotificationWorker<S, P>
where
    S: NotificationStore + Clone,
    P: EmailProvider,
{
    pub fn new(executor: DispatchExecutor<S, P>, config: WorkerConfig) -> Self {
        let sweeper = RecoverySweeper::new(executor.store().clone());
        Self {
            executor,
            sweeper,
            config,
            running: AtomicBool::new(false),
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }

    /// Run one batch unless disabled or a previous tick is still in progress.
    pub async fn tick(&self) -> TickReport {
        if !self.config.enabled {
            return TickReport::Disabled;
        }

        let Some(_guard) = RunningGuard::acquire(&self.running) else {
            debug!("previous tick still running; skipping");
            lock_stats(&self.stats).ticks_overlapped += 1;
            return TickReport::Overlapping;
        };

        let batch = self.run_batch().await;
        lock_stats(&self.stats).record_batch(&batch);
        TickReport::Ran(batch)
    }

    async fn run_batch(&self) -> BatchSummary {
        let mut batch = BatchSummary::default();

        for _ in 0..self.config.batch_size {
            match self.executor.send_next().await {
                Ok(Some(report)) => batch.dispatched.push(report),
                Ok(None) => break,
                Err(err) => {
                    error!(error = %err, "notification worker tick aborted");
                    batch.aborted = Some(err.to_string());
                    break;
                }
            }
        }

        if !batch.dispatched.is_empty() {
            debug!(
                dispatched = batch.dispatched.len(),
                sent = batch.count(NotificationStatus::Sent),
                "notification worker tick finished"
            );
        }
        batch
    }

    /// Run the recovery sweep once.
    pub async fn recover(&self) -> Result<RecoveryReport, StoreError> {
        let report = self.sweeper.sweep().await?;
        lock_stats(&self.stats).record_sweep(&report);
        Ok(report)
    }
}

impl<S, P> NotificationWorker<S, P>
where
    S: NotificationStore + Clone + 'static,
    P: EmailProvider + 'static,
{
    /// Drive ticks and recovery sweeps on their intervals until shut down.
    ///
    /// Each tick runs on its own task, so a slow batch never delays the timer;
    /// the running flag turns the overlapping tick into a no-op instead.
    pub fn spawn(self: Arc<Self>) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();

        let join = tokio::spawn(async move {
            info!(
                batch_size = self.config.batch_size,
                tick_interval_ms = self.config.tick_interval.as_millis() as u64,
                "notification worker started"
            );

            let mut ticks = tokio::time::interval(self.config.tick_interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut sweeps = tokio::time::interval(self.config.recovery_interval);
            sweeps.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut in_flight = JoinSet::new();

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticks.tick() => {
                        let worker = self.clone();
                        in_flight.spawn(async move {
                            worker.tick().await;
                        });
                    }
                    _ = sweeps.tick() => {
                        let worker = self.clone();
                        in_flight.spawn(async move {
                            if let Err(err) = worker.recover().await {
                                error!(error = %err, "recovery sweep failed");
                            }
                        });
                    }
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(err) = joined {
                            error!(error = %err, "notification worker task panicked");
                        }
                    }
                }
            }

            while in_flight.join_next().await.is_some() {}
            info!("notification worker stopped");
        });

        WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn lock_stats(stats: &Mutex<WorkerStats>) -> MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to control and join a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Stop scheduling new ticks and wait for in-flight ones to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "notification worker ended abnormally");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock_stats(&self.stats).clone()
    }
}
