use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SchedulerConfig;
use crate::executor::{ReconcileOutcome, ReconciliationExecutor, SkipReason};
use crate::poller::{BalancePoller, CycleSummary};
use crate::store::StoreError;
use crate::types::BalanceDelta;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("poll cycle failed: {0}")]
    Cycle(#[from] StoreError),
}

impl SchedulerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyRunning => "scheduler_already_running",
            Self::Cycle(_) => "poll_cycle_failed",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetrics {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub deltas_detected: u64,
    pub fetch_failures: u64,
    pub reconciliations_applied: u64,
    pub reconciliations_blocked: u64,
    pub reconciliations_skipped: u64,
    pub reconciliations_failed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_cycle_error: Option<String>,
}

impl EngineMetrics {
    fn record_cycle(&mut self, summary: &CycleSummary) {
        self.cycles_completed = self.cycles_completed.saturating_add(1);
        self.deltas_detected = self.deltas_detected.saturating_add(summary.deltas as u64);
        self.fetch_failures = self.fetch_failures.saturating_add(summary.fetch_failures as u64);
        self.last_cycle_at = Some(Utc::now());
        self.last_cycle_error = None;
    }

    fn record_cycle_failure(&mut self, error: &SchedulerError) {
        self.cycles_failed = self.cycles_failed.saturating_add(1);
        self.last_cycle_at = Some(Utc::now());
        self.last_cycle_error = Some(error.to_string());
    }

    fn record_outcome(&mut self, outcome: &ReconcileOutcome) {
        let counter = match outcome {
            ReconcileOutcome::Applied { .. } => &mut self.reconciliations_applied,
            ReconcileOutcome::Blocked { .. } => &mut self.reconciliations_blocked,
            ReconcileOutcome::Skipped(SkipReason::NoChange) => &mut self.reconciliations_skipped,
            ReconcileOutcome::Skipped(_) => &mut self.reconciliations_failed,
        };
        *counter = counter.saturating_add(1);
    }
}

/// Result of a single foreground cycle.
#[derive(Clone, Debug, Serialize)]
pub struct CycleReport {
    pub wallets: usize,
    pub deltas: usize,
    pub fetch_failures: usize,
    pub outcomes: Vec<(String, ReconcileOutcome)>,
}

/// Drives the poller on a fixed cadence and hands deltas to a bounded
/// reconciliation consumer through a queue.
pub struct Scheduler {
    poller: Arc<BalancePoller>,
    executor: Arc<ReconciliationExecutor>,
    config: SchedulerConfig,
    metrics: Arc<Mutex<EngineMetrics>>,
    state: watch::Sender<SchedulerState>,
    stop: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(
        poller: Arc<BalancePoller>,
        executor: Arc<ReconciliationExecutor>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            poller,
            executor,
            config,
            metrics: Arc::new(Mutex::new(EngineMetrics::default())),
            state: watch::Sender::new(SchedulerState::Stopped),
            stop: watch::Sender::new(false),
        }
    }

    #[must_use]
    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub async fn metrics(&self) -> EngineMetrics {
        self.metrics.lock().await.clone()
    }

    /// Spawns the poll loop and the reconciliation consumer. The returned
    /// handle completes once both have drained after [`Scheduler::stop`].
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, SchedulerError> {
        let started = self.state.send_if_modified(|state| {
            if *state == SchedulerState::Running {
                return false;
            }
            *state = SchedulerState::Running;
            true
        });
        if !started {
            return Err(SchedulerError::AlreadyRunning);
        }
        self.stop.send_replace(false);

        let (queue_tx, queue_rx) = mpsc::channel(self.config.reconcile_queue_capacity.max(1));
        let scheduler = Arc::clone(self);
        tracing::info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            reconcile_concurrency = self.config.reconcile_concurrency,
            "scheduler started"
        );
        Ok(tokio::spawn(async move {
            tokio::join!(
                scheduler.poll_loop(queue_tx),
                scheduler.consume(queue_rx)
            );
            scheduler.state.send_replace(SchedulerState::Stopped);
            tracing::info!("scheduler stopped");
        }))
    }

    /// Takes effect between cycles; an in-flight cycle finishes first.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Runs one cycle and reconciles its deltas before returning.
    pub async fn run_once(&self) -> Result<CycleReport, SchedulerError> {
        let (deltas, summary) = match self.poller.run_cycle_with_summary().await {
            Ok(result) => result,
            Err(error) => {
                let error = SchedulerError::from(error);
                self.metrics.lock().await.record_cycle_failure(&error);
                return Err(error);
            }
        };
        self.metrics.lock().await.record_cycle(&summary);

        let permits = Arc::new(Semaphore::new(self.config.reconcile_concurrency.max(1)));
        let outcomes = join_all(deltas.iter().map(|delta| {
            let permits = permits.clone();
            async move {
                let _permit = permits.acquire().await.ok();
                let outcome = self.executor.reconcile(delta).await;
                self.metrics.lock().await.record_outcome(&outcome);
                (delta.account_id.clone(), outcome)
            }
        }))
        .await;

        Ok(CycleReport {
            wallets: summary.wallets,
            deltas: summary.deltas,
            fetch_failures: summary.fetch_failures,
            outcomes,
        })
    }

    async fn poll_loop(&self, queue: mpsc::Sender<BalanceDelta>) {
        let mut stop = self.stop.subscribe();
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        let backoff = Duration::from_secs(self.config.error_backoff_seconds);

        while !*stop.borrow() {
            let pause = match self.poller.run_cycle_with_summary().await {
                Ok((deltas, summary)) => {
                    self.metrics.lock().await.record_cycle(&summary);
                    for delta in deltas {
                        dispatch(&queue, delta).await;
                    }
                    interval
                }
                Err(error) => {
                    let error = SchedulerError::from(error);
                    tracing::error!(
                        code = error.code(),
                        reason = %error,
                        backoff_seconds = backoff.as_secs(),
                        "poll cycle failed"
                    );
                    self.metrics.lock().await.record_cycle_failure(&error);
                    backoff
                }
            };
            if sleep_or_stop(pause, &mut stop).await {
                break;
            }
        }
    }

    /// Reconciles queued deltas with bounded concurrency. One account never
    /// has two reconciliations in flight: a delta arriving while its account
    /// is busy replaces any pending one and runs after the current call.
    async fn consume(&self, mut queue: mpsc::Receiver<BalanceDelta>) {
        let limit = self.config.reconcile_concurrency.max(1);
        let permits = Arc::new(Semaphore::new(limit));
        let pending: Arc<Mutex<HashMap<String, Option<BalanceDelta>>>> = Arc::default();

        while let Some(delta) = queue.recv().await {
            {
                let mut pending = pending.lock().await;
                if let Some(slot) = pending.get_mut(&delta.account_id) {
                    if slot.is_some() {
                        tracing::debug!(
                            account_id = %delta.account_id,
                            "superseded pending reconciliation"
                        );
                    }
                    *slot = Some(delta);
                    continue;
                }
                pending.insert(delta.account_id.clone(), None);
            }

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let executor = self.executor.clone();
            let metrics = self.metrics.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                let mut next = Some(delta);
                while let Some(delta) = next {
                    let outcome = executor.reconcile(&delta).await;
                    tracing::debug!(
                        account_id = %delta.account_id,
                        outcome = outcome.label(),
                        "reconciliation finished"
                    );
                    metrics.lock().await.record_outcome(&outcome);

                    let mut pending = pending.lock().await;
                    next = pending.get_mut(&delta.account_id).and_then(Option::take);
                    if next.is_none() {
                        pending.remove(&delta.account_id);
                    }
                }
                drop(permit);
            });
        }

        // Every permit back means every spawned reconciliation finished.
        if let Err(error) = permits.acquire_many(limit as u32).await {
            tracing::warn!(reason = %error, "reconcile drain interrupted");
        }
    }
}

/// Queues a delta without waiting unless the queue is already full.
async fn dispatch(queue: &mpsc::Sender<BalanceDelta>, delta: BalanceDelta) {
    match queue.try_send(delta) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(delta)) => {
            tracing::warn!(
                account_id = %delta.account_id,
                "reconcile queue full; waiting for capacity"
            );
            if queue.send(delta).await.is_err() {
                tracing::error!("reconcile queue closed");
            }
        }
        Err(mpsc::error::TrySendError::Closed(delta)) => {
            tracing::error!(account_id = %delta.account_id, "reconcile queue closed");
        }
    }
}

/// Sleeps for `pause`, returning early with `true` once a stop is requested.
async fn sleep_or_stop(pause: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    let deadline = tokio::time::Instant::now() + pause;
    loop {
        if *stop.borrow_and_update() {
            return true;
        }
        tokio::select! {
            biased;
            changed = stop.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
            () = tokio::time::sleep_until(deadline) => return *stop.borrow(),
        }
    }
}
