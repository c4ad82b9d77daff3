//! Background runner for the reconciliation engine.
//!
//! The [`Scheduler`] drives [`SyncEngine::run_pass`] from one cancellable
//! tokio task. After a pass that added rows the next pass comes sooner (a
//! third of the base interval) to drain bursts; otherwise the base interval
//! applies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::engine::{PassOutcome, SyncEngine};
use crate::error::SyncError;
use crate::models::SyncCursor;
use crate::sync::SyncSummary;

/// Interval before the next scheduled pass: a third of `base` (at least one
/// second) after a pass that added rows, `base` otherwise.
pub fn next_interval(base: Duration, last: Option<&SyncSummary>) -> Duration {
    match last {
        Some(summary) if summary.added() > 0 => (base / 3).max(Duration::from_secs(1)),
        _ => base,
    }
}

/// How [`Scheduler::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopOutcome {
    /// The loop exited within the join timeout.
    Joined,
    /// The loop did not exit in time and was aborted.
    Abandoned,
    NotRunning,
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    /// The background loop is active.
    pub running: bool,
    /// A pass (or direct submission) currently holds the engine lock.
    pub pass_in_flight: bool,
    pub interval_secs: Option<u64>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_summary: Option<SyncSummary>,
    pub last_error: Option<String>,
    pub cursor: SyncCursor,
}

#[derive(Debug, Default)]
struct RunState {
    last_run_at: Option<DateTime<Utc>>,
    last_summary: Option<SyncSummary>,
    last_error: Option<String>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    interval: Duration,
}

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    join_timeout: Duration,
    state: Arc<RwLock<RunState>>,
    worker: Mutex<Option<Worker>>,
    stopped: AtomicBool,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let join_timeout = engine.config().join_timeout();
        Self {
            engine,
            join_timeout,
            state: Arc::new(RwLock::new(RunState::default())),
            worker: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Starts the background loop. Returns `false` if it is already running.
    ///
    /// The first pass starts immediately.
    pub async fn start(&self, interval: Duration) -> bool {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            warn!("Scheduler already running");
            return false;
        }

        self.stopped.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.engine),
            Arc::clone(&self.state),
            interval,
            cancel.clone(),
        ));

        info!(interval_secs = interval.as_secs(), "Scheduler started");
        *worker = Some(Worker {
            cancel,
            handle,
            interval,
        });
        true
    }

    /// Stops the loop. No new pass starts afterwards, from the loop or from
    /// [`Scheduler::run_once`], until the next [`Scheduler::start`]. An
    /// in-flight pass gets the join timeout to finish before the task is
    /// aborted.
    pub async fn stop(&self) -> StopOutcome {
        self.stopped.store(true, Ordering::SeqCst);
        let Some(mut worker) = self.worker.lock().await.take() else {
            return StopOutcome::NotRunning;
        };

        worker.cancel.cancel();
        match tokio::time::timeout(self.join_timeout, &mut worker.handle).await {
            Ok(_) => {
                info!("Scheduler stopped");
                StopOutcome::Joined
            }
            Err(_) => {
                worker.handle.abort();
                warn!(
                    timeout_secs = self.join_timeout.as_secs(),
                    "Sync pass did not finish in time, abandoned"
                );
                StopOutcome::Abandoned
            }
        }
    }

    /// Runs one pass now, outside the timer.
    ///
    /// Coalesces into [`PassOutcome::AlreadyRunning`] if the loop is mid-pass.
    /// Returns [`SyncError::Stopped`] once [`Scheduler::stop`] has been called.
    pub async fn run_once(&self) -> Result<PassOutcome, SyncError> {
        if self.stopped.load(Ordering::SeqCst) {
            warn!("Scheduler stopped, pass not started");
            return Err(SyncError::Stopped);
        }
        run_recorded(&self.engine, &self.state, &CancellationToken::new()).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        let (running, interval_secs) = match self.worker.lock().await.as_ref() {
            Some(w) if !w.handle.is_finished() => (true, Some(w.interval.as_secs())),
            _ => (false, None),
        };
        let state = self.state.read().await;

        SchedulerStatus {
            running,
            pass_in_flight: self.engine.is_running(),
            interval_secs,
            last_run_at: state.last_run_at,
            last_summary: state.last_summary.clone(),
            last_error: state.last_error.clone(),
            cursor: self.engine.cursor().await,
        }
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    state: Arc<RwLock<RunState>>,
    base: Duration,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        let wait = match run_recorded(&engine, &state, &cancel).await {
            Ok(PassOutcome::Completed(summary)) => next_interval(base, Some(&summary)),
            _ => base,
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn run_recorded(
    engine: &SyncEngine,
    state: &RwLock<RunState>,
    cancel: &CancellationToken,
) -> Result<PassOutcome, SyncError> {
    let result = engine.run_pass(cancel).await;

    let mut state = state.write().await;
    match &result {
        Ok(PassOutcome::Completed(summary)) => {
            state.last_run_at = Some(summary.finished_at);
            state.last_summary = Some(summary.clone());
            state.last_error = None;
        }
        Ok(PassOutcome::AlreadyRunning) => {}
        Err(e) => {
            error!(error = %e, retryable = e.is_retryable(), "Sync pass failed");
            state.last_run_at = Some(Utc::now());
            state.last_error = Some(e.to_string());
        }
    }

    result
}
