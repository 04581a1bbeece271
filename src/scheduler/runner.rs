//! Recurring task runner.
//!
//! A [`RecurringTask`] is a name, an interval, and a tick closure. Once
//! spawned it waits a short stagger delay, then alternates between running
//! one tick and waiting out the interval (fixed-delay: a slow tick pushes the
//! next one back instead of overlapping it). A tick that errors or panics is
//! logged and recorded; the loop carries on.
//!
//! Cancellation is observed at every wait point. A tick that has started
//! always runs to completion.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span};

/// Delay before the first tick of every task.
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(5);

/// Number of run records kept per task.
const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Tick closure: produces one tick's future per call.
pub type TickFn = Box<dyn FnMut() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Failure of a single tick.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// The tick returned an error.
    #[error("{0:#}")]
    Failed(anyhow::Error),
    /// The tick panicked.
    #[error("tick panicked: {0}")]
    Panicked(String),
}

/// Lifecycle of a running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Constructed, not yet started.
    Created,
    /// Waiting out the startup stagger.
    Staggering,
    /// A tick is executing.
    Running,
    /// Waiting for the next tick.
    Waiting,
    /// Stopped by the shutdown signal. Terminal.
    Cancelled,
}

/// How a single tick ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskRunOutcome {
    Success,
    Failed,
    Panicked,
}

/// One entry of a task's run history.
#[derive(Debug, Clone)]
pub struct TaskRunRecord {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: TaskRunOutcome,
}

/// Observable status of a spawned task.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub state: TaskState,
    /// Ticks executed so far, failed ones included.
    pub ticks: u64,
    pub failures: u64,
    pub last_error: Option<String>,
    pub last_finished_at: Option<DateTime<Utc>>,
    /// Most recent runs, oldest first.
    pub history: VecDeque<TaskRunRecord>,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self {
            state: TaskState::Created,
            ticks: 0,
            failures: 0,
            last_error: None,
            last_finished_at: None,
            history: VecDeque::new(),
        }
    }
}

#[derive(Debug, Default)]
struct SharedStatus(Mutex<TaskStatus>);

impl SharedStatus {
    fn lock(&self) -> MutexGuard<'_, TaskStatus> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: TaskState) {
        self.lock().state = state;
    }

    fn record(&self, run: TaskRunRecord, error: Option<&TaskError>) {
        let mut status = self.lock();
        status.ticks = status.ticks.saturating_add(1);
        status.last_finished_at = Some(run.finished_at);
        if let Some(err) = error {
            status.failures = status.failures.saturating_add(1);
            status.last_error = Some(err.to_string());
        }
        status.history.push_back(run);
        while status.history.len() > DEFAULT_HISTORY_LIMIT {
            status.history.pop_front();
        }
    }
}

/// A periodically executed job.
pub struct RecurringTask {
    name: String,
    interval: Duration,
    stagger: Duration,
    tick: TickFn,
}

impl std::fmt::Debug for RecurringTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecurringTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("stagger", &self.stagger)
            .finish_non_exhaustive()
    }
}

impl RecurringTask {
    /// Create a task that calls `tick` every `interval`.
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            interval,
            stagger: DEFAULT_STAGGER,
            tick: Box::new(move || tick().boxed()),
        }
    }

    /// Override the startup stagger delay.
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start the task loop on the tokio runtime.
    pub fn spawn(self, cancel: CancellationToken) -> TaskHandle {
        let status = Arc::new(SharedStatus::default());
        let name = self.name.clone();
        let span = info_span!("task", task = %name);
        let join = tokio::spawn(self.run(cancel, Arc::clone(&status)).instrument(span));
        TaskHandle { name, status, join }
    }

    async fn run(mut self, cancel: CancellationToken, status: Arc<SharedStatus>) {
        info!(
            interval_secs = self.interval.as_secs_f64(),
            stagger_secs = self.stagger.as_secs_f64(),
            "scheduled task started"
        );

        status.set_state(TaskState::Staggering);
        if !wait_or_cancel(&cancel, self.stagger).await {
            status.set_state(TaskState::Cancelled);
            info!("scheduled task cancelled before first tick");
            return;
        }

        loop {
            status.set_state(TaskState::Running);
            let started_at = Utc::now();
            let result = self.execute_tick().await;
            let run = TaskRunRecord {
                started_at,
                finished_at: Utc::now(),
                outcome: match &result {
                    Ok(()) => TaskRunOutcome::Success,
                    Err(TaskError::Failed(_)) => TaskRunOutcome::Failed,
                    Err(TaskError::Panicked(_)) => TaskRunOutcome::Panicked,
                },
            };

            match &result {
                Ok(()) => debug!("tick completed"),
                Err(e) => error!(error = %e, "tick failed"),
            }
            status.record(run, result.as_ref().err());

            if cancel.is_cancelled() {
                break;
            }
            status.set_state(TaskState::Waiting);
            if !wait_or_cancel(&cancel, self.interval).await {
                break;
            }
        }

        status.set_state(TaskState::Cancelled);
        info!("scheduled task stopped");
    }

    /// Run one tick behind the failure boundary.
    ///
    /// The tick future is spawned so that cancelling the surrounding task
    /// cannot interrupt it and a panic stays contained.
    async fn execute_tick(&mut self) -> Result<(), TaskError> {
        let tick = &mut self.tick;
        let future = std::panic::catch_unwind(std::panic::AssertUnwindSafe(tick))
            .map_err(|payload| TaskError::Panicked(panic_message(payload.as_ref())))?;

        match tokio::spawn(future.in_current_span()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaskError::Failed(e)),
            Err(join_err) if join_err.is_panic() => Err(TaskError::Panicked(panic_message(
                join_err.into_panic().as_ref(),
            ))),
            Err(join_err) => Err(TaskError::Panicked(join_err.to_string())),
        }
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn wait_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Handle to a spawned [`RecurringTask`].
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    status: Arc<SharedStatus>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status copy.
    pub fn status(&self) -> TaskStatus {
        self.status.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the task loop to exit (after cancellation).
    pub async fn join(self) -> crate::Result<TaskStatus> {
        self.join.await.map_err(|e| {
            crate::BotError::Scheduler(format!("task {} did not stop cleanly: {e}", self.name))
        })?;
        Ok(self.status.lock().clone())
    }
}
