use crate::execution::CollectError;
use crate::models::SchedulePolicy;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Work driven by a [`TaskScheduler`]. One call is one attempt.
#[async_trait]
pub trait ScheduledTask: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn run(&self, cancel: &CancellationToken) -> Result<(), CollectError>;
}

/// What happens when a tick fires while the previous cycle of the same task
/// is still in flight.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// The tick is skipped and counted in [`CycleStats::skipped`].
    #[default]
    SkipWhileRunning,
    /// Cycles may overlap. Only the most recent one is reachable through
    /// [`TaskScheduler::abort_current_execution`].
    Allow,
}

impl OverlapPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkipWhileRunning => "skip_while_running",
            Self::Allow => "allow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler '{0}' is already running")]
    AlreadyRunning(String),
    #[error("invalid interval {interval:?} for scheduler '{name}'")]
    InvalidInterval { name: String, interval: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Succeeded { attempts: u32 },
    /// Every attempt failed with a retryable error.
    Failed { attempts: u32 },
    /// An attempt failed with a non-retryable error.
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
    pub cancelled: u64,
    pub skipped: u64,
}

impl CycleStats {
    fn record(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Succeeded { .. } => self.succeeded += 1,
            CycleOutcome::Failed { .. } => self.failed += 1,
            CycleOutcome::Rejected => self.rejected += 1,
            CycleOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

struct CurrentCycle {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RunState {
    running: bool,
    stop: Option<CancellationToken>,
    dispatch: Option<JoinHandle<()>>,
    current: Option<CurrentCycle>,
    skip_next: bool,
    stats: CycleStats,
}

struct Shared {
    name: String,
    policy: SchedulePolicy,
    overlap: OverlapPolicy,
    task: Arc<dyn ScheduledTask>,
    cycle_ids: AtomicU64,
    state: Mutex<RunState>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs one task on a fixed period, each tick in its own cycle with bounded
/// retries.
pub struct TaskScheduler {
    shared: Arc<Shared>,
}

impl TaskScheduler {
    pub fn new(task: Arc<dyn ScheduledTask>, policy: SchedulePolicy) -> Self {
        Self::with_overlap_policy(task, policy, OverlapPolicy::default())
    }

    pub fn with_overlap_policy(
        task: Arc<dyn ScheduledTask>,
        policy: SchedulePolicy,
        overlap: OverlapPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: task.name(),
                policy,
                overlap,
                task,
                cycle_ids: AtomicU64::new(0),
                state: Mutex::new(RunState::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn policy(&self) -> &SchedulePolicy {
        &self.shared.policy
    }

    pub fn overlap_policy(&self) -> OverlapPolicy {
        self.shared.overlap
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock_state().running
    }

    pub fn stats(&self) -> CycleStats {
        self.shared.lock_state().stats
    }

    /// Starts the ticker and returns immediately. Must be called from within
    /// a tokio runtime.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut state = self.shared.lock_state();
        if state.running {
            return Err(SchedulerError::AlreadyRunning(self.shared.name.clone()));
        }

        let policy = self.shared.policy;
        if policy.interval.is_zero() {
            let err = SchedulerError::InvalidInterval {
                name: self.shared.name.clone(),
                interval: policy.interval,
            };
            error!("Error while starting scheduler: {}", err);
            return Err(err);
        }

        let stop = CancellationToken::new();
        let dispatch = tokio::spawn(dispatch_loop(Arc::clone(&self.shared), stop.clone()));
        state.running = true;
        state.stop = Some(stop);
        state.dispatch = Some(dispatch);

        info!(
            "Scheduler '{}' started (interval={:?}, max_retries={}, retry_delay={:?}, overlap={})",
            self.shared.name,
            policy.interval,
            policy.max_retries,
            policy.retry_delay,
            self.shared.overlap.as_str()
        );
        Ok(())
    }

    /// Cancels every in-flight cycle, halts the ticker and waits for the
    /// dispatch loop to exit. No-op when not running.
    pub async fn stop(&self) {
        let (stop, dispatch) = {
            let mut state = self.shared.lock_state();
            if !state.running {
                return;
            }
            state.running = false;
            if let Some(current) = state.current.take() {
                warn!(
                    "Scheduler '{}' aborting cycle {} during stop",
                    self.shared.name, current.id
                );
                current.cancel.cancel();
            }
            (state.stop.take(), state.dispatch.take())
        };

        info!("Scheduler '{}' received stop signal", self.shared.name);
        if let Some(stop) = stop {
            stop.cancel();
        }
        if let Some(dispatch) = dispatch {
            if let Err(err) = dispatch.await {
                error!("Scheduler '{}' run loop ended abnormally: {}", self.shared.name, err);
            }
        }
    }

    /// Skips the next tick only. The flag clears itself once consumed.
    pub fn disable_next_execution(&self) {
        self.shared.lock_state().skip_next = true;
        info!("Scheduler '{}': next execution disabled", self.shared.name);
    }

    pub fn enable_execution(&self) {
        self.shared.lock_state().skip_next = false;
        info!("Scheduler '{}': execution re-enabled", self.shared.name);
    }

    /// Cancels the most recently started cycle, if it is still running.
    pub fn abort_current_execution(&self) -> bool {
        let state = self.shared.lock_state();
        match state.current.as_ref() {
            Some(current) => {
                warn!(
                    "Scheduler '{}': aborting current cycle {}",
                    self.shared.name, current.id
                );
                current.cancel.cancel();
                true
            }
            None => {
                debug!("Scheduler '{}': no current cycle to abort", self.shared.name);
                false
            }
        }
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        if let Some(stop) = state.stop.take() {
            stop.cancel();
        }
    }
}

async fn dispatch_loop(shared: Arc<Shared>, stop: CancellationToken) {
    let period = shared.policy.interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut cycles: JoinSet<()> = JoinSet::new();

    debug!("Scheduler '{}': run loop started", shared.name);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => on_tick(&shared, &stop, &mut cycles),
            Some(joined) = cycles.join_next(), if !cycles.is_empty() => {
                if let Err(err) = joined {
                    error!("Scheduler '{}': cycle ended abnormally: {}", shared.name, err);
                }
            }
        }
    }

    // Every cycle token is a child of `stop`, so these are already cancelled.
    while let Some(joined) = cycles.join_next().await {
        if let Err(err) = joined {
            error!("Scheduler '{}': cycle ended abnormally: {}", shared.name, err);
        }
    }
    debug!("Scheduler '{}': run loop stopped", shared.name);
}

fn on_tick(shared: &Arc<Shared>, stop: &CancellationToken, cycles: &mut JoinSet<()>) {
    {
        let mut state = shared.lock_state();
        if std::mem::take(&mut state.skip_next) {
            state.stats.skipped += 1;
            info!(
                "Scheduler '{}': execution skipped due to disable flag",
                shared.name
            );
            return;
        }
        if shared.overlap == OverlapPolicy::SkipWhileRunning && state.current.is_some() {
            state.stats.skipped += 1;
            warn!(
                "Scheduler '{}': previous cycle still running, tick skipped",
                shared.name
            );
            return;
        }
    }

    let id = shared.cycle_ids.fetch_add(1, Ordering::Relaxed) + 1;
    let cancel = stop.child_token();
    {
        let mut state = shared.lock_state();
        state.current = Some(CurrentCycle {
            id,
            cancel: cancel.clone(),
        });
        state.stats.started += 1;
    }

    let shared = Arc::clone(shared);
    cycles.spawn(async move {
        let _guard = CycleGuard {
            shared: Arc::clone(&shared),
            id,
        };
        let outcome = run_cycle(shared.task.as_ref(), &shared.policy, id, &cancel).await;
        shared.lock_state().stats.record(outcome);
    });
}

/// Releases the "current cycle" slot when a cycle ends, including by panic.
struct CycleGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        if state.current.as_ref().map(|current| current.id) == Some(self.id) {
            state.current = None;
        }
    }
}

/// Runs up to `max_retries + 1` attempts of `task`.
pub async fn run_cycle(
    task: &dyn ScheduledTask,
    policy: &SchedulePolicy,
    cycle_id: u64,
    cancel: &CancellationToken,
) -> CycleOutcome {
    let name = task.name();
    let total_attempts = policy.total_attempts();
    debug!("{}: cycle {} started", name, cycle_id);

    for attempt in 1..=total_attempts {
        if cancel.is_cancelled() {
            warn!(
                "{}: cycle {} aborted before attempt {}/{}",
                name, cycle_id, attempt, total_attempts
            );
            return CycleOutcome::Cancelled;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CollectError::Cancelled),
            result = task.run(cancel) => result,
        };

        match result {
            Ok(()) => {
                debug!(
                    "{}: cycle {} completed on attempt {}/{}",
                    name, cycle_id, attempt, total_attempts
                );
                return CycleOutcome::Succeeded { attempts: attempt };
            }
            Err(CollectError::Cancelled) => {
                warn!("{}: cycle {} aborted during attempt {}", name, cycle_id, attempt);
                return CycleOutcome::Cancelled;
            }
            Err(err) if !err.is_retryable() => {
                error!(
                    "{}: cycle {} failed with a non-retryable error: {}",
                    name, cycle_id, err
                );
                return CycleOutcome::Rejected;
            }
            Err(err) => {
                warn!(
                    "{}: attempt {}/{} of cycle {} failed: {}",
                    name, attempt, total_attempts, cycle_id, err
                );
                if attempt < total_attempts && !policy.retry_delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            warn!("{}: cycle {} aborted during retry delay", name, cycle_id);
                            return CycleOutcome::Cancelled;
                        }
                        _ = sleep(policy.retry_delay) => {}
                    }
                }
            }
        }
    }

    error!(
        "{}: cycle {} failed permanently after {} attempts",
        name, cycle_id, total_attempts
    );
    CycleOutcome::Failed {
        attempts: total_attempts,
    }
}
