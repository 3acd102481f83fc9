//! Local durable-execution substrate
//!
//! [`LocalRuntime`] gives the orchestrator what a durable workflow engine
//! would: activity retries with backoff, start-to-close and heartbeat
//! timeouts, cancellable timers, an injected clock and a bounded
//! continue-as-new loop. All progress lives in the [`CheckpointStore`], so a
//! run interrupted at any point can be picked up again with
//! [`LocalRuntime::resume`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{WorkflowState, WorkflowStatus};
use crate::ratelimit::retry::RetryPolicy;
use crate::storage::checkpoint::{CheckpointStore, SharedCheckpointStore, WorkflowCheckpoint};
use crate::sync::stats::ProcessingStats;
use crate::workflow::activities::{Activity, ActivityHandler, ActivityReport};
use crate::workflow::orchestrator::{Execution, PhaseOrchestrator};
use crate::workflow::WorkflowInput;

/// Smallest interval between heartbeat checks
const MIN_HEARTBEAT_CHECK: Duration = Duration::from_millis(10);

// ============================================================================
// Clock
// ============================================================================

/// Source of "now" for workflow code
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Liveness signal from a running activity
#[derive(Debug, Clone)]
pub struct Heartbeat {
    last: Arc<Mutex<Instant>>,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record progress
    pub fn beat(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last beat
    pub fn since_last(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Activity Options
// ============================================================================

/// Retry and timeout policy applied to every activity
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub retry: RetryPolicy,
    pub start_to_close: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            start_to_close: Duration::from_secs(3600),
            heartbeat_timeout: Duration::from_secs(300),
        }
    }
}

impl From<&Config> for ActivityOptions {
    fn from(config: &Config) -> Self {
        Self {
            retry: config.retry_policy(),
            start_to_close: Duration::from_secs(config.retry.activity_timeout_secs),
            heartbeat_timeout: Duration::from_secs(config.retry.heartbeat_timeout_secs),
        }
    }
}

// ============================================================================
// Workflow Context
// ============================================================================

/// Everything workflow code may touch
///
/// Orchestration logic reads time, sleeps, runs activities and persists
/// progress only through this trait.
#[async_trait]
pub trait WorkflowContext: Send + Sync {
    /// Current time as seen by the workflow
    fn now(&self) -> DateTime<Utc>;

    /// Run an activity under the retry and timeout policy
    async fn execute_activity(&self, activity: Activity) -> Result<ActivityReport>;

    /// Durable timer; fails with [`Error::Cancelled`] if the run is cancelled
    async fn sleep(&self, duration: Duration) -> Result<()>;

    /// Checkpoint and state storage
    fn checkpoints(&self) -> &dyn CheckpointStore;
}

// ============================================================================
// Local Runtime
// ============================================================================

/// Final result of a run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub state: WorkflowState,
    pub stats: ProcessingStats,
    pub continuations: u32,
}

/// In-process substrate driving [`PhaseOrchestrator`]
pub struct LocalRuntime {
    handler: Arc<dyn ActivityHandler>,
    checkpoints: SharedCheckpointStore,
    clock: Arc<dyn Clock>,
    options: ActivityOptions,
    orchestrator: PhaseOrchestrator,
    max_continuations: u32,
    cancel: CancellationToken,
}

impl LocalRuntime {
    pub fn new(handler: Arc<dyn ActivityHandler>, checkpoints: SharedCheckpointStore) -> Self {
        Self {
            handler,
            checkpoints,
            clock: Arc::new(SystemClock),
            options: ActivityOptions::default(),
            orchestrator: PhaseOrchestrator::default(),
            max_continuations: 48,
            cancel: CancellationToken::new(),
        }
    }

    /// Runtime configured from the application settings
    pub fn from_config(
        handler: Arc<dyn ActivityHandler>,
        checkpoints: SharedCheckpointStore,
        config: &Config,
    ) -> Self {
        Self::new(handler, checkpoints)
            .with_options(ActivityOptions::from(config))
            .with_orchestrator(PhaseOrchestrator::from(config))
            .with_max_continuations(config.sync.max_continuations)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_options(mut self, options: ActivityOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: PhaseOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    pub fn with_max_continuations(mut self, max_continuations: u32) -> Self {
        self.max_continuations = max_continuations;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels every run driven by this runtime
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start a new run with a random id
    pub async fn start(&self, input: WorkflowInput) -> Result<RunOutcome> {
        self.start_with_id(&Uuid::new_v4().to_string(), input).await
    }

    /// Start a new run under a caller-chosen id
    pub async fn start_with_id(&self, run_id: &str, input: WorkflowInput) -> Result<RunOutcome> {
        if self.checkpoints.load_checkpoint(run_id)?.is_some() {
            return Err(Error::validation(format!("run {run_id} already exists")));
        }

        let now = self.clock.now();
        let state = WorkflowState::new(run_id, input.kind, now);
        let checkpoint = WorkflowCheckpoint::new(run_id, input, now);

        self.checkpoints.save_state(&state)?;
        self.checkpoints.save_checkpoint(&checkpoint)?;

        info!(run_id = %run_id, kind = %state.workflow_type, "Workflow started");
        self.drive(checkpoint, state).await
    }

    /// Continue a run from its last checkpoint
    ///
    /// Completed runs are returned as they are; rate-limited and failed runs
    /// pick up at their first unfinished phase.
    pub async fn resume(&self, run_id: &str) -> Result<RunOutcome> {
        let checkpoint = self
            .checkpoints
            .load_checkpoint(run_id)?
            .ok_or_else(|| Error::validation(format!("no checkpoint for run {run_id}")))?;

        let state = match self.checkpoints.load_state(run_id)? {
            Some(state) => state,
            None => WorkflowState::new(run_id, checkpoint.input.kind, checkpoint.updated_at),
        };

        if state.status == WorkflowStatus::Completed && checkpoint.is_complete() {
            info!(run_id = %run_id, "Workflow already completed");
            return Ok(RunOutcome {
                run_id: run_id.to_string(),
                stats: checkpoint.stats,
                continuations: checkpoint.continuations,
                state,
            });
        }

        info!(
            run_id = %run_id,
            status = %state.status,
            next_phase = ?checkpoint.next_phase(),
            "Resuming workflow"
        );
        self.drive(checkpoint, state).await
    }

    /// Execute, honouring continuation requests up to the configured bound
    async fn drive(
        &self,
        mut checkpoint: WorkflowCheckpoint,
        mut state: WorkflowState,
    ) -> Result<RunOutcome> {
        let run_id = checkpoint.run_id.clone();

        loop {
            match self.orchestrator.execute(self, checkpoint, state).await? {
                Execution::Completed {
                    checkpoint: done,
                    state: final_state,
                } => {
                    info!(
                        run_id = %run_id,
                        units = done.stats.units_completed,
                        records = done.stats.records_fetched,
                        continuations = done.continuations,
                        "Workflow completed"
                    );
                    return Ok(RunOutcome {
                        run_id,
                        stats: done.stats,
                        continuations: done.continuations,
                        state: final_state,
                    });
                }
                Execution::ContinueAsNew {
                    checkpoint: suspended,
                    state: mut suspended_state,
                    delay,
                    reason,
                } => {
                    if suspended.continuations > self.max_continuations {
                        let message = format!(
                            "gave up after {} continuations: {reason}",
                            self.max_continuations
                        );
                        suspended_state.mark_failed(message.clone(), self.clock.now());
                        self.checkpoints.save_state(&suspended_state)?;
                        error!(run_id = %run_id, "{message}");
                        return Err(Error::other(message));
                    }

                    info!(
                        run_id = %run_id,
                        continuation = suspended.continuations,
                        delay_secs = delay.as_secs(),
                        "Continuing as new after delay"
                    );

                    if let Err(e) = self.sleep(delay).await {
                        suspended_state.mark_failed(e.to_string(), self.clock.now());
                        self.checkpoints.save_state(&suspended_state)?;
                        return Err(e);
                    }

                    // The next execution sees only what was persisted
                    checkpoint = self
                        .checkpoints
                        .load_checkpoint(&run_id)?
                        .ok_or_else(|| Error::Persistence(format!("checkpoint for {run_id} vanished")))?;
                    state = self
                        .checkpoints
                        .load_state(&run_id)?
                        .unwrap_or(suspended_state);
                }
            }
        }
    }

    /// One activity attempt under the start-to-close and heartbeat timeouts
    async fn attempt(&self, activity: &Activity) -> Result<ActivityReport> {
        let heartbeat = Heartbeat::new();
        let cancel = self.cancel.child_token();
        let started = Instant::now();

        let work = self.handler.execute(activity, heartbeat.clone(), cancel.clone());
        tokio::pin!(work);

        let deadline = tokio::time::sleep(self.options.start_to_close);
        tokio::pin!(deadline);

        let mut monitor =
            tokio::time::interval((self.options.heartbeat_timeout / 4).max(MIN_HEARTBEAT_CHECK));
        monitor.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let timed_out = |reason: &str| {
            cancel.cancel();
            let elapsed_ms = started.elapsed().as_millis() as u64;
            warn!(activity = activity.name(), elapsed_ms, "Activity {reason}");
            Error::ActivityTimeout {
                activity: activity.name().to_string(),
                elapsed_ms,
            }
        };

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = &mut deadline => return Err(timed_out("exceeded start-to-close timeout")),
                _ = monitor.tick() => {
                    if heartbeat.since_last() > self.options.heartbeat_timeout {
                        return Err(timed_out("missed heartbeat"));
                    }
                }
            }
        }
    }
}

#[async_trait]
impl WorkflowContext for LocalRuntime {
    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn execute_activity(&self, activity: Activity) -> Result<ActivityReport> {
        let attempts = self.options.retry.maximum_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.attempt(&activity).await {
                Ok(report) => return Ok(report),
                // Rate limits go to the orchestrator, which suspends the run
                Err(e) if e.is_rate_limited() || !e.is_retryable() || attempt >= attempts => {
                    return Err(e)
                }
                Err(e) => {
                    let delay = self.options.retry.calculate_delay(attempt);
                    warn!(
                        activity = activity.name(),
                        attempt,
                        maximum_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Activity failed, retrying"
                    );
                    self.sleep(delay).await?;
                }
            }
        }
    }

    async fn sleep(&self, duration: Duration) -> Result<()> {
        if duration.is_zero() {
            return Ok(());
        }
        debug!(duration_ms = duration.as_millis() as u64, "Workflow sleeping");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }
}
