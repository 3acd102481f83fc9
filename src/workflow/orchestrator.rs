//! Phase sequencing
//!
//! [`PhaseOrchestrator`] is the workflow body. It is a pure state machine
//! over a [`WorkflowCheckpoint`]: every input it needs (time, activity
//! results, timers, storage) comes through the [`WorkflowContext`], so
//! re-executing it from the same checkpoint takes the same decisions.
//!
//! ```text
//! NotStarted ─▶ Running(phase₁) ─▶ … ─▶ Running(phaseₙ) ─▶ Completed
//!                    │                        │
//!                    ├── rate limit ─▶ RateLimited ─▶ continue as new
//!                    └── other error ─▶ Failed
//! ```

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::WorkflowState;
use crate::ratelimit::retry::RetryPolicy;
use crate::storage::checkpoint::WorkflowCheckpoint;
use crate::sync::planner::WorkUnitPlanner;
use crate::sync::stats::StatsAggregator;
use crate::workflow::activities::{Activity, PhaseCommand};
use crate::workflow::runtime::WorkflowContext;

/// Delay selection for rate-limit suspensions
#[derive(Debug, Clone)]
pub struct SuspendPolicy {
    /// Short wait for point regeneration
    pub regen_delay: Duration,

    /// Backoff when the error carries no budget information
    pub backoff: RetryPolicy,
}

impl Default for SuspendPolicy {
    fn default() -> Self {
        Self {
            regen_delay: Duration::from_secs(5),
            backoff: RetryPolicy::with_delays(u32::MAX, 60_000, 3_600_000),
        }
    }
}

/// Result of one workflow execution
#[derive(Debug)]
pub enum Execution {
    /// All phases finished
    Completed {
        checkpoint: WorkflowCheckpoint,
        state: WorkflowState,
    },

    /// Rate limited; run again with the persisted checkpoint after `delay`
    ContinueAsNew {
        checkpoint: WorkflowCheckpoint,
        state: WorkflowState,
        delay: Duration,
        reason: String,
    },
}

/// Sequences the phases of a workflow run
#[derive(Debug, Clone, Default)]
pub struct PhaseOrchestrator {
    policy: SuspendPolicy,
}

impl From<&Config> for PhaseOrchestrator {
    fn from(config: &Config) -> Self {
        Self::new(SuspendPolicy {
            regen_delay: Duration::from_secs(config.sync.regen_delay_secs),
            backoff: config.retry_policy(),
        })
    }
}

impl PhaseOrchestrator {
    pub fn new(policy: SuspendPolicy) -> Self {
        Self { policy }
    }

    /// Execute the remaining phases of a run
    ///
    /// Completed phases are skipped. A rate-limit error from a phase persists
    /// progress and yields [`Execution::ContinueAsNew`]; any other error marks
    /// the run failed and is returned.
    pub async fn execute(
        &self,
        ctx: &dyn WorkflowContext,
        mut checkpoint: WorkflowCheckpoint,
        mut state: WorkflowState,
    ) -> Result<Execution> {
        let run_id = checkpoint.run_id.clone();
        let input = checkpoint.input.clone();

        let units = match WorkUnitPlanner::plan(input.kind, &input.plan) {
            Ok(units) => units,
            Err(e) => return Self::fail(ctx, &checkpoint, state, e),
        };

        state.mark_running(ctx.now());
        ctx.checkpoints().save_state(&state)?;

        while let Some(phase) = checkpoint.next_phase() {
            checkpoint.begin_phase(phase, ctx.now())?;
            ctx.checkpoints().save_checkpoint(&checkpoint)?;

            info!(run_id = %run_id, phase = %phase, units = units.len(), "Phase started");

            let fetched_before = checkpoint.stats.records_fetched;
            let progress = Arc::new(
                StatsAggregator::resume(checkpoint.stats.clone(), checkpoint.processed_for(phase))
                    .with_failed(checkpoint.failed_for(phase)),
            );

            let result = ctx
                .execute_activity(Activity::for_phase(PhaseCommand {
                    run_id: run_id.clone(),
                    phase,
                    units: units.clone(),
                    max_concurrency: input.max_concurrency,
                    page_size: input.page_size,
                    pages_per_unit: input.pages_per_unit,
                    progress: Arc::clone(&progress),
                }))
                .await;

            let snapshot = progress.progress();
            let now = ctx.now();
            let fetched = snapshot.stats.records_fetched.saturating_sub(fetched_before);
            checkpoint.record_progress(phase, &snapshot, now);
            state.record_progress(fetched, snapshot.last_unit, now);

            match result {
                Ok(report) => {
                    checkpoint.complete_phase(phase, now)?;
                    ctx.checkpoints().save_checkpoint(&checkpoint)?;
                    ctx.checkpoints().save_state(&state)?;

                    info!(
                        run_id = %run_id,
                        phase = %phase,
                        succeeded = report.summary.succeeded(),
                        failed = report.summary.failed(),
                        "Phase completed"
                    );

                    if checkpoint.next_phase().is_some() && input.phase_cooldown_secs > 0 {
                        if let Err(e) = ctx.sleep(Duration::from_secs(input.phase_cooldown_secs)).await {
                            return Self::fail(ctx, &checkpoint, state, e);
                        }
                    }
                }
                Err(e) if e.is_rate_limited() => {
                    checkpoint.continuations += 1;
                    state.mark_rate_limited(e.to_string(), now);
                    ctx.checkpoints().save_checkpoint(&checkpoint)?;
                    ctx.checkpoints().save_state(&state)?;
                    crate::metrics::record_suspension();

                    let delay = crate::ratelimit::retry_delay(
                        &e,
                        checkpoint.continuations,
                        self.policy.regen_delay,
                        &self.policy.backoff,
                    );

                    warn!(
                        run_id = %run_id,
                        phase = %phase,
                        continuation = checkpoint.continuations,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Phase rate limited, suspending"
                    );

                    return Ok(Execution::ContinueAsNew {
                        checkpoint,
                        state,
                        delay,
                        reason: e.to_string(),
                    });
                }
                Err(e) => return Self::fail(ctx, &checkpoint, state, e),
            }
        }

        state.mark_completed(ctx.now());
        ctx.checkpoints().save_state(&state)?;

        Ok(Execution::Completed { checkpoint, state })
    }

    /// Persist a terminal failure and surface the error
    fn fail(
        ctx: &dyn WorkflowContext,
        checkpoint: &WorkflowCheckpoint,
        mut state: WorkflowState,
        err: Error,
    ) -> Result<Execution> {
        state.mark_failed(err.to_string(), ctx.now());

        let saved = ctx
            .checkpoints()
            .save_checkpoint(checkpoint)
            .and_then(|()| ctx.checkpoints().save_state(&state));
        if let Err(save_err) = saved {
            error!(run_id = %state.id, error = %save_err, "Failed to persist failed state");
        }

        error!(
            run_id = %state.id,
            phase = ?checkpoint.current_phase,
            last_unit = ?state.last_processed_unit_key,
            category = %err.category(),
            error = %err,
            "Workflow failed"
        );
        Err(err)
    }
}
