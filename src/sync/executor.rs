//! Bounded concurrent execution of work units
//!
//! [`BoundedConcurrencyExecutor`] runs every unit of a batch as its own task
//! behind a counting semaphore. Each unit is isolated: an error or a panic in
//! one unit is logged, counted as a failure and contributes nothing, while its
//! siblings keep running. The call returns only after every dispatched task
//! has finished.
//!
//! Two conditions stop dispatching early:
//!
//! - cancellation of the token, reported as [`Error::Cancelled`]
//! - a rate-limit family error from any unit, which is escalated to the caller
//!   once in-flight units have drained

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::{BatchResult, WorkUnit};
use crate::sync::stats::StatsAggregator;

/// Callback invoked after every finished unit
pub type ProgressFn = Arc<dyn Fn(&BatchResult) + Send + Sync>;

/// Outcome of one dispatched unit
#[derive(Debug)]
enum UnitOutcome {
    Completed(BatchResult),
    Failed(BatchResult),
    Cancelled,
    Escalated(Error),
}

/// Per-batch totals
#[derive(Debug, Clone, Default)]
pub struct ExecutionSummary {
    /// Units handed to a task
    pub dispatched: usize,

    /// Units skipped because they were already processed in this run
    pub skipped: usize,

    /// One result per finished unit; failures carry their error
    pub results: Vec<BatchResult>,
}

impl ExecutionSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.iter().filter(|r| !r.succeeded()).count()
    }
}

/// Runs work units with a fixed concurrency ceiling
#[derive(Clone)]
pub struct BoundedConcurrencyExecutor {
    max_concurrency: usize,
    progress: Option<ProgressFn>,
}

impl BoundedConcurrencyExecutor {
    /// Create an executor; a ceiling of zero is treated as one
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            progress: None,
        }
    }

    /// Invoke `progress` after each unit finishes
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Execute `task` for every unit not yet processed
    ///
    /// `label` names the batch in logs and metrics. Successful results are
    /// merged into `aggregator` as each unit finishes; units already marked
    /// processed there are skipped without dispatch.
    pub async fn run<F, Fut>(
        &self,
        label: &str,
        units: Vec<WorkUnit>,
        aggregator: Arc<StatsAggregator>,
        cancel: &CancellationToken,
        task: F,
    ) -> Result<ExecutionSummary>
    where
        F: Fn(WorkUnit, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = Result<BatchResult>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let halted = Arc::new(AtomicBool::new(false));
        let label: Arc<str> = Arc::from(label);
        let mut tasks = JoinSet::new();
        let mut summary = ExecutionSummary::default();
        let mut cancelled = false;

        info!(
            batch = %label,
            units = units.len(),
            max_concurrency = self.max_concurrency,
            "Executing work units"
        );

        for unit in units {
            if aggregator.is_processed(&unit.key()) {
                debug!(unit = %unit, "Unit already processed, skipping");
                summary.skipped += 1;
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            // A sibling may have hit the rate limit while we waited for a slot
            if halted.load(Ordering::Acquire) {
                break;
            }

            summary.dispatched += 1;
            let future = task(unit.clone(), cancel.clone());
            let aggregator = Arc::clone(&aggregator);
            let halted = Arc::clone(&halted);
            let progress = self.progress.clone();
            let label = Arc::clone(&label);

            tasks.spawn(async move {
                let _permit = permit;
                let result = match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::other(format!("unit {unit} panicked"))),
                };

                let outcome = settle(&label, unit, result, &aggregator, &halted);
                if let (Some(progress), UnitOutcome::Completed(r) | UnitOutcome::Failed(r)) =
                    (progress.as_ref(), &outcome)
                {
                    progress(r);
                }
                outcome
            });
        }

        let mut escalation: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(UnitOutcome::Completed(result)) | Ok(UnitOutcome::Failed(result)) => {
                    summary.results.push(result);
                }
                Ok(UnitOutcome::Cancelled) => cancelled = true,
                Ok(UnitOutcome::Escalated(err)) => {
                    if escalation.is_none() {
                        escalation = Some(err);
                    }
                }
                Err(e) => warn!(batch = %label, error = %e, "Unit task aborted"),
            }
        }

        info!(
            batch = %label,
            dispatched = summary.dispatched,
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped,
            "Work units finished"
        );

        if cancelled || cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        if let Some(err) = escalation {
            warn!(batch = %label, error = %err, "Escalating rate limit after barrier");
            return Err(err);
        }

        Ok(summary)
    }
}

/// Classify a finished unit and fold it into the aggregate
fn settle(
    label: &str,
    unit: WorkUnit,
    result: Result<BatchResult>,
    aggregator: &StatsAggregator,
    halted: &AtomicBool,
) -> UnitOutcome {
    match result {
        Ok(batch) => {
            aggregator.merge(&batch);
            crate::metrics::record_unit(label, "completed");
            debug!(
                unit = %batch.unit,
                fetched = batch.fetched,
                stored = batch.stored,
                skipped = batch.skipped,
                "Unit completed"
            );
            UnitOutcome::Completed(batch)
        }
        Err(Error::Cancelled) => {
            crate::metrics::record_unit(label, "cancelled");
            debug!(unit = %unit, "Unit cancelled");
            UnitOutcome::Cancelled
        }
        Err(err) if err.is_rate_limited() => {
            halted.store(true, Ordering::Release);
            crate::metrics::record_unit(label, "rate_limited");
            warn!(unit = %unit, error = %err, "Unit hit rate limit, halting dispatch");
            UnitOutcome::Escalated(err)
        }
        Err(err) => {
            aggregator.record_failure(&unit);
            crate::metrics::record_unit(label, "failed");
            warn!(unit = %unit, error = %err, category = %err.category(), "Unit failed");
            UnitOutcome::Failed(BatchResult {
                error: Some(err.to_string()),
                ..BatchResult::new(unit)
            })
        }
    }
}
