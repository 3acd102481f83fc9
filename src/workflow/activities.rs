//! Typed phase activities
//!
//! Every phase maps to exactly one [`Activity`] variant, and a single
//! [`ActivityHandler`] executes all of them with an exhaustive match. The
//! handler is where real I/O happens: it fans the phase's work units out over
//! the [`BoundedConcurrencyExecutor`] and persists what it fetched.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::Dataset;
use crate::error::{Error, Result};
use crate::models::{AnalysisKind, BatchResult, BuildRecord, Record, WorkUnit};
use crate::storage::repository::{IdempotentRepository, SharedRepository};
use crate::sync::executor::{BoundedConcurrencyExecutor, ExecutionSummary, ProgressFn};
use crate::sync::fetcher::PaginatedFetcher;
use crate::sync::stats::StatsAggregator;
use crate::workflow::analysis;
use crate::workflow::runtime::Heartbeat;
use crate::workflow::Phase;

// ============================================================================
// Commands
// ============================================================================

/// Payload shared by every phase activity
#[derive(Clone)]
pub struct PhaseCommand {
    pub run_id: String,
    pub phase: Phase,
    pub units: Vec<WorkUnit>,
    pub max_concurrency: usize,

    /// Page limits the run was started with
    pub page_size: usize,
    pub pages_per_unit: u32,

    /// Progress of the phase; survives activity retries within one execution
    pub progress: Arc<StatsAggregator>,
}

impl fmt::Debug for PhaseCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseCommand")
            .field("run_id", &self.run_id)
            .field("phase", &self.phase)
            .field("units", &self.units.len())
            .field("max_concurrency", &self.max_concurrency)
            .field("page_size", &self.page_size)
            .field("pages_per_unit", &self.pages_per_unit)
            .finish()
    }
}

/// One invocation of a phase's work
#[derive(Debug, Clone)]
pub enum Activity {
    FetchRankings(PhaseCommand),
    FetchReports(PhaseCommand),
    FetchBuilds(PhaseCommand),
    AnalyzeEquipment(PhaseCommand),
    AnalyzeTalents(PhaseCommand),
    AnalyzeStats(PhaseCommand),
}

impl Activity {
    /// Activity responsible for the command's phase
    pub fn for_phase(command: PhaseCommand) -> Self {
        match command.phase {
            Phase::Rankings => Self::FetchRankings(command),
            Phase::Reports => Self::FetchReports(command),
            Phase::Builds => Self::FetchBuilds(command),
            Phase::EquipmentAnalysis => Self::AnalyzeEquipment(command),
            Phase::TalentAnalysis => Self::AnalyzeTalents(command),
            Phase::StatAnalysis => Self::AnalyzeStats(command),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FetchRankings(_) => "fetch_rankings",
            Self::FetchReports(_) => "fetch_reports",
            Self::FetchBuilds(_) => "fetch_builds",
            Self::AnalyzeEquipment(_) => "analyze_equipment",
            Self::AnalyzeTalents(_) => "analyze_talents",
            Self::AnalyzeStats(_) => "analyze_stats",
        }
    }

    pub fn command(&self) -> &PhaseCommand {
        match self {
            Self::FetchRankings(c)
            | Self::FetchReports(c)
            | Self::FetchBuilds(c)
            | Self::AnalyzeEquipment(c)
            | Self::AnalyzeTalents(c)
            | Self::AnalyzeStats(c) => c,
        }
    }

    pub fn phase(&self) -> Phase {
        self.command().phase
    }
}

/// What a finished phase activity reports back
#[derive(Debug, Clone)]
pub struct ActivityReport {
    pub phase: Phase,
    pub summary: ExecutionSummary,
}

/// Executes phase activities
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    /// Run one activity attempt
    ///
    /// Implementations call `heartbeat.beat()` while making progress and stop
    /// promptly once `cancel` fires.
    async fn execute(
        &self,
        activity: &Activity,
        heartbeat: Heartbeat,
        cancel: CancellationToken,
    ) -> Result<ActivityReport>;
}

// ============================================================================
// Production Handler
// ============================================================================

/// Fetches from the API and writes to the repository
#[derive(Clone)]
pub struct SyncActivities {
    fetcher: PaginatedFetcher,
    repository: SharedRepository,
}

impl SyncActivities {
    pub fn new(fetcher: PaginatedFetcher, repository: SharedRepository) -> Self {
        Self {
            fetcher,
            repository,
        }
    }
}

#[async_trait]
impl ActivityHandler for SyncActivities {
    async fn execute(
        &self,
        activity: &Activity,
        heartbeat: Heartbeat,
        cancel: CancellationToken,
    ) -> Result<ActivityReport> {
        let command = activity.command();
        let phase = command.phase;
        let _timer = crate::metrics::start_phase_timer(phase.as_str());

        info!(
            run_id = %command.run_id,
            activity = activity.name(),
            units = command.units.len(),
            "Activity started"
        );
        heartbeat.beat();

        let progress: ProgressFn = {
            let heartbeat = heartbeat.clone();
            Arc::new(move |_: &BatchResult| heartbeat.beat())
        };
        let fetcher = {
            let heartbeat = heartbeat.clone();
            self.fetcher
                .with_limits(command.page_size, command.pages_per_unit)
                .with_page_hook(Arc::new(move || heartbeat.beat()))
        };
        let executor =
            BoundedConcurrencyExecutor::new(command.max_concurrency).with_progress(progress);

        let summary = match activity {
            Activity::FetchRankings(_) | Activity::FetchReports(_) | Activity::FetchBuilds(_) => {
                let dataset = phase.dataset();
                executor
                    .run(
                        phase.as_str(),
                        command.units.clone(),
                        Arc::clone(&command.progress),
                        &cancel,
                        |unit, cancel| {
                            let fetcher = fetcher.clone();
                            let repository = Arc::clone(&self.repository);
                            let batch_id = batch_id(&command.run_id, phase, &unit);
                            async move {
                                fetcher
                                    .sync_unit(dataset, &unit, repository.as_ref(), &batch_id, &cancel)
                                    .await
                            }
                        },
                    )
                    .await?
            }
            Activity::AnalyzeEquipment(_)
            | Activity::AnalyzeTalents(_)
            | Activity::AnalyzeStats(_) => {
                let kind = phase
                    .analysis()
                    .ok_or_else(|| Error::validation(format!("{phase} is not an analysis phase")))?;
                executor
                    .run(
                        phase.as_str(),
                        command.units.clone(),
                        Arc::clone(&command.progress),
                        &cancel,
                        |unit, cancel| {
                            let fetcher = fetcher.clone();
                            let repository = Arc::clone(&self.repository);
                            let batch_id = batch_id(&command.run_id, phase, &unit);
                            async move {
                                analyze_unit(&fetcher, repository.as_ref(), kind, unit, &batch_id, &cancel)
                                    .await
                            }
                        },
                    )
                    .await?
            }
        };

        info!(
            run_id = %command.run_id,
            activity = activity.name(),
            succeeded = summary.succeeded(),
            failed = summary.failed(),
            skipped = summary.skipped,
            "Activity finished"
        );

        Ok(ActivityReport { phase, summary })
    }
}

fn batch_id(run_id: &str, phase: Phase, unit: &WorkUnit) -> String {
    format!("{run_id}/{phase}/{}", unit.key())
}

/// Fetch the builds of one (spec, dungeon) unit and persist them with their aggregate
async fn analyze_unit(
    fetcher: &PaginatedFetcher,
    repository: &dyn IdempotentRepository,
    kind: AnalysisKind,
    unit: WorkUnit,
    batch_id: &str,
    cancel: &CancellationToken,
) -> Result<BatchResult> {
    let WorkUnit::SpecDungeon { spec, dungeon } = &unit else {
        return Err(Error::validation(format!(
            "analysis needs a spec unit, got {unit}"
        )));
    };

    let started = Instant::now();
    let outcome = fetcher.fetch_unit(Dataset::Builds, &unit, cancel).await?;

    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let builds: Vec<BuildRecord> = outcome
        .records
        .iter()
        .filter_map(|record| match record {
            Record::Build(build) if build.class_spec == *spec => Some(build.clone()),
            _ => None,
        })
        .collect();

    let mut records: Vec<Record> = builds.iter().cloned().map(Record::Build).collect();
    if let Some(aggregate) = analysis::analyze(kind, spec, *dungeon, &builds) {
        records.push(Record::Analysis(aggregate));
    }

    let merged = repository.process_records(&records, batch_id)?;

    debug!(
        unit = %unit,
        analysis = kind.as_str(),
        builds = builds.len(),
        "Unit analyzed"
    );

    Ok(BatchResult {
        fetched: outcome.fetched(),
        stored: merged.new,
        updated: merged.updated,
        skipped: merged.skipped,
        pages: outcome.pages,
        duration_ms: started.elapsed().as_millis() as u64,
        ..BatchResult::new(unit.clone())
    })
}
