use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use ranksync::api::client::HttpLeaderboardClient;
use ranksync::config::Config;
use ranksync::models::RecordKind;
use ranksync::ratelimit::{GovernorConfig, RateLimitGovernor};
use ranksync::storage::{self, SharedRepository};
use ranksync::sync::{PaginatedFetcher, PlanConfig, WorkUnitPlanner};
use ranksync::workflow::{LocalRuntime, RunOutcome, SyncActivities, WorkflowInput, WorkflowKind};

/// Wire the API client, storage and runtime from configuration
fn build_runtime(config: &Config, cancel: CancellationToken) -> Result<(LocalRuntime, SharedRepository)> {
    let (repository, checkpoints) =
        storage::open(&config.storage).context("Failed to open storage")?;

    let api = Arc::new(HttpLeaderboardClient::new(&config.api).context("Failed to create API client")?);
    let governor = Arc::new(RateLimitGovernor::new(GovernorConfig::from(config)));
    let fetcher = PaginatedFetcher::new(
        api,
        governor,
        config.api.page_size,
        config.sync.pages_per_unit,
    );

    let activities = Arc::new(SyncActivities::new(fetcher, Arc::clone(&repository)));
    let runtime = LocalRuntime::from_config(activities, checkpoints, config).with_cancellation(cancel);

    Ok((runtime, repository))
}

/// Start a new run of `kind` over the plan at `plan_path`
pub async fn start(
    config: &Config,
    kind: WorkflowKind,
    plan_path: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    let plan = PlanConfig::from_file(plan_path)
        .with_context(|| format!("Failed to load plan: {}", plan_path.display()))?;

    // Reject empty dimensions before touching storage or the API
    let units = WorkUnitPlanner::plan(kind, &plan)?;

    println!("Starting {kind} run");
    println!("========================");
    println!("Work units: {}", units.len());
    println!("Phases: {}", phase_list(kind));

    let (runtime, repository) = build_runtime(config, cancel)?;
    let input = WorkflowInput::from_config(kind, plan, config);
    let outcome = runtime.start(input).await?;

    print_summary(&outcome, &repository)
}

/// Continue a persisted run
pub async fn resume(config: &Config, run_id: &str, cancel: CancellationToken) -> Result<()> {
    println!("Resuming run {run_id}");

    let (runtime, repository) = build_runtime(config, cancel)?;
    let outcome = runtime
        .resume(run_id)
        .await
        .with_context(|| format!("Run {run_id} did not complete"))?;

    print_summary(&outcome, &repository)
}

fn phase_list(kind: WorkflowKind) -> String {
    kind.phases()
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn print_summary(outcome: &RunOutcome, repository: &SharedRepository) -> Result<()> {
    let stats = &outcome.stats;

    println!("\nRun Summary");
    println!("===========");
    println!("Run ID: {}", outcome.run_id);
    println!("Status: {}", outcome.state.status);
    println!("Units completed: {}", stats.units_completed);
    println!("Units failed: {}", stats.units_failed);
    println!("Records fetched: {}", stats.records_fetched);
    println!(
        "New: {}  Updated: {}  Skipped: {}",
        stats.records_new, stats.records_updated, stats.records_skipped
    );
    println!("Pages fetched: {}", stats.pages_fetched);
    println!("Continuations: {}", outcome.continuations);

    if !stats.regions.is_empty() {
        println!("\nPer Region");
        println!("----------");
        for (region, r) in &stats.regions {
            println!(
                "{region:<10} units: {:>4}  failed: {:>3}  fetched: {:>6}  dungeons: {}",
                r.units_completed,
                r.units_failed,
                r.records_fetched,
                r.dungeons_processed.len()
            );
        }
    }

    println!("\nRepository");
    println!("----------");
    for kind in [
        RecordKind::Ranking,
        RecordKind::Report,
        RecordKind::Build,
        RecordKind::Analysis,
    ] {
        println!("{:<10} {}", kind.as_str(), repository.count(Some(kind))?);
    }

    Ok(())
}
