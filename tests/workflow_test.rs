//! End-to-end workflow runs against the scripted API

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{fast_options, governor_config, leaderboard_plan, spec_plan, Harness, ScriptedApi};
use ranksync::api::Dataset;
use ranksync::error::Error;
use ranksync::models::{RateLimitInfo, RecordKind, WorkflowStatus};
use ranksync::ratelimit::GovernorConfig;
use ranksync::workflow::{ActivityOptions, Phase, WorkflowInput, WorkflowKind};

fn input(kind: WorkflowKind, plan: ranksync::sync::PlanConfig) -> WorkflowInput {
    WorkflowInput {
        page_size: 2,
        pages_per_unit: 5,
        max_concurrency: 4,
        phase_cooldown_secs: 0,
        ..WorkflowInput::new(kind, plan)
    }
}

fn requests_for(harness: &Harness, dataset: Dataset) -> usize {
    harness
        .api
        .requests()
        .iter()
        .filter(|r| r.dataset == dataset)
        .count()
}

#[tokio::test]
async fn test_leaderboard_sync_runs_all_phases() {
    let harness = Harness::new(ScriptedApi::new(2, 1));
    let runtime = harness.runtime(2, 5);

    let outcome = runtime
        .start(input(
            WorkflowKind::LeaderboardSync,
            leaderboard_plan(&["eu", "us"], &[1, 2]),
        ))
        .await
        .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert_eq!(
        harness.api.datasets_requested(),
        vec![Dataset::Rankings, Dataset::Reports, Dataset::Builds]
    );

    // 4 units x 3 phases, 2 records each
    assert_eq!(outcome.stats.units_completed, 12);
    assert_eq!(outcome.stats.records_fetched, 24);
    assert_eq!(outcome.state.items_processed, 24);
    assert_eq!(outcome.stats.regions["eu"].dungeons_processed.len(), 2);

    let repo = &harness.repository;
    assert_eq!(repo.count(Some(RecordKind::Ranking)).unwrap(), 8);
    assert_eq!(repo.count(Some(RecordKind::Report)).unwrap(), 8);
    assert_eq!(repo.count(Some(RecordKind::Build)).unwrap(), 8);
}

#[tokio::test]
async fn test_rate_limit_in_second_phase_resumes_without_repeating_first() {
    let harness = Harness::new(ScriptedApi::new(2, 1));
    harness.api.rate_limit(Dataset::Reports, 1);

    // No continuations allowed: the run stops at the first suspension
    let err = harness
        .runtime(2, 5)
        .with_max_continuations(0)
        .start_with_id(
            "run-rl",
            input(
                WorkflowKind::LeaderboardSync,
                leaderboard_plan(&["eu", "us"], &[1, 2]),
            ),
        )
        .await
        .unwrap_err();
    assert!(err.to_string().contains("continuations"));

    let checkpoint = harness.checkpoints.load_checkpoint("run-rl").unwrap().unwrap();
    assert!(checkpoint.completed_phases.contains(&Phase::Rankings));
    assert!(!checkpoint.completed_phases.contains(&Phase::Reports));
    assert!(!checkpoint.completed_phases.contains(&Phase::Builds));
    assert_eq!(checkpoint.next_phase(), Some(Phase::Reports));
    assert_eq!(checkpoint.continuations, 1);
    assert_eq!(requests_for(&harness, Dataset::Builds), 0);

    let rankings_before = requests_for(&harness, Dataset::Rankings);
    assert_eq!(rankings_before, 8);

    // Resume: phase 1 is not invoked again
    let outcome = harness.runtime(2, 5).resume("run-rl").await.unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert_eq!(requests_for(&harness, Dataset::Rankings), rankings_before);
    assert_eq!(
        harness.api.datasets_requested(),
        vec![Dataset::Rankings, Dataset::Reports, Dataset::Builds]
    );
    assert_eq!(
        harness.repository.count(Some(RecordKind::Report)).unwrap(),
        8
    );
}

#[tokio::test]
async fn test_rate_limit_continues_as_new_within_one_call() {
    let harness = Harness::new(ScriptedApi::new(2, 1));
    harness.api.rate_limit(Dataset::Builds, 2);

    let outcome = harness
        .runtime(2, 5)
        .start(input(
            WorkflowKind::LeaderboardSync,
            leaderboard_plan(&["eu"], &[1, 2, 3]),
        ))
        .await
        .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert!(outcome.continuations >= 1);
    assert_eq!(
        harness.repository.count(Some(RecordKind::Build)).unwrap(),
        6
    );
}

#[tokio::test]
async fn test_spec_analysis_persists_aggregates() {
    let harness = Harness::new(ScriptedApi::new(2, 1));

    let outcome = harness
        .runtime(2, 5)
        .start(input(
            WorkflowKind::SpecAnalysis,
            spec_plan(&["mage-frost", "rogue-sub"], &[1, 2]),
        ))
        .await
        .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);

    let repo = &harness.repository;
    // Builds are re-fetched by every analysis phase but stored once
    assert_eq!(repo.count(Some(RecordKind::Build)).unwrap(), 8);
    // One aggregate per unit per analysis kind
    assert_eq!(repo.count(Some(RecordKind::Analysis)).unwrap(), 12);

    let talent = repo
        .get(RecordKind::Analysis, "mage-frost:1:talent")
        .unwrap()
        .unwrap();
    assert_eq!(talent.score, 2.0);

    let stats = &outcome.stats;
    assert_eq!(stats.units_completed, 12);
    assert_eq!(stats.regions["global"].units_completed, 12);
}

#[tokio::test]
async fn test_rerun_is_a_no_op_for_the_store() {
    let harness = Harness::new(ScriptedApi::new(3, 2));
    let plan = leaderboard_plan(&["eu"], &[1, 2]);

    let first = harness
        .runtime(3, 5)
        .start(input(WorkflowKind::LeaderboardSync, plan.clone()))
        .await
        .unwrap();
    let stored_after_first = harness.repository.count(None).unwrap();

    let second = harness
        .runtime(3, 5)
        .start(input(WorkflowKind::LeaderboardSync, plan))
        .await
        .unwrap();

    assert_eq!(harness.repository.count(None).unwrap(), stored_after_first);
    assert_eq!(first.stats.records_new, stored_after_first as u64);
    assert_eq!(second.stats.records_new, 0);
    assert_eq!(second.stats.records_updated, 0);
    assert_eq!(second.stats.records_skipped, second.stats.records_fetched);
}

#[tokio::test]
async fn test_unit_failure_does_not_fail_the_run() {
    let harness = Harness::new(ScriptedApi::new(2, 1).failing_unit("s1/eu/2"));

    let outcome = harness
        .runtime(2, 5)
        .start_with_id(
            "run-partial",
            input(
                WorkflowKind::LeaderboardSync,
                leaderboard_plan(&["eu"], &[1, 2, 3]),
            ),
        )
        .await
        .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert_eq!(outcome.stats.units_failed, 3);
    assert_eq!(outcome.stats.units_completed, 6);
    assert_eq!(
        harness.repository.count(Some(RecordKind::Ranking)).unwrap(),
        4
    );
}

#[tokio::test]
async fn test_invalid_plan_rejected_before_any_request() {
    let harness = Harness::new(ScriptedApi::new(2, 1));

    let err = harness
        .runtime(2, 5)
        .start_with_id(
            "run-bad",
            input(WorkflowKind::LeaderboardSync, leaderboard_plan(&[], &[1])),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)));
    assert!(!err.is_retryable());
    assert_eq!(harness.api.calls(), 0);

    let state = harness.checkpoints.load_state("run-bad").unwrap().unwrap();
    assert_eq!(state.status, WorkflowStatus::Failed);
}

#[tokio::test]
async fn test_completed_run_resume_returns_stored_outcome() {
    let harness = Harness::new(ScriptedApi::new(2, 1));
    harness
        .runtime(2, 5)
        .start_with_id(
            "run-done",
            input(WorkflowKind::LeaderboardSync, leaderboard_plan(&["eu"], &[1])),
        )
        .await
        .unwrap();
    let calls = harness.api.calls();

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        harness.runtime(2, 5).resume("run-done"),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert_eq!(outcome.stats.units_completed, 3);
    assert_eq!(harness.api.calls(), calls);
}

fn budget(remaining: f64) -> RateLimitInfo {
    RateLimitInfo {
        remaining_points: remaining,
        points_per_hour: 3600.0,
        reset_in_secs: 3600,
        next_refresh: Utc::now() + chrono::Duration::hours(1),
    }
}

#[tokio::test]
async fn test_budget_below_reserve_recovers_through_trial_request() {
    // The first answer drops below the reserve with an hour left in the window;
    // the trial request after the regeneration delay reports recovered points
    let harness =
        Harness::new(ScriptedApi::new(2, 2).with_snapshots([budget(5.0), budget(500.0)]));
    let governor = GovernorConfig {
        min_points_reserve: 10.0,
        ..governor_config()
    };

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        harness
            .runtime_with(governor, fast_options(), 2, 5)
            .with_max_continuations(5)
            .start(WorkflowInput {
                max_concurrency: 1,
                ..input(WorkflowKind::LeaderboardSync, leaderboard_plan(&["eu"], &[1]))
            }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert!(outcome.continuations >= 1);
    assert_eq!(outcome.stats.units_completed, 3);
    assert_eq!(
        harness.repository.count(Some(RecordKind::Ranking)).unwrap(),
        4
    );
}

#[tokio::test]
async fn test_resume_fetches_with_the_run_page_settings() {
    let harness = Harness::new(ScriptedApi::new(2, 3));
    harness.api.rate_limit(Dataset::Reports, 1);
    let run_input = WorkflowInput {
        page_size: 2,
        pages_per_unit: 2,
        ..input(WorkflowKind::LeaderboardSync, leaderboard_plan(&["eu"], &[1, 2]))
    };

    harness
        .runtime(2, 2)
        .with_max_continuations(0)
        .start_with_id("run-pages", run_input)
        .await
        .unwrap_err();

    // Resumed by a process whose configuration changed in between
    let outcome = harness.runtime(10, 5).resume("run-pages").await.unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    let requests = harness.api.requests();
    assert!(requests.iter().all(|r| r.page_size == 2), "{requests:?}");
    assert!(requests.iter().all(|r| r.page <= 2), "{requests:?}");
    // Two capped pages of two records per unit
    assert_eq!(
        harness.repository.count(Some(RecordKind::Report)).unwrap(),
        8
    );
}

#[tokio::test]
async fn test_repeated_unit_failure_counted_once_per_phase() {
    let harness = Harness::new(ScriptedApi::new(2, 1).failing_unit("s1/eu/2"));
    // Suspends the first phase after the failing unit already ran once
    harness.api.rate_limit_unit("s1/eu/3", 1);

    let outcome = harness
        .runtime(2, 5)
        .start(WorkflowInput {
            max_concurrency: 1,
            ..input(WorkflowKind::LeaderboardSync, leaderboard_plan(&["eu"], &[1, 2, 3]))
        })
        .await
        .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert!(outcome.continuations >= 1);
    assert_eq!(outcome.stats.units_failed, 3);
    assert_eq!(outcome.stats.regions["eu"].units_failed, 3);
    assert_eq!(outcome.stats.units_completed, 6);
}

#[tokio::test]
async fn test_slow_multi_page_unit_keeps_heartbeat_alive() {
    let harness =
        Harness::new(ScriptedApi::new(2, 3).with_delay(Duration::from_millis(60)));
    // One unit takes four requests, well past the heartbeat timeout
    let options = ActivityOptions {
        heartbeat_timeout: Duration::from_millis(150),
        ..fast_options()
    };

    let outcome = harness
        .runtime_with(governor_config(), options, 2, 5)
        .start(WorkflowInput {
            max_concurrency: 1,
            ..input(WorkflowKind::LeaderboardSync, leaderboard_plan(&["eu"], &[1]))
        })
        .await
        .unwrap();

    assert_eq!(outcome.state.status, WorkflowStatus::Completed);
    assert_eq!(outcome.stats.units_completed, 3);
    // No attempt was cut short and retried
    assert_eq!(harness.api.calls(), 12);
}
