//! ranksync - resumable, rate-limit aware leaderboard synchronization
//!
//! Ingests rankings, combat reports and character builds from a strictly
//! rate-limited third-party API and persists them durably, surviving partial
//! failures, hour-long quota pauses and process restarts.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Work units, records and durable run state
//! - [`ratelimit`] - API budget governance and retry policy
//! - [`api`] - Boundary to the upstream data API
//! - [`storage`] - Idempotent record repository and checkpoint stores
//! - [`sync`] - Work planning, bounded concurrent execution and pagination
//! - [`workflow`] - Phase orchestration on a local durable substrate
//! - [`metrics`] - Prometheus counters
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use ranksync::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let plan = PlanConfig::from_file("plan.toml".as_ref())?;
//!
//!     let (repository, checkpoints) = ranksync::storage::open(&config.storage)?;
//!     let api = Arc::new(HttpLeaderboardClient::new(&config.api)?);
//!     let governor = Arc::new(RateLimitGovernor::new(GovernorConfig::from(&config)));
//!     let fetcher = PaginatedFetcher::new(api, governor, config.api.page_size, config.sync.pages_per_unit);
//!
//!     let runtime = LocalRuntime::from_config(
//!         Arc::new(SyncActivities::new(fetcher, repository)),
//!         checkpoints,
//!         &config,
//!     );
//!     let input = WorkflowInput::from_config(WorkflowKind::LeaderboardSync, plan, &config);
//!     let outcome = runtime.start(input).await?;
//!     println!("{} records fetched", outcome.stats.records_fetched);
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod ratelimit;
pub mod storage;
pub mod sync;
pub mod workflow;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::api::client::HttpLeaderboardClient;
    pub use crate::api::{Dataset, LeaderboardApi, Page, PageRequest, SharedLeaderboardApi};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{
        BatchResult, RateLimitInfo, Record, RecordKind, WorkUnit, WorkflowState, WorkflowStatus,
    };
    pub use crate::ratelimit::{GovernorConfig, RateLimitGovernor};
    pub use crate::storage::{
        CheckpointStore, IdempotentRepository, SharedCheckpointStore, SharedRepository,
        WorkflowCheckpoint,
    };
    pub use crate::sync::{
        BoundedConcurrencyExecutor, PaginatedFetcher, PlanConfig, ProcessingStats,
        StatsAggregator, WorkUnitPlanner,
    };
    pub use crate::workflow::{
        LocalRuntime, Phase, PhaseOrchestrator, RunOutcome, SyncActivities, WorkflowInput,
        WorkflowKind,
    };
}

// Direct re-exports for convenience
pub use models::{BatchResult, WorkUnit, WorkflowState, WorkflowStatus};
