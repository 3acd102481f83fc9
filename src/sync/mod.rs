//! Work decomposition and execution
//!
//! - [`planner`] expands a plan into work units
//! - [`executor`] runs units under a concurrency ceiling
//! - [`fetcher`] pages through one unit against the API
//! - [`stats`] accumulates unit outcomes

pub mod executor;
pub mod fetcher;
pub mod planner;
pub mod stats;

pub use executor::{BoundedConcurrencyExecutor, ExecutionSummary, ProgressFn};
pub use fetcher::{FetchOutcome, PaginatedFetcher};
pub use planner::{PlanConfig, WorkUnitPlanner};
pub use stats::{ProcessingStats, ProgressSnapshot, RegionStats, StatsAggregator};
