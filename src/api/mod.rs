//! Boundary to the external, rate-limited leaderboard API
//!
//! The engine only depends on [`LeaderboardApi`]: one paginated query per call,
//! returning a page of records plus the quota snapshot the server reported.
//! [`client::HttpLeaderboardClient`] is the production implementation; tests
//! substitute scripted fakes.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::Result;
use crate::models::{RateLimitInfo, Record, WorkUnit};

/// Queryable data family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Rankings,
    Reports,
    Builds,
}

impl Dataset {
    /// Path segment / label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rankings => "rankings",
            Self::Reports => "reports",
            Self::Builds => "builds",
        }
    }
}

impl std::fmt::Display for Dataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page query
#[derive(Debug, Clone, PartialEq)]
pub struct PageRequest {
    pub dataset: Dataset,
    pub unit: WorkUnit,
    /// 1-based page number
    pub page: u32,
    pub page_size: usize,
}

/// One page of results
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    pub rate_limit: Option<RateLimitInfo>,
}

/// Paginated query against the upstream API
#[async_trait]
pub trait LeaderboardApi: Send + Sync {
    /// Fetch a single page
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page>;
}

/// Thread-safe shared API handle
pub type SharedLeaderboardApi = Arc<dyn LeaderboardApi>;
