//! Sequential page fetching for one work unit
//!
//! [`PaginatedFetcher`] drives one logical query page by page until the API
//! returns an empty or partial page or the page cap is hit. Between pages it
//! polls the cancellation token, consults the rate-limit governor and feeds
//! every quota snapshot back into it. An optional page hook fires as pages
//! progress so callers can report liveness.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::api::{Dataset, PageRequest, SharedLeaderboardApi};
use crate::error::{Error, Result};
use crate::models::{BatchResult, Record, WorkUnit};
use crate::ratelimit::RateLimitGovernor;
use crate::storage::repository::IdempotentRepository;

/// Records collected for one unit
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub records: Vec<Record>,
    /// Pages requested, including a terminal empty page
    pub pages: u32,
}

impl FetchOutcome {
    pub fn fetched(&self) -> u64 {
        self.records.len() as u64
    }
}

/// Called once the pacing wait is over and again after every page
pub type PageHook = Arc<dyn Fn() + Send + Sync>;

/// Page-by-page fetcher bound to one API and governor
#[derive(Clone)]
pub struct PaginatedFetcher {
    api: SharedLeaderboardApi,
    governor: Arc<RateLimitGovernor>,
    page_size: usize,
    max_pages: u32,
    on_page: Option<PageHook>,
}

impl PaginatedFetcher {
    pub fn new(
        api: SharedLeaderboardApi,
        governor: Arc<RateLimitGovernor>,
        page_size: usize,
        max_pages: u32,
    ) -> Self {
        Self {
            api,
            governor,
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
            on_page: None,
        }
    }

    /// Same API and governor with other page limits
    pub fn with_limits(&self, page_size: usize, max_pages: u32) -> Self {
        Self {
            page_size: page_size.max(1),
            max_pages: max_pages.max(1),
            ..self.clone()
        }
    }

    pub fn with_page_hook(mut self, hook: PageHook) -> Self {
        self.on_page = Some(hook);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_pages(&self) -> u32 {
        self.max_pages
    }

    fn page_progress(&self) {
        if let Some(hook) = &self.on_page {
            hook();
        }
    }

    /// Fetch every page of one unit
    #[instrument(skip_all, fields(unit = %unit, dataset = %dataset))]
    pub async fn fetch_unit(
        &self,
        dataset: Dataset,
        unit: &WorkUnit,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let mut outcome = FetchOutcome::default();

        for page in 1..=self.max_pages {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.governor.check_budget()?;

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = self.governor.pace() => {}
            }
            self.page_progress();

            let request = PageRequest {
                dataset,
                unit: unit.clone(),
                page,
                page_size: self.page_size,
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                result = self.api.fetch_page(&request) => result,
            };
            outcome.pages = page;
            self.page_progress();

            let fetched = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    if let Some(info) = e.rate_limit_info() {
                        self.governor.observe(info.clone());
                    }
                    return Err(e);
                }
            };

            if let Some(info) = fetched.rate_limit {
                self.governor.observe(info);
            }

            let count = fetched.records.len();
            debug!(page, records = count, "Page received");

            if count == 0 {
                break;
            }

            outcome.records.extend(fetched.records);

            if count < self.page_size {
                break;
            }
        }

        Ok(outcome)
    }

    /// Fetch a unit and merge its records into the repository
    ///
    /// Records are written only after the last page arrived, so a unit
    /// interrupted by cancellation or an error persists nothing.
    pub async fn sync_unit(
        &self,
        dataset: Dataset,
        unit: &WorkUnit,
        repository: &dyn IdempotentRepository,
        batch_id: &str,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        let started = Instant::now();
        let outcome = self.fetch_unit(dataset, unit, cancel).await?;

        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let merged = repository.process_records(&outcome.records, batch_id)?;

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
}
