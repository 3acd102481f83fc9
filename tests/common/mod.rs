//! Common test utilities

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ranksync::api::{Dataset, LeaderboardApi, Page, PageRequest};
use ranksync::error::{Error, Result};
use ranksync::models::{
    BuildRecord, GearItem, RankingRecord, RateLimitInfo, Record, ReportRecord, SecondaryStats,
    WorkUnit,
};
use ranksync::ratelimit::retry::RetryPolicy;
use ranksync::ratelimit::{GovernorConfig, RateLimitGovernor};
use ranksync::storage::{SharedCheckpointStore, SharedRepository, SqliteCheckpointStore, SqliteRepository};
use ranksync::sync::{PaginatedFetcher, PlanConfig};
use ranksync::workflow::{ActivityOptions, LocalRuntime, PhaseOrchestrator, SuspendPolicy, SyncActivities};

/// Fixed instant used by fixtures
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

// ============================================================================
// Record Fixtures
// ============================================================================

pub fn ranking(player: &str, dungeon: u32, score: f64) -> Record {
    Record::Ranking(RankingRecord {
        season: "s1".into(),
        region: "eu".into(),
        dungeon,
        player: player.into(),
        realm: "draenor".into(),
        class_spec: "mage-frost".into(),
        keystone_level: 18,
        score,
        completed_at: t0(),
        report_code: None,
        fight_id: None,
    })
}

pub fn report(code: &str, fight_id: u32, dungeon: u32, score: f64) -> Record {
    Record::Report(ReportRecord {
        report_code: code.into(),
        fight_id,
        region: "eu".into(),
        dungeon,
        keystone_level: 18,
        score,
        duration_ms: 1_800_000,
        started_at: t0(),
    })
}

pub fn build(player: &str, spec: &str, dungeon: u32, score: f64) -> Record {
    Record::Build(BuildRecord {
        report_code: format!("r-{player}"),
        fight_id: dungeon,
        player: player.into(),
        class_spec: spec.into(),
        dungeon,
        score,
        item_level: 620.0,
        gear: vec![GearItem {
            slot: "head".into(),
            item_id: 1000 + dungeon,
            item_level: 620,
        }],
        talents: vec![1, 2, 3],
        stats: SecondaryStats {
            crit: 100,
            haste: 400,
            mastery: 200,
            versatility: 50,
        },
    })
}

/// Records the fake serves for one page of one unit
pub fn records_for(request: &PageRequest, count: usize) -> Vec<Record> {
    let dungeon = request.unit.dungeon();
    let prefix = format!("{}-p{}", request.unit.key().replace('/', "-"), request.page);

    (0..count)
        .map(|i| {
            let name = format!("{prefix}-{i}");
            match request.dataset {
                Dataset::Rankings => ranking(&name, dungeon, 100.0 + i as f64),
                Dataset::Reports => report(&name, i as u32, dungeon, 100.0 + i as f64),
                Dataset::Builds => {
                    let spec = match &request.unit {
                        WorkUnit::SpecDungeon { spec, .. } => spec.clone(),
                        WorkUnit::Leaderboard { .. } => "mage-frost".to_string(),
                    };
                    build(&name, &spec, dungeon, 100.0 + i as f64)
                }
            }
        })
        .collect()
}

/// Plenty of points left; waiting the short regeneration delay is enough
pub fn low_points_info() -> RateLimitInfo {
    RateLimitInfo {
        remaining_points: 50.0,
        points_per_hour: 3600.0,
        reset_in_secs: 3600,
        next_refresh: t0() + chrono::Duration::hours(1),
    }
}

pub fn exhausted_info() -> RateLimitInfo {
    RateLimitInfo {
        remaining_points: 0.5,
        points_per_hour: 3600.0,
        reset_in_secs: 90,
        next_refresh: t0() + chrono::Duration::seconds(90),
    }
}

// ============================================================================
// Scripted API
// ============================================================================

/// In-process [`LeaderboardApi`] with scripted pages and failures
///
/// Every unit serves `pages` full pages followed by an empty one.
pub struct ScriptedApi {
    page_size: usize,
    pages: u32,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<PageRequest>>,
    failing_units: HashSet<String>,
    /// Datasets that answer with a rate-limit error for the next N calls
    rate_limited: Mutex<HashMap<Dataset, usize>>,
    /// Unit keys that answer with a rate-limit error for the next N calls
    rate_limited_units: Mutex<HashMap<String, usize>>,
    /// Budget snapshots attached to successful responses, in order
    snapshots: Mutex<VecDeque<RateLimitInfo>>,
}

impl ScriptedApi {
    pub fn new(page_size: usize, pages: u32) -> Self {
        Self {
            page_size,
            pages,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            failing_units: HashSet::new(),
            rate_limited: Mutex::new(HashMap::new()),
            rate_limited_units: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(VecDeque::new()),
        }
    }

    /// Attach these snapshots to the next successful responses
    pub fn with_snapshots(self, snapshots: impl IntoIterator<Item = RateLimitInfo>) -> Self {
        self.snapshots.lock().extend(snapshots);
        self
    }

    /// Sleep before answering each request
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Answer every request for this unit key with a fatal API error
    pub fn failing_unit(mut self, key: &str) -> Self {
        self.failing_units.insert(key.to_string());
        self
    }

    /// Answer the next `times` requests for `dataset` with a rate-limit error
    pub fn rate_limit(&self, dataset: Dataset, times: usize) {
        self.rate_limited.lock().insert(dataset, times);
    }

    /// Answer the next `times` requests for this unit key with a rate-limit error
    pub fn rate_limit_unit(&self, key: &str, times: usize) {
        self.rate_limited_units.lock().insert(key.to_string(), times);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<PageRequest> {
        self.requests.lock().clone()
    }

    pub fn datasets_requested(&self) -> Vec<Dataset> {
        let mut seen = Vec::new();
        for request in self.requests.lock().iter() {
            if seen.last() != Some(&request.dataset) {
                seen.push(request.dataset);
            }
        }
        seen
    }
}

#[async_trait]
impl LeaderboardApi for ScriptedApi {
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut limited = self.rate_limited.lock();
            if let Some(remaining) = limited.get_mut(&request.dataset) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::rate_limit("points low", Some(low_points_info())));
                }
            }
        }

        {
            let mut limited = self.rate_limited_units.lock();
            if let Some(remaining) = limited.get_mut(&request.unit.key()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::rate_limit("points low", Some(low_points_info())));
                }
            }
        }

        if self.failing_units.contains(&request.unit.key()) {
            return Err(Error::Api {
                status: 400,
                message: format!("bad selector {}", request.unit),
                retryable: false,
            });
        }

        let count = if request.page <= self.pages {
            self.page_size
        } else {
            0
        };

        Ok(Page {
            records: records_for(request, count),
            rate_limit: self.snapshots.lock().pop_front(),
        })
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Unpaced governor whose trial requests follow the fast suspension delay
pub fn governor_config() -> GovernorConfig {
    GovernorConfig {
        requests_per_second: 10_000,
        regen_delay: Duration::from_millis(1),
        ..GovernorConfig::default()
    }
}

pub fn governor() -> Arc<RateLimitGovernor> {
    Arc::new(RateLimitGovernor::new(governor_config()))
}

pub fn fetcher(api: Arc<ScriptedApi>, page_size: usize, max_pages: u32) -> PaginatedFetcher {
    PaginatedFetcher::new(api, governor(), page_size, max_pages)
}

pub fn leaderboard_plan(regions: &[&str], dungeons: &[u32]) -> PlanConfig {
    PlanConfig {
        seasons: vec!["s1".into()],
        regions: regions.iter().map(|r| r.to_string()).collect(),
        dungeons: dungeons.to_vec(),
        specs: Vec::new(),
    }
}

pub fn spec_plan(specs: &[&str], dungeons: &[u32]) -> PlanConfig {
    PlanConfig {
        specs: specs.iter().map(|s| s.to_string()).collect(),
        dungeons: dungeons.to_vec(),
        ..Default::default()
    }
}

/// Fast activity policy for tests
pub fn fast_options() -> ActivityOptions {
    ActivityOptions {
        retry: RetryPolicy::with_delays(2, 1, 5),
        start_to_close: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(30),
    }
}

/// Suspension policy with millisecond delays
pub fn fast_suspend() -> PhaseOrchestrator {
    PhaseOrchestrator::new(SuspendPolicy {
        regen_delay: Duration::from_millis(1),
        backoff: RetryPolicy::with_delays(10, 1, 5),
    })
}

pub struct Harness {
    pub api: Arc<ScriptedApi>,
    pub repository: SharedRepository,
    pub checkpoints: SharedCheckpointStore,
}

impl Harness {
    pub fn new(api: ScriptedApi) -> Self {
        Self {
            api: Arc::new(api),
            repository: Arc::new(SqliteRepository::in_memory().unwrap()),
            checkpoints: Arc::new(SqliteCheckpointStore::in_memory().unwrap()),
        }
    }

    /// Runtime over this harness with millisecond retry and suspension delays
    pub fn runtime(&self, page_size: usize, max_pages: u32) -> LocalRuntime {
        self.runtime_with(governor_config(), fast_options(), page_size, max_pages)
    }

    /// Runtime with an explicit governor and activity policy
    pub fn runtime_with(
        &self,
        governor: GovernorConfig,
        options: ActivityOptions,
        page_size: usize,
        max_pages: u32,
    ) -> LocalRuntime {
        let fetcher = PaginatedFetcher::new(
            Arc::clone(&self.api) as Arc<dyn LeaderboardApi>,
            Arc::new(RateLimitGovernor::new(governor)),
            page_size,
            max_pages,
        );
        let activities = SyncActivities::new(fetcher, Arc::clone(&self.repository));
        LocalRuntime::new(Arc::new(activities), Arc::clone(&self.checkpoints))
            .with_options(options)
            .with_orchestrator(fast_suspend())
    }
}
