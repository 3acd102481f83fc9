// Core data structures for the ranksync engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::workflow::WorkflowKind;

// ============================================================================
// Work Units
// ============================================================================

/// One independent fetch task, identified by its selector tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkUnit {
    /// One (season, region, dungeon) leaderboard slice
    Leaderboard {
        season: String,
        region: String,
        dungeon: u32,
    },
    /// One (class-spec, dungeon) build sample
    SpecDungeon { spec: String, dungeon: u32 },
}

impl WorkUnit {
    /// Dedup key used by the processed-combinations set
    pub fn key(&self) -> String {
        match self {
            Self::Leaderboard {
                season,
                region,
                dungeon,
            } => format!("{season}/{region}/{dungeon}"),
            Self::SpecDungeon { spec, dungeon } => format!("{spec}/{dungeon}"),
        }
    }

    /// Region bucket for per-region statistics
    pub fn region(&self) -> &str {
        match self {
            Self::Leaderboard { region, .. } => region,
            Self::SpecDungeon { .. } => "global",
        }
    }

    /// Dungeon selector shared by both unit shapes
    pub fn dungeon(&self) -> u32 {
        match self {
            Self::Leaderboard { dungeon, .. } | Self::SpecDungeon { dungeon, .. } => *dungeon,
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

// ============================================================================
// Rate Limit Snapshot
// ============================================================================

/// Remaining API budget as reported by the upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    /// Points left in the current window
    pub remaining_points: f64,

    /// Points granted per hour
    pub points_per_hour: f64,

    /// Seconds until the window resets
    pub reset_in_secs: u64,

    /// Absolute time of the next refresh
    pub next_refresh: DateTime<Utc>,
}

impl RateLimitInfo {
    /// Time until the budget is refilled
    pub fn reset_in(&self) -> Duration {
        Duration::from_secs(self.reset_in_secs)
    }

    /// Less than one point left
    pub fn is_exhausted(&self) -> bool {
        self.remaining_points < 1.0
    }
}

// ============================================================================
// Records
// ============================================================================

/// Stored record family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Ranking,
    Report,
    Build,
    Analysis,
}

impl RecordKind {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ranking => "ranking",
            Self::Report => "report",
            Self::Build => "build",
            Self::Analysis => "analysis",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ranking" => Ok(Self::Ranking),
            "report" => Ok(Self::Report),
            "build" => Ok(Self::Build),
            "analysis" => Ok(Self::Analysis),
            other => Err(crate::error::Error::Persistence(format!(
                "unknown record kind '{other}'"
            ))),
        }
    }
}

/// A completed run on a leaderboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
    pub season: String,
    pub region: String,
    pub dungeon: u32,
    pub player: String,
    pub realm: String,
    pub class_spec: String,
    pub keystone_level: u32,
    pub score: f64,
    pub completed_at: DateTime<Utc>,
    #[serde(default)]
    pub report_code: Option<String>,
    #[serde(default)]
    pub fight_id: Option<u32>,
}

/// One fight inside a combat report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub report_code: String,
    pub fight_id: u32,
    pub region: String,
    pub dungeon: u32,
    pub keystone_level: u32,
    pub score: f64,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
}

/// Equipped item in a character build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GearItem {
    pub slot: String,
    pub item_id: u32,
    pub item_level: u32,
}

/// Secondary stat ratings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryStats {
    pub crit: u32,
    pub haste: u32,
    pub mastery: u32,
    pub versatility: u32,
}

/// A character build captured from one fight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub report_code: String,
    pub fight_id: u32,
    pub player: String,
    pub class_spec: String,
    pub dungeon: u32,
    pub score: f64,
    pub item_level: f64,
    #[serde(default)]
    pub gear: Vec<GearItem>,
    #[serde(default)]
    pub talents: Vec<u32>,
    #[serde(default)]
    pub stats: SecondaryStats,
}

/// Aggregated analysis family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisKind {
    Equipment,
    Talent,
    Stat,
}

impl AnalysisKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equipment => "equipment",
            Self::Talent => "talent",
            Self::Stat => "stat",
        }
    }
}

/// Aggregate computed over the builds of one (spec, dungeon) unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub spec: String,
    pub dungeon: u32,
    pub analysis: AnalysisKind,
    pub sample_size: u64,
    pub summary: serde_json::Value,
}

/// Any record the repository can persist
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    Ranking(RankingRecord),
    Report(ReportRecord),
    Build(BuildRecord),
    Analysis(AnalysisRecord),
}

impl Record {
    /// Record family
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Ranking(_) => RecordKind::Ranking,
            Self::Report(_) => RecordKind::Report,
            Self::Build(_) => RecordKind::Build,
            Self::Analysis(_) => RecordKind::Analysis,
        }
    }

    /// Natural identity within the record family
    pub fn natural_key(&self) -> String {
        match self {
            Self::Ranking(r) => format!(
                "{}-{}:{}:{}",
                r.player,
                r.realm,
                r.dungeon,
                r.completed_at.timestamp()
            ),
            Self::Report(r) => format!("{}:{}", r.report_code, r.fight_id),
            Self::Build(r) => format!("{}:{}:{}", r.report_code, r.fight_id, r.player),
            Self::Analysis(r) => format!("{}:{}:{}", r.spec, r.dungeon, r.analysis.as_str()),
        }
    }

    /// Comparison metric for the best-wins merge
    pub fn metric(&self) -> f64 {
        match self {
            Self::Ranking(r) => r.score,
            Self::Report(r) => r.score,
            Self::Build(r) => r.score,
            Self::Analysis(r) => r.sample_size as f64,
        }
    }
}

// ============================================================================
// Unit Outcomes
// ============================================================================

/// Outcome of one work unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub unit: WorkUnit,
    pub fetched: u64,
    pub stored: u64,
    pub updated: u64,
    pub skipped: u64,
    pub pages: u32,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl BatchResult {
    /// Empty result for a unit
    pub fn new(unit: WorkUnit) -> Self {
        Self {
            unit,
            fetched: 0,
            stored: 0,
            updated: 0,
            skipped: 0,
            pages: 0,
            duration_ms: 0,
            error: None,
        }
    }

    /// Whether the unit finished without error
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

// ============================================================================
// Workflow State
// ============================================================================

/// Durable status of a workflow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    RateLimited,
    Completed,
    Failed,
}

impl WorkflowStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::RateLimited => "rate_limited",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed and failed runs are never updated again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "rate_limited" => Ok(Self::RateLimited),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(crate::error::Error::Persistence(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable record of one workflow run
///
/// Timestamps are always supplied by the caller so that orchestration code
/// never reads the wall clock directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub workflow_type: WorkflowKind,
    pub status: WorkflowStatus,
    pub last_processed_unit_key: Option<String>,
    pub items_processed: u64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl WorkflowState {
    /// Create a running state
    pub fn new(id: impl Into<String>, workflow_type: WorkflowKind, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            workflow_type,
            status: WorkflowStatus::Running,
            last_processed_unit_key: None,
            items_processed: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error_message: None,
        }
    }

    /// Record progress from a finished phase
    pub fn record_progress(&mut self, items: u64, last_unit: Option<String>, now: DateTime<Utc>) {
        self.items_processed += items;
        if last_unit.is_some() {
            self.last_processed_unit_key = last_unit;
        }
        self.updated_at = now;
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Running;
        self.error_message = None;
        self.updated_at = now;
    }

    pub fn mark_rate_limited(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = WorkflowStatus::RateLimited;
        self.error_message = Some(message.into());
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Completed;
        self.error_message = None;
        self.updated_at = now;
        self.completed_at = Some(now);
    }

    pub fn mark_failed(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        self.status = WorkflowStatus::Failed;
        self.error_message = Some(message.into());
        self.updated_at = now;
    }
}
