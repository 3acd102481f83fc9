//! Multi-phase workflows
//!
//! A workflow run walks a fixed, declared sequence of [`Phase`]s. Each phase is
//! executed by one typed activity (see [`activities`]); the
//! [`orchestrator::PhaseOrchestrator`] sequences them and the
//! [`runtime::LocalRuntime`] provides retry, timeouts, heartbeats and
//! continuation across rate-limit pauses.
//!
//! # Workflow kinds
//!
//! | Kind | Units | Phases |
//! |------|-------|--------|
//! | `leaderboard_sync` | season × region × dungeon | rankings → reports → builds |
//! | `spec_analysis` | spec × dungeon | equipment → talent → stat analysis |

pub mod activities;
pub mod analysis;
pub mod orchestrator;
pub mod runtime;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::api::Dataset;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::AnalysisKind;
use crate::sync::planner::PlanConfig;

pub use activities::{Activity, ActivityHandler, ActivityReport, PhaseCommand, SyncActivities};
pub use orchestrator::{Execution, PhaseOrchestrator, SuspendPolicy};
pub use runtime::{
    ActivityOptions, Clock, Heartbeat, LocalRuntime, ManualClock, RunOutcome, SystemClock,
    WorkflowContext,
};

// ============================================================================
// Workflow Kinds
// ============================================================================

/// Workflow families with their own unit dimensions and phase order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowKind {
    LeaderboardSync,
    SpecAnalysis,
}

const LEADERBOARD_PHASES: &[Phase] = &[Phase::Rankings, Phase::Reports, Phase::Builds];

const ANALYSIS_PHASES: &[Phase] = &[
    Phase::EquipmentAnalysis,
    Phase::TalentAnalysis,
    Phase::StatAnalysis,
];

impl WorkflowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeaderboardSync => "leaderboard_sync",
            Self::SpecAnalysis => "spec_analysis",
        }
    }

    /// Phases in execution order
    pub fn phases(&self) -> &'static [Phase] {
        match self {
            Self::LeaderboardSync => LEADERBOARD_PHASES,
            Self::SpecAnalysis => ANALYSIS_PHASES,
        }
    }
}

impl FromStr for WorkflowKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "leaderboard_sync" => Ok(Self::LeaderboardSync),
            "spec_analysis" => Ok(Self::SpecAnalysis),
            other => Err(Error::Persistence(format!(
                "unknown workflow type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for WorkflowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Phases
// ============================================================================

/// One step of a workflow
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Rankings,
    Reports,
    Builds,
    EquipmentAnalysis,
    TalentAnalysis,
    StatAnalysis,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rankings => "rankings",
            Self::Reports => "reports",
            Self::Builds => "builds",
            Self::EquipmentAnalysis => "equipment_analysis",
            Self::TalentAnalysis => "talent_analysis",
            Self::StatAnalysis => "stat_analysis",
        }
    }

    /// Dataset fetched by this phase
    pub fn dataset(&self) -> Dataset {
        match self {
            Self::Rankings => Dataset::Rankings,
            Self::Reports => Dataset::Reports,
            Self::Builds
            | Self::EquipmentAnalysis
            | Self::TalentAnalysis
            | Self::StatAnalysis => Dataset::Builds,
        }
    }

    /// Aggregate produced by an analysis phase
    pub fn analysis(&self) -> Option<AnalysisKind> {
        match self {
            Self::EquipmentAnalysis => Some(AnalysisKind::Equipment),
            Self::TalentAnalysis => Some(AnalysisKind::Talent),
            Self::StatAnalysis => Some(AnalysisKind::Stat),
            _ => None,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Workflow Input
// ============================================================================

/// Everything a run needs; carried unchanged across continuations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInput {
    pub kind: WorkflowKind,
    pub plan: PlanConfig,
    pub pages_per_unit: u32,
    pub page_size: usize,
    pub max_concurrency: usize,
    pub phase_cooldown_secs: u64,
}

impl WorkflowInput {
    /// Input with default execution settings
    pub fn new(kind: WorkflowKind, plan: PlanConfig) -> Self {
        Self {
            kind,
            plan,
            pages_per_unit: 5,
            page_size: 100,
            max_concurrency: 4,
            phase_cooldown_secs: 2,
        }
    }

    /// Input with execution settings taken from the configuration
    pub fn from_config(kind: WorkflowKind, plan: PlanConfig, config: &Config) -> Self {
        Self {
            kind,
            plan,
            pages_per_unit: config.sync.pages_per_unit,
            page_size: config.api.page_size,
            max_concurrency: config.sync.max_concurrency,
            phase_cooldown_secs: config.sync.phase_cooldown_secs,
        }
    }
}
