//! Work decomposition
//!
//! Expands a [`PlanConfig`] into the ordered cross product of work units for a
//! workflow kind. The order is fixed by the configuration order, so one run
//! always enumerates its units identically.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{Error, Result};
use crate::models::WorkUnit;
use crate::workflow::WorkflowKind;

/// Dimension sets to cross
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    #[serde(default)]
    pub seasons: Vec<String>,

    #[serde(default)]
    pub regions: Vec<String>,

    #[serde(default)]
    pub dungeons: Vec<u32>,

    /// Class-spec identifiers, e.g. `mage-frost`
    #[serde(default)]
    pub specs: Vec<String>,
}

impl PlanConfig {
    /// Load a plan from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| Error::config(format!("invalid plan {}: {e}", path.display())))
    }
}

/// Expands plans into work units
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkUnitPlanner;

impl WorkUnitPlanner {
    /// Reject plans that cannot produce work
    pub fn validate(kind: WorkflowKind, plan: &PlanConfig) -> Result<()> {
        match kind {
            WorkflowKind::LeaderboardSync => {
                require_non_empty("seasons", &plan.seasons)?;
                require_non_empty("regions", &plan.regions)?;
            }
            WorkflowKind::SpecAnalysis => {
                require_non_empty("specs", &plan.specs)?;
            }
        }

        if plan.dungeons.is_empty() {
            return Err(Error::validation("plan has no dungeons"));
        }

        Ok(())
    }

    /// Full cross product in configuration order, duplicates removed
    pub fn plan(kind: WorkflowKind, plan: &PlanConfig) -> Result<Vec<WorkUnit>> {
        Self::validate(kind, plan)?;

        let units: Vec<WorkUnit> = match kind {
            WorkflowKind::LeaderboardSync => plan
                .seasons
                .iter()
                .flat_map(|season| {
                    plan.regions.iter().flat_map(move |region| {
                        plan.dungeons.iter().map(move |&dungeon| WorkUnit::Leaderboard {
                            season: season.clone(),
                            region: region.clone(),
                            dungeon,
                        })
                    })
                })
                .collect(),
            WorkflowKind::SpecAnalysis => plan
                .specs
                .iter()
                .flat_map(|spec| {
                    plan.dungeons.iter().map(move |&dungeon| WorkUnit::SpecDungeon {
                        spec: spec.clone(),
                        dungeon,
                    })
                })
                .collect(),
        };

        let mut seen = HashSet::new();
        let planned: Vec<WorkUnit> = units.into_iter().filter(|u| seen.insert(u.key())).collect();

        tracing::debug!(kind = %kind, units = planned.len(), "Work units planned");
        Ok(planned)
    }
}

fn require_non_empty(name: &str, values: &[String]) -> Result<()> {
    if values.is_empty() {
        return Err(Error::validation(format!("plan has no {name}")));
    }
    if values.iter().any(|v| v.trim().is_empty()) {
        return Err(Error::validation(format!("plan has a blank entry in {name}")));
    }
    Ok(())
}
