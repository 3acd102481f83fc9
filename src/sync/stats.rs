//! Thread-safe accumulation of per-unit outcomes
//!
//! [`StatsAggregator`] owns the only mutable state shared by concurrently
//! running units: the global/per-region counters and the sets of unit keys
//! already completed or failed. They change together in one critical section
//! so a unit is counted exactly when it becomes "processed", and a unit that
//! fails on several attempts is counted as failed once.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{BatchResult, WorkUnit};

/// Counters for one region
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionStats {
    pub units_completed: u64,
    pub units_failed: u64,
    pub records_fetched: u64,
    pub records_new: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub dungeons_processed: BTreeSet<u32>,
}

/// Global counters plus the per-region breakdown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub units_completed: u64,
    pub units_failed: u64,
    pub records_fetched: u64,
    pub records_new: u64,
    pub records_updated: u64,
    pub records_skipped: u64,
    pub pages_fetched: u64,
    pub duration_ms: u64,
    pub regions: BTreeMap<String, RegionStats>,
}

impl ProcessingStats {
    /// Fold one successful unit into the counters
    pub fn apply(&mut self, result: &BatchResult) {
        self.units_completed += 1;
        self.records_fetched += result.fetched;
        self.records_new += result.stored;
        self.records_updated += result.updated;
        self.records_skipped += result.skipped;
        self.pages_fetched += u64::from(result.pages);
        self.duration_ms += result.duration_ms;

        let region = self.regions.entry(result.unit.region().to_string()).or_default();
        region.units_completed += 1;
        region.records_fetched += result.fetched;
        region.records_new += result.stored;
        region.records_updated += result.updated;
        region.records_skipped += result.skipped;
        region.dungeons_processed.insert(result.unit.dungeon());
    }

    /// Count a failed unit; it contributes nothing else
    pub fn apply_failure(&mut self, unit: &WorkUnit) {
        self.units_failed += 1;
        self.regions
            .entry(unit.region().to_string())
            .or_default()
            .units_failed += 1;
    }

    /// Take back a failure once the unit succeeds on a later attempt
    pub fn revoke_failure(&mut self, unit: &WorkUnit) {
        self.units_failed = self.units_failed.saturating_sub(1);
        if let Some(region) = self.regions.get_mut(unit.region()) {
            region.units_failed = region.units_failed.saturating_sub(1);
        }
    }

    /// Records that changed the store
    pub fn records_stored(&self) -> u64 {
        self.records_new + self.records_updated
    }
}

#[derive(Debug, Default)]
struct Aggregate {
    stats: ProcessingStats,
    processed: BTreeSet<String>,
    failed: BTreeSet<String>,
    last_unit: Option<String>,
}

/// Consistent view of an aggregator at one instant
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressSnapshot {
    pub stats: ProcessingStats,
    pub processed: BTreeSet<String>,
    /// Keys whose last attempt failed
    pub failed: BTreeSet<String>,
    /// Most recently merged unit key
    pub last_unit: Option<String>,
}

/// Mutex-guarded accumulator handed by reference to the executor
#[derive(Debug, Default)]
pub struct StatsAggregator {
    inner: Mutex<Aggregate>,
}

impl StatsAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Continue from checkpointed progress
    pub fn resume(stats: ProcessingStats, processed: BTreeSet<String>) -> Self {
        Self {
            inner: Mutex::new(Aggregate {
                stats,
                processed,
                failed: BTreeSet::new(),
                last_unit: None,
            }),
        }
    }

    /// Keys already counted as failed in `stats`
    pub fn with_failed(self, failed: BTreeSet<String>) -> Self {
        self.inner.lock().failed = failed;
        self
    }

    /// Whether a unit key was already completed in this run
    pub fn is_processed(&self, key: &str) -> bool {
        self.inner.lock().processed.contains(key)
    }

    /// Merge a finished unit; returns false if the unit was already counted
    pub fn merge(&self, result: &BatchResult) -> bool {
        let key = result.unit.key();
        let mut inner = self.inner.lock();

        if !inner.processed.insert(key.clone()) {
            return false;
        }
        if inner.failed.remove(&key) {
            inner.stats.revoke_failure(&result.unit);
        }
        inner.stats.apply(result);
        inner.last_unit = Some(key);
        true
    }

    /// Count a failed unit; returns false if it was already counted
    pub fn record_failure(&self, unit: &WorkUnit) -> bool {
        let mut inner = self.inner.lock();
        if !inner.failed.insert(unit.key()) {
            return false;
        }
        inner.stats.apply_failure(unit);
        true
    }

    /// Consistent copy of the counters
    pub fn snapshot(&self) -> ProcessingStats {
        self.inner.lock().stats.clone()
    }

    /// Consistent copy of counters and processed keys
    pub fn progress(&self) -> ProgressSnapshot {
        let inner = self.inner.lock();
        ProgressSnapshot {
            stats: inner.stats.clone(),
            processed: inner.processed.clone(),
            failed: inner.failed.clone(),
            last_unit: inner.last_unit.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn unit(region: &str, dungeon: u32) -> WorkUnit {
        WorkUnit::Leaderboard {
            season: "s1".into(),
            region: region.into(),
            dungeon,
        }
    }

    fn result(unit: WorkUnit, fetched: u64, stored: u64, skipped: u64) -> BatchResult {
        BatchResult {
            fetched,
            stored,
            skipped,
            pages: 1,
            ..BatchResult::new(unit)
        }
    }

    #[test]
    fn test_merge_accumulates_per_region() {
        let aggregator = StatsAggregator::new();

        assert!(aggregator.merge(&result(unit("eu", 1), 10, 8, 2)));
        assert!(aggregator.merge(&result(unit("eu", 2), 5, 5, 0)));
        assert!(aggregator.merge(&result(unit("us", 1), 3, 1, 2)));

        let stats = aggregator.snapshot();
        assert_eq!(stats.units_completed, 3);
        assert_eq!(stats.records_fetched, 18);
        assert_eq!(stats.records_stored(), 14);
        assert_eq!(stats.records_skipped, 4);
        assert_eq!(stats.regions["eu"].dungeons_processed, BTreeSet::from([1, 2]));
        assert_eq!(stats.regions["us"].records_fetched, 3);
    }

    #[test]
    fn test_duplicate_merge_ignored() {
        let aggregator = StatsAggregator::new();
        let r = result(unit("eu", 1), 10, 10, 0);

        assert!(aggregator.merge(&r));
        assert!(!aggregator.merge(&r));
        assert_eq!(aggregator.snapshot().records_fetched, 10);
        assert!(aggregator.is_processed("s1/eu/1"));
        assert_eq!(aggregator.progress().last_unit.as_deref(), Some("s1/eu/1"));
    }

    #[test]
    fn test_failure_contributes_nothing() {
        let aggregator = StatsAggregator::new();
        aggregator.record_failure(&unit("kr", 4));

        let progress = aggregator.progress();
        assert_eq!(progress.stats.units_failed, 1);
        assert_eq!(progress.stats.records_fetched, 0);
        assert_eq!(progress.stats.regions["kr"].units_failed, 1);
        assert!(progress.processed.is_empty());
        assert!(progress.last_unit.is_none());
    }

    #[test]
    fn test_repeated_failure_counted_once() {
        let aggregator = StatsAggregator::new();

        assert!(aggregator.record_failure(&unit("eu", 2)));
        assert!(!aggregator.record_failure(&unit("eu", 2)));
        assert!(aggregator.record_failure(&unit("eu", 3)));

        let progress = aggregator.progress();
        assert_eq!(progress.stats.units_failed, 2);
        assert_eq!(progress.stats.regions["eu"].units_failed, 2);
        assert_eq!(progress.failed.len(), 2);

        // A later success takes the failure back
        assert!(aggregator.merge(&result(unit("eu", 3), 4, 4, 0)));
        let progress = aggregator.progress();
        assert_eq!(progress.stats.units_failed, 1);
        assert_eq!(progress.stats.regions["eu"].units_failed, 1);
        assert_eq!(progress.stats.units_completed, 1);
        assert!(!progress.failed.contains("s1/eu/3"));
    }

    #[test]
    fn test_resumed_failures_not_counted_again() {
        let first = StatsAggregator::new();
        first.record_failure(&unit("us", 1));
        let saved = first.progress();

        let resumed = StatsAggregator::resume(saved.stats, saved.processed).with_failed(saved.failed);
        assert!(!resumed.record_failure(&unit("us", 1)));
        assert_eq!(resumed.snapshot().units_failed, 1);
    }

    #[test]
    fn test_resume_keeps_processed_keys() {
        let mut stats = ProcessingStats::default();
        stats.units_completed = 2;
        let aggregator = StatsAggregator::resume(stats, BTreeSet::from(["s1/eu/1".to_string()]));

        assert!(aggregator.is_processed("s1/eu/1"));
        assert!(!aggregator.merge(&result(unit("eu", 1), 1, 1, 0)));
        assert_eq!(aggregator.snapshot().units_completed, 2);
    }

    #[test]
    fn test_concurrent_merges() {
        let aggregator = Arc::new(StatsAggregator::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let aggregator = Arc::clone(&aggregator);
                std::thread::spawn(move || {
                    for d in 0..50 {
                        aggregator.merge(&result(unit(&format!("r{i}"), d), 2, 1, 1));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = aggregator.snapshot();
        assert_eq!(stats.units_completed, 400);
        assert_eq!(stats.records_fetched, 800);
        assert_eq!(stats.regions.len(), 8);
    }
}
