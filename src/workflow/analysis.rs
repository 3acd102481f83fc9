//! Aggregation of character builds into analysis records
//!
//! Each analysis phase condenses the builds fetched for one (spec, dungeon)
//! unit into a single [`AnalysisRecord`]. The record's metric is its sample
//! size, so a later run only replaces it when it saw more builds.

use serde_json::json;
use std::collections::BTreeMap;

use crate::models::{AnalysisKind, AnalysisRecord, BuildRecord};

/// Most popular items kept per slot
const TOP_ITEMS_PER_SLOT: usize = 5;

/// Aggregate `builds` for one unit; `None` when there is nothing to aggregate
pub fn analyze(
    kind: AnalysisKind,
    spec: &str,
    dungeon: u32,
    builds: &[BuildRecord],
) -> Option<AnalysisRecord> {
    if builds.is_empty() {
        return None;
    }

    let summary = match kind {
        AnalysisKind::Equipment => equipment_summary(builds),
        AnalysisKind::Talent => talent_summary(builds),
        AnalysisKind::Stat => stat_summary(builds),
    };

    Some(AnalysisRecord {
        spec: spec.to_string(),
        dungeon,
        analysis: kind,
        sample_size: builds.len() as u64,
        summary,
    })
}

/// Sort counted keys by count descending, then key ascending
fn ranked<K: Ord + Copy>(counts: &BTreeMap<K, u64>) -> Vec<(K, u64)> {
    let mut ranked: Vec<(K, u64)> = counts.iter().map(|(k, c)| (*k, *c)).collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked
}

fn share(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

fn equipment_summary(builds: &[BuildRecord]) -> serde_json::Value {
    let mut slots: BTreeMap<&str, BTreeMap<u32, u64>> = BTreeMap::new();
    for build in builds {
        for item in &build.gear {
            *slots
                .entry(item.slot.as_str())
                .or_default()
                .entry(item.item_id)
                .or_default() += 1;
        }
    }

    let slots: serde_json::Map<String, serde_json::Value> = slots
        .iter()
        .map(|(slot, items)| {
            let total: u64 = items.values().sum();
            let top: Vec<_> = ranked(items)
                .into_iter()
                .take(TOP_ITEMS_PER_SLOT)
                .map(|(item_id, count)| {
                    json!({ "item_id": item_id, "count": count, "share": share(count, total) })
                })
                .collect();
            (slot.to_string(), json!(top))
        })
        .collect();

    let average_item_level =
        builds.iter().map(|b| b.item_level).sum::<f64>() / builds.len() as f64;

    json!({
        "average_item_level": average_item_level,
        "slots": slots,
    })
}

fn talent_summary(builds: &[BuildRecord]) -> serde_json::Value {
    let mut picks: BTreeMap<u32, u64> = BTreeMap::new();
    for build in builds {
        // A talent listed twice in one build is still one pick
        let mut talents = build.talents.clone();
        talents.sort_unstable();
        talents.dedup();
        for talent in talents {
            *picks.entry(talent).or_default() += 1;
        }
    }

    let total = builds.len() as u64;
    let rates: Vec<_> = ranked(&picks)
        .into_iter()
        .map(|(talent_id, count)| {
            json!({ "talent_id": talent_id, "count": count, "pick_rate": share(count, total) })
        })
        .collect();

    json!({ "talents": rates })
}

fn stat_summary(builds: &[BuildRecord]) -> serde_json::Value {
    let n = builds.len() as f64;
    let average = |f: fn(&BuildRecord) -> u32| builds.iter().map(|b| f64::from(f(b))).sum::<f64>() / n;

    let mut averages = vec![
        ("crit", average(|b| b.stats.crit)),
        ("haste", average(|b| b.stats.haste)),
        ("mastery", average(|b| b.stats.mastery)),
        ("versatility", average(|b| b.stats.versatility)),
    ];

    let map: serde_json::Map<String, serde_json::Value> = averages
        .iter()
        .map(|(name, value)| (name.to_string(), json!(value)))
        .collect();

    averages.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(b.0)));
    let priority: Vec<&str> = averages.iter().map(|(name, _)| *name).collect();

    json!({
        "averages": map,
        "priority": priority,
    })
}
