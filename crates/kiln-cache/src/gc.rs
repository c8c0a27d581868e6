use crate::artifact_cache::ArtifactCacheEntry;
use crate::digest::Digest;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::PathBuf;

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Thresholds for artifact garbage collection.
///
/// Stages run in order (age, then per-target count, then total size) and none
/// of them ever removes the last remaining artifact of a target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcPolicy {
    /// Keep at most this many artifacts per target (newest by last use). `0` behaves like `1`.
    pub max_entries_per_target: usize,
    /// Artifacts unused for longer than this are evicted.
    pub max_age_ms: Option<u64>,
    /// Evict least-recently-used artifacts until the total is at or below this.
    pub max_total_bytes: Option<u64>,
}

impl Default for GcPolicy {
    fn default() -> Self {
        Self {
            max_entries_per_target: 3,
            max_age_ms: Some(30 * DAY_MS),
            max_total_bytes: Some(10 * 1024 * 1024 * 1024),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    Age,
    Count,
    Size,
}

/// One entry selected for eviction by [`plan_evictions`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PlannedEviction {
    /// Index into the slice passed to [`plan_evictions`].
    pub index: usize,
    pub reason: EvictionReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvictedArtifact {
    pub target_id: String,
    pub fingerprint: Digest,
    pub artifact_path: PathBuf,
    pub size_bytes: u64,
    pub reason: EvictionReason,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GcFailure {
    pub target_id: String,
    pub fingerprint: Digest,
    pub artifact_path: PathBuf,
    pub error: String,
}

/// Result summary of [`crate::ArtifactCache::collect_garbage`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub before_bytes: u64,
    pub after_bytes: u64,
    pub evicted: Vec<EvictedArtifact>,
    pub failed: Vec<GcFailure>,
}

impl GcReport {
    pub fn freed_bytes(&self) -> u64 {
        self.before_bytes.saturating_sub(self.after_bytes)
    }
}

/// Least recently used first, with deterministic tie-breaking.
fn lru_order(a: &ArtifactCacheEntry, b: &ArtifactCacheEntry) -> Ordering {
    a.last_used_at
        .cmp(&b.last_used_at)
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.target_id.cmp(&b.target_id))
        .then_with(|| a.fingerprint.cmp(&b.fingerprint))
}

/// Decides which entries `policy` evicts at time `now_millis`. Pure; touches no files.
///
/// Every target that has at least one entry in `entries` keeps at least one.
pub fn plan_evictions(
    entries: &[ArtifactCacheEntry],
    policy: &GcPolicy,
    now_millis: u64,
) -> Vec<PlannedEviction> {
    let mut alive: HashMap<&str, usize> = HashMap::new();
    for entry in entries {
        *alive.entry(entry.target_id.as_str()).or_default() += 1;
    }

    let mut oldest_first: Vec<usize> = (0..entries.len()).collect();
    oldest_first.sort_by(|&a, &b| lru_order(&entries[a], &entries[b]));

    let mut reasons: Vec<Option<EvictionReason>> = vec![None; entries.len()];
    let mut evict = |index: usize, reason: EvictionReason, reasons: &mut [Option<EvictionReason>]| {
        match alive.get_mut(entries[index].target_id.as_str()) {
            Some(count) if *count > 1 => {
                *count -= 1;
                reasons[index] = Some(reason);
                true
            }
            _ => false,
        }
    };

    if let Some(max_age_ms) = policy.max_age_ms {
        for &index in &oldest_first {
            if now_millis.saturating_sub(entries[index].last_used_at) > max_age_ms {
                evict(index, EvictionReason::Age, &mut reasons);
            }
        }
    }

    let keep = policy.max_entries_per_target.max(1);
    let mut kept: HashMap<&str, usize> = HashMap::new();
    for &index in oldest_first.iter().rev() {
        if reasons[index].is_some() {
            continue;
        }
        let seen = kept.entry(entries[index].target_id.as_str()).or_default();
        *seen += 1;
        if *seen > keep {
            evict(index, EvictionReason::Count, &mut reasons);
        }
    }

    if let Some(max_total_bytes) = policy.max_total_bytes {
        let mut total: u64 = (0..entries.len())
            .filter(|&index| reasons[index].is_none())
            .map(|index| entries[index].size_bytes)
            .sum();
        for &index in &oldest_first {
            if total <= max_total_bytes {
                break;
            }
            if reasons[index].is_some() {
                continue;
            }
            if evict(index, EvictionReason::Size, &mut reasons) {
                total = total.saturating_sub(entries[index].size_bytes);
            }
        }
    }

    oldest_first
        .into_iter()
        .filter_map(|index| reasons[index].map(|reason| PlannedEviction { index, reason }))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn entry(target: &str, n: u64, last_used_at: u64, size_bytes: u64) -> ArtifactCacheEntry {
        ArtifactCacheEntry {
            target_id: target.to_string(),
            fingerprint: Digest::from_bytes(format!("{target}-{n}")),
            artifact_path: PathBuf::from(format!("/cache/{target}/{n}/lib.a")),
            created_at: last_used_at,
            last_used_at,
            size_bytes,
        }
    }

    fn unlimited() -> GcPolicy {
        GcPolicy {
            max_entries_per_target: usize::MAX,
            max_age_ms: None,
            max_total_bytes: None,
        }
    }

    #[test]
    fn age_stage_spares_the_sole_entry() {
        let entries = vec![entry("core", 0, 0, 10), entry("core", 1, 5, 10), entry("app", 0, 0, 10)];
        let policy = GcPolicy {
            max_age_ms: Some(100),
            ..unlimited()
        };

        let plan = plan_evictions(&entries, &policy, 1_000);
        // Both core entries are stale; the more recently used one survives.
        assert_eq!(
            plan,
            vec![PlannedEviction {
                index: 0,
                reason: EvictionReason::Age
            }]
        );
    }

    #[test]
    fn count_stage_keeps_the_newest_n() {
        let entries: Vec<_> = (0..5).map(|n| entry("core", n, n * 10, 1)).collect();
        let policy = GcPolicy {
            max_entries_per_target: 2,
            ..unlimited()
        };

        let evicted: Vec<_> = plan_evictions(&entries, &policy, 100)
            .into_iter()
            .map(|p| (p.index, p.reason))
            .collect();
        assert_eq!(
            evicted,
            vec![
                (0, EvictionReason::Count),
                (1, EvictionReason::Count),
                (2, EvictionReason::Count)
            ]
        );
    }

    #[test]
    fn size_stage_evicts_least_recently_used_across_targets() {
        let entries = vec![
            entry("core", 0, 10, 40),
            entry("core", 1, 30, 40),
            entry("app", 0, 20, 40),
            entry("app", 1, 40, 40),
        ];
        let policy = GcPolicy {
            max_total_bytes: Some(100),
            ..unlimited()
        };

        let evicted: BTreeSet<_> = plan_evictions(&entries, &policy, 50)
            .into_iter()
            .map(|p| p.index)
            .collect();
        assert_eq!(evicted, BTreeSet::from([0, 2]));
    }

    #[test]
    fn size_stage_stops_at_the_floor_even_over_budget() {
        let entries = vec![entry("core", 0, 10, 500), entry("app", 0, 20, 500)];
        let policy = GcPolicy {
            max_total_bytes: Some(1),
            ..unlimited()
        };
        assert!(plan_evictions(&entries, &policy, 50).is_empty());
    }

    #[test]
    fn zero_entries_per_target_behaves_like_one() {
        let entries = vec![entry("core", 0, 10, 1), entry("core", 1, 20, 1)];
        let policy = GcPolicy {
            max_entries_per_target: 0,
            ..unlimited()
        };
        let plan = plan_evictions(&entries, &policy, 50);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].index, 0);
    }

    proptest! {
        #[test]
        fn every_target_keeps_at_least_one_entry(
            raw in prop::collection::vec((0usize..4, 0u64..1_000, 0u64..10_000), 0..40),
            max_entries in 0usize..4,
            max_age in prop::option::of(0u64..1_000),
            max_total in prop::option::of(0u64..20_000),
        ) {
            let targets = ["core", "app", "tests", "tools"];
            let entries: Vec<_> = raw
                .iter()
                .enumerate()
                .map(|(n, &(t, used, size))| entry(targets[t], n as u64, used, size))
                .collect();
            let policy = GcPolicy {
                max_entries_per_target: max_entries,
                max_age_ms: max_age,
                max_total_bytes: max_total,
            };

            let plan = plan_evictions(&entries, &policy, 1_000);
            let evicted: BTreeSet<usize> = plan.iter().map(|p| p.index).collect();
            prop_assert_eq!(evicted.len(), plan.len());

            for target in targets {
                let before = entries.iter().filter(|e| e.target_id == target).count();
                let after = entries
                    .iter()
                    .enumerate()
                    .filter(|(i, e)| e.target_id == target && !evicted.contains(i))
                    .count();
                if before > 0 {
                    prop_assert!(after >= 1, "target {} lost every entry", target);
                }
                prop_assert!(after <= before);
                prop_assert!(after <= max_entries.max(1));
            }
        }
    }
}
