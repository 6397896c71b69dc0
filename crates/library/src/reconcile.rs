use std::collections::HashMap;

use common::{Folder, Track};
use serde::{Deserialize, Serialize};

use crate::scan::ScanResult;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
}

#[derive(Debug, Default)]
pub struct MergePlan {
    pub upserts: Vec<Track>,
    pub removals: Vec<String>,
    /// Result tracks owned by none of `folders`; never written.
    pub orphaned: usize,
    pub stats: MergeStats,
}

/// Computes the full-replace merge of `result` into `existing`, scoped to
/// `folders`. Tracks outside every folder in `folders` are left alone.
pub fn plan_merge(existing: &[Track], folders: &[Folder], result: &ScanResult) -> MergePlan {
    let in_scope = |path: &str| folders.iter().any(|folder| folder.contains(path));

    let existing_by_id: HashMap<&str, &Track> = existing
        .iter()
        .filter(|track| in_scope(&track.path))
        .map(|track| (track.uuid.as_str(), track))
        .collect();

    let mut plan = MergePlan::default();

    for track in existing_by_id.values() {
        if !result.contains_key(track.uuid.as_str()) {
            plan.removals.push(track.uuid.clone());
            plan.stats.removed += 1;
        }
    }

    for (uuid, track) in result {
        if !in_scope(&track.path) {
            plan.orphaned += 1;
            continue;
        }
        match existing_by_id.get(uuid.as_str()) {
            Some(previous) if *previous == track => plan.stats.unchanged += 1,
            Some(_) => {
                plan.stats.updated += 1;
                plan.upserts.push(track.clone());
            }
            None => {
                plan.stats.added += 1;
                plan.upserts.push(track.clone());
            }
        }
    }

    plan.removals.sort();
    plan.upserts.sort_by(|a, b| a.path.cmp(&b.path));
    plan
}
