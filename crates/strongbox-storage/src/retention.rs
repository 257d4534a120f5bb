//! Generational retention

use std::cmp::Reverse;
use strongbox_core::types::{RunId, StoredBackupSet};

/// Split complete sets into those to keep and those to delete.
///
/// Sets are ordered newest first by creation time (run id breaks ties); the
/// first `keep` are retained. Only complete sets may be passed in, so a set
/// without a confirmed manifest can never be selected for deletion.
pub fn plan_retention(complete: &[StoredBackupSet], keep: u32) -> (Vec<RunId>, Vec<RunId>) {
    let mut ordered: Vec<&StoredBackupSet> = complete.iter().collect();
    ordered.sort_by_key(|set| Reverse((set.manifest.created_at, set.run_id.clone())));

    let keep = keep as usize;
    let retained = ordered.iter().take(keep).map(|s| s.run_id.clone()).collect();
    let expired = ordered.iter().skip(keep).map(|s| s.run_id.clone()).collect();
    (retained, expired)
}

/// Sort sets newest first
pub fn sort_newest_first(sets: &mut [StoredBackupSet]) {
    sets.sort_by_key(|set| Reverse((set.manifest.created_at, set.run_id.clone())));
}
