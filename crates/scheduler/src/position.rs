//! Queue position tracking.
//!
//! Positions are recomputed from scratch, in one O(pending) pass, after
//! every change to the pending set.

use docq_core::job::JobStatus;

use crate::store::JobStore;

/// Assign `1, 2, 3, ...` to pending jobs in queue order.
///
/// Jobs leave the pending queue only through [`Job::start`], which clears
/// their position, or through removal, so non-pending jobs never carry one.
///
/// [`Job::start`]: docq_core::job::Job::start
pub fn recompute(store: &mut JobStore) {
    let JobStore { jobs, pending, .. } = store;
    for (idx, id) in pending.iter().enumerate() {
        if let Some(entry) = jobs.get_mut(id) {
            entry.job.position = Some(idx as u32 + 1);
        }
    }
}

/// Check that pending positions are exactly `{1..=pending}` and that no
/// other job has one.
pub fn positions_are_consistent(store: &JobStore) -> bool {
    let mut seen: Vec<u32> = Vec::with_capacity(store.pending_len());
    for entry in store.jobs.values() {
        match (entry.job.status, entry.job.position) {
            (JobStatus::Pending, Some(p)) => seen.push(p),
            (JobStatus::Pending, None) => return false,
            (_, Some(_)) => return false,
            (_, None) => {}
        }
    }
    seen.sort_unstable();
    seen.iter().copied().eq(1..=store.pending_len() as u32)
}
