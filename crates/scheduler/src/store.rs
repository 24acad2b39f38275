//! In-memory job table.
//!
//! [`JobStore`] is a plain data structure: it is only ever touched while the
//! scheduler's mutex is held, so it does no locking of its own. Records are
//! kept in creation order; the pending queue is a separate FIFO of ids.

use std::collections::VecDeque;

use docq_core::job::{Job, JobId, JobStatus};
use docq_core::types::Timestamp;
use docq_core::workspace::StagedFile;
use indexmap::IndexMap;
use serde::Serialize;

use crate::reaper::ReclaimTimer;

/// Read-only snapshot of the admission state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub running: usize,
    pub pending: usize,
    pub max_concurrent: usize,
}

/// A job record plus the bookkeeping the scheduler attaches to it.
#[derive(Debug)]
pub struct JobEntry {
    pub job: Job,
    pub(crate) reclaim: Option<ReclaimTimer>,
}

#[derive(Debug, Default)]
pub struct JobStore {
    pub(crate) jobs: IndexMap<JobId, JobEntry>,
    pub(crate) pending: VecDeque<JobId>,
    running: usize,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a freshly created record. Pending records join the back of
    /// the queue.
    pub fn insert(&mut self, job: Job) {
        let id = job.id;
        if job.status == JobStatus::Pending {
            self.pending.push_back(id);
        }
        self.jobs.insert(id, JobEntry { job, reclaim: None });
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.jobs.get(id).map(|e| &e.job)
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.jobs.get_mut(id).map(|e| &mut e.job)
    }

    /// Remove a record, returning it with any armed reclaim timer.
    ///
    /// Removing a running job would leak its slot, so callers only remove
    /// pending or terminal jobs.
    pub fn remove(&mut self, id: &JobId) -> Option<JobEntry> {
        let entry = self.jobs.shift_remove(id)?;
        if entry.job.status == JobStatus::Pending {
            self.pending.retain(|p| p != id);
        }
        Some(entry)
    }

    /// Remove every job still waiting for a slot, oldest first.
    pub fn drain_pending(&mut self) -> Vec<JobEntry> {
        let ids: Vec<JobId> = self.pending.drain(..).collect();
        ids.iter()
            .filter_map(|id| self.jobs.shift_remove(id))
            .collect()
    }

    /// Admit the oldest pending job: mark it running and take a slot.
    ///
    /// Does not check the budget; that is the caller's decision.
    pub fn start_next(&mut self, now: Timestamp) -> Option<JobId> {
        while let Some(id) = self.pending.pop_front() {
            let Some(entry) = self.jobs.get_mut(&id) else {
                continue;
            };
            if let Err(e) = entry.job.start(now) {
                tracing::error!(job_id = %id, error = %e, "Queued job could not be started");
                continue;
            }
            self.running += 1;
            return Some(id);
        }
        None
    }

    /// Give back the slot taken by [`start_next`](Self::start_next).
    pub fn release_slot(&mut self) {
        debug_assert!(self.running > 0, "released a slot that was never taken");
        self.running = self.running.saturating_sub(1);
    }

    /// Append a successfully produced artifact to a job.
    pub fn record_output(&mut self, id: &JobId, output: StagedFile) {
        if let Some(job) = self.get_mut(id) {
            job.outputs.push(output);
        }
    }

    pub fn set_reclaim_timer(&mut self, id: &JobId, timer: ReclaimTimer) {
        match self.jobs.get_mut(id) {
            Some(entry) => entry.reclaim = Some(timer),
            None => timer.cancel(),
        }
    }

    /// Ids of every job in a terminal state, oldest first.
    pub fn terminal_ids(&self) -> Vec<JobId> {
        self.jobs
            .values()
            .filter(|e| e.job.status.is_terminal())
            .map(|e| e.job.id)
            .collect()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self, max_concurrent: usize) -> QueueStats {
        QueueStats {
            running: self.running,
            pending: self.pending.len(),
            max_concurrent,
        }
    }
}
