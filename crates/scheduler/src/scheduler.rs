//! The admission controller.
//!
//! All admission decisions happen while holding the single store mutex:
//! reading `running`, popping the pending queue, and recomputing positions
//! are one critical section. Conversions run outside the lock on worker
//! tasks. At most `max_concurrent` workers exist; when a worker finishes a
//! job it hands its slot straight to the next pending job under the same
//! lock, so completions never re-enter admission recursively and racing
//! completions cannot over-admit.
//!
//! Workers are tracked so that [`Scheduler::shutdown`] can wait for them
//! and leave no workspace behind.

use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docq_core::converter::Converter;
use docq_core::error::CoreError;
use docq_core::job::{Job, JobId, JobStatus, JobStatusView};
use docq_core::workspace::{
    output_name, unique_name, InputFile, StagedFile, WorkspaceManager, OUTPUT_DIR,
};
use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::clock::{Clock, SystemClock};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::position;
use crate::reaper::{Reaper, ReclaimTimer};
use crate::store::{JobStore, QueueStats};

/// A converted file handed to the caller on download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// What the caller learns when a job is queued, read under the same lock
/// that admitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub id: JobId,
    pub status: JobStatus,
    pub position: Option<u32>,
}

impl Submission {
    fn of(job: &Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            position: job.position,
        }
    }
}

/// Everything a worker needs to run a job without touching the store.
#[derive(Debug)]
struct ExecutionPlan {
    id: JobId,
    inputs: Vec<StagedFile>,
    output_dir: PathBuf,
}

impl ExecutionPlan {
    fn for_job(job: &Job) -> Self {
        Self {
            id: job.id,
            inputs: job.inputs.clone(),
            output_dir: job.workspace.join(OUTPUT_DIR),
        }
    }
}

/// How a job's execution ended, before it is folded into the record.
enum Execution {
    /// Every file was attempted; holds the names of the ones that failed.
    Finished { failed: Vec<String> },
    /// The conversion loop panicked.
    Aborted { reason: String },
    /// Shutdown gave up waiting and dropped the conversion.
    Interrupted,
}

/// Shared handle to the scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    store: Mutex<JobStore>,
    workspaces: WorkspaceManager,
    converter: Arc<dyn Converter>,
    clock: Arc<dyn Clock>,
    reaper: Reaper,
    workers: TaskTracker,
    /// Cancelled when shutdown stops waiting for running jobs.
    interrupt: CancellationToken,
    max_concurrent: usize,
    ttl: Duration,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, converter: Arc<dyn Converter>) -> Self {
        Self::with_clock(config, converter, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &SchedulerConfig,
        converter: Arc<dyn Converter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        tracing::info!(
            max_concurrent,
            ttl_secs = config.job_ttl.as_secs(),
            workspace_root = %config.workspace_root.display(),
            "Scheduler created",
        );

        Self {
            inner: Arc::new(Inner {
                store: Mutex::new(JobStore::new()),
                workspaces: WorkspaceManager::new(&config.workspace_root),
                converter,
                clock,
                reaper: Reaper::new(),
                workers: TaskTracker::new(),
                interrupt: CancellationToken::new(),
                max_concurrent,
                ttl: config.job_ttl,
            }),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    // -----------------------------------------------------------------------
    // Submission and admission
    // -----------------------------------------------------------------------

    /// Stage `files` into a new workspace, queue the job, and start it
    /// immediately if a slot is free.
    ///
    /// Returns as soon as the job is queued; conversion happens in the
    /// background. The returned status and position are those the job had
    /// when it was queued, even if it has finished or been reclaimed since.
    pub async fn submit(&self, files: Vec<InputFile>) -> Result<Submission, SchedulerError> {
        if self.inner.reaper.is_shut_down() {
            return Err(SchedulerError::ShuttingDown);
        }
        if files.is_empty() {
            return Err(CoreError::Validation("At least one file is required".to_string()).into());
        }

        let id = JobId::new();
        let file_count = files.len();
        let workspace = self.inner.workspaces.stage(&id, files).await?;
        let root = workspace.root.clone();
        let job = Job::new(id, workspace.root, workspace.inputs, self.inner.clock.now());

        let mut store = self.inner.store.lock().await;
        // Shutdown may have drained the queue while the files were staged.
        if self.inner.reaper.is_shut_down() {
            drop(store);
            self.inner.workspaces.reclaim(&root).await;
            return Err(SchedulerError::ShuttingDown);
        }
        store.insert(job);
        let admitted = self.admit_locked(&mut store);
        position::recompute(&mut store);
        let submission = store.get(&id).map(Submission::of);
        tracing::info!(
            job_id = %id,
            files = file_count,
            running = store.running(),
            pending = store.pending_len(),
            "Job submitted",
        );
        drop(store);

        for plan in admitted {
            self.spawn_worker(plan);
        }
        submission.ok_or_else(SchedulerError::not_found)
    }

    /// Fill every free slot from the front of the queue.
    ///
    /// Caller must hold the store lock and recompute positions afterwards.
    fn admit_locked(&self, store: &mut JobStore) -> Vec<ExecutionPlan> {
        let mut admitted = Vec::new();
        while store.running() < self.inner.max_concurrent {
            match self.start_next_locked(store) {
                Some(plan) => admitted.push(plan),
                None => break,
            }
        }
        admitted
    }

    fn start_next_locked(&self, store: &mut JobStore) -> Option<ExecutionPlan> {
        let id = store.start_next(self.inner.clock.now())?;
        let job = store.get(&id)?;
        tracing::info!(job_id = %id, files = job.inputs.len(), "Job admitted");
        Some(ExecutionPlan::for_job(job))
    }

    fn spawn_worker(&self, plan: ExecutionPlan) {
        self.inner.workers.spawn(self.clone().run_worker(plan));
    }

    /// Execute jobs until the queue is empty, one at a time, on one slot.
    async fn run_worker(self, mut plan: ExecutionPlan) {
        loop {
            let execution = tokio::select! {
                biased;
                _ = self.inner.interrupt.cancelled() => Execution::Interrupted,
                execution = self.execute(&plan) => execution,
            };
            match self.finish(&plan.id, execution).await {
                Some(next) => plan = next,
                None => break,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(&self, plan: &ExecutionPlan) -> Execution {
        match AssertUnwindSafe(self.convert_all(plan)).catch_unwind().await {
            Ok(failed) => Execution::Finished { failed },
            Err(panic) => Execution::Aborted {
                reason: panic_message(panic.as_ref()),
            },
        }
    }

    /// Convert every input, recording successes as they happen. Returns the
    /// names of inputs that failed.
    async fn convert_all(&self, plan: &ExecutionPlan) -> Vec<String> {
        let format = self.inner.converter.output_format().to_string();
        let mut used = HashSet::with_capacity(plan.inputs.len());
        let mut failed = Vec::new();

        for input in &plan.inputs {
            let name = unique_name(&output_name(&input.name, &format), &mut used);
            let path = plan.output_dir.join(&name);

            match self.inner.converter.convert(&input.path, &path).await {
                Ok(()) => {
                    tracing::debug!(job_id = %plan.id, file = %input.name, output = %name, "File converted");
                    self.inner
                        .store
                        .lock()
                        .await
                        .record_output(&plan.id, StagedFile { name, path });
                }
                Err(e) => {
                    tracing::warn!(
                        job_id = %plan.id,
                        file = %input.name,
                        error = %e,
                        "File conversion failed",
                    );
                    failed.push(input.name.clone());
                }
            }
        }

        failed
    }

    /// Fold an execution result into the job record, arm its reclaim timer,
    /// and hand the slot to the next pending job, if any.
    ///
    /// Once shutdown has begun the job is reclaimed right away and the slot
    /// is not handed on.
    async fn finish(&self, id: &JobId, execution: Execution) -> Option<ExecutionPlan> {
        let now = self.inner.clock.now();
        let mut store = self.inner.store.lock().await;
        let shutting_down = self.inner.reaper.is_shut_down();
        store.release_slot();

        match store.get_mut(id) {
            Some(job) => {
                let total = job.inputs.len();
                let result = match execution {
                    Execution::Aborted { reason } => {
                        tracing::error!(job_id = %id, reason = %reason, "Job aborted by panic");
                        job.fail("Conversion aborted by an internal error", now)
                    }
                    Execution::Interrupted => {
                        tracing::warn!(job_id = %id, "Job interrupted by shutdown");
                        job.fail("Conversion interrupted by shutdown", now)
                    }
                    Execution::Finished { failed } if job.outputs.is_empty() => {
                        job.fail(all_failed_message(total, &failed), now)
                    }
                    Execution::Finished { failed } => {
                        if !failed.is_empty() {
                            tracing::warn!(
                                job_id = %id,
                                failed = failed.len(),
                                total,
                                "Job finished with partial failures",
                            );
                        }
                        job.complete(now)
                    }
                };

                match result {
                    Ok(()) => tracing::info!(
                        job_id = %id,
                        status = %job.status,
                        outputs = job.outputs.len(),
                        total,
                        "Job finished",
                    ),
                    Err(e) => tracing::error!(job_id = %id, error = %e, "Job state transition rejected"),
                }

                if !shutting_down {
                    let timer = self.arm_reclaim(*id);
                    store.set_reclaim_timer(id, timer);
                }
            }
            None => {
                tracing::warn!(job_id = %id, "Finished job no longer in store");
            }
        }

        let next = if !shutting_down && store.running() < self.inner.max_concurrent {
            self.start_next_locked(&mut store)
        } else {
            None
        };
        position::recompute(&mut store);
        drop(store);

        if shutting_down {
            self.cleanup(id).await;
        }
        next
    }

    fn arm_reclaim(&self, id: JobId) -> ReclaimTimer {
        let inner = Arc::downgrade(&self.inner);
        self.inner.reaper.arm(self.inner.ttl, move || async move {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            if (Scheduler { inner }).cleanup(&id).await {
                tracing::info!(job_id = %id, "Job expired and was reclaimed");
            }
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Snapshot of a job record.
    pub async fn job(&self, id: &JobId) -> Result<Job, SchedulerError> {
        let store = self.inner.store.lock().await;
        store.get(id).cloned().ok_or_else(SchedulerError::not_found)
    }

    /// Caller-facing status of a job.
    pub async fn status(&self, id: &JobId) -> Result<JobStatusView, SchedulerError> {
        let store = self.inner.store.lock().await;
        store
            .get(id)
            .map(|job| job.view(self.inner.ttl))
            .ok_or_else(SchedulerError::not_found)
    }

    pub async fn stats(&self) -> QueueStats {
        self.inner.store.lock().await.stats(self.inner.max_concurrent)
    }

    // -----------------------------------------------------------------------
    // Download and cleanup
    // -----------------------------------------------------------------------

    /// Read every output of a `done` job, then clean the job up.
    ///
    /// Outputs are returned in input order.
    pub async fn download(&self, id: &JobId) -> Result<Vec<Artifact>, SchedulerError> {
        let outputs = {
            let store = self.inner.store.lock().await;
            let job = store.get(id).ok_or_else(SchedulerError::not_found)?;
            if job.status != JobStatus::Done {
                return Err(SchedulerError::NotReady(job.status));
            }
            job.outputs.clone()
        };

        let mut artifacts = Vec::with_capacity(outputs.len());
        for output in outputs {
            match tokio::fs::read(&output.path).await {
                Ok(bytes) => artifacts.push(Artifact {
                    name: output.name,
                    bytes,
                }),
                // Reclaimed between the lookup and the read.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(SchedulerError::not_found());
                }
                Err(source) => {
                    return Err(SchedulerError::Output {
                        name: output.name,
                        source,
                    });
                }
            }
        }

        self.cleanup(id).await;
        tracing::info!(job_id = %id, files = artifacts.len(), "Job downloaded");
        Ok(artifacts)
    }

    /// Remove a finished job and reclaim its workspace.
    ///
    /// Returns `true` if this call removed the job. Unknown ids, repeated
    /// calls, and jobs that are still pending or running are no-ops that
    /// return `false`.
    pub async fn cleanup(&self, id: &JobId) -> bool {
        let entry = {
            let mut store = self.inner.store.lock().await;
            match store.get(id) {
                Some(job) if job.status.is_terminal() => {}
                Some(job) => {
                    tracing::debug!(job_id = %id, status = %job.status, "Cleanup skipped for unfinished job");
                    return false;
                }
                None => return false,
            }
            let entry = store.remove(id);
            position::recompute(&mut store);
            entry
        };

        let Some(entry) = entry else {
            return false;
        };
        if let Some(timer) = &entry.reclaim {
            timer.cancel();
        }
        self.inner.workspaces.reclaim(&entry.job.workspace).await;
        tracing::info!(job_id = %id, status = %entry.job.status, "Job cleaned up");
        true
    }

    /// Stop accepting jobs and reclaim every workspace.
    ///
    /// Pending jobs are dropped and finished jobs reclaimed at once. Running
    /// jobs get `grace` to finish and are reclaimed as they end; converters
    /// still going after that are killed.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.reaper.shutdown();

        let (dropped, finished) = {
            let mut store = self.inner.store.lock().await;
            let dropped = store.drain_pending();
            position::recompute(&mut store);
            (dropped, store.terminal_ids())
        };
        for entry in &dropped {
            tracing::debug!(job_id = %entry.job.id, "Pending job dropped by shutdown");
            self.inner.workspaces.reclaim(&entry.job.workspace).await;
        }
        for id in &finished {
            self.cleanup(id).await;
        }

        self.inner.workers.close();
        if tokio::time::timeout(grace, self.inner.workers.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                running = self.inner.workers.len(),
                grace_secs = grace.as_secs_f64(),
                "Interrupting jobs still running after the grace period",
            );
            self.inner.interrupt.cancel();
            self.inner.workers.wait().await;
        }

        let stats = self.stats().await;
        tracing::info!(
            dropped = dropped.len(),
            reclaimed = finished.len(),
            running = stats.running,
            pending = stats.pending,
            "Scheduler shut down",
        );
    }
}

fn all_failed_message(total: usize, failed: &[String]) -> String {
    if total == 0 {
        return "No files to convert".to_string();
    }
    format!(
        "Conversion failed for all {total} file(s): {}",
        failed.join(", ")
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
