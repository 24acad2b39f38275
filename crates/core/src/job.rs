//! Conversion job record and its state machine.
//!
//! A job moves strictly forward through `pending -> running -> done | error`.
//! Terminal jobs are never transitioned again; they leave the system only
//! when their record is deleted by cleanup.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::error::CoreError;
use crate::types::Timestamp;
use crate::workspace::StagedFile;

// ---------------------------------------------------------------------------
// Job identifier
// ---------------------------------------------------------------------------

/// Opaque, unguessable job handle.
///
/// Backed by a random (v4) UUID, i.e. 122 bits drawn from the operating
/// system's CSPRNG. Rendered as 32 lowercase hex characters so it can be
/// used directly as a directory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an id received from a caller.
    ///
    /// Returns `None` for anything that is not a well-formed id; callers map
    /// that to the same not-found signal as an unknown id.
    pub fn parse(s: &str) -> Option<Self> {
        Uuid::try_parse(s.trim()).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl Serialize for JobId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Status and state machine
// ---------------------------------------------------------------------------

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    /// Statuses reachable from `self` in one step.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[JobStatus::Running],
            JobStatus::Running => &[JobStatus::Done, JobStatus::Error],
            JobStatus::Done | JobStatus::Error => &[],
        }
    }

    pub fn can_transition_to(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// `done` and `error` are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Job record
// ---------------------------------------------------------------------------

/// A single conversion job.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// 1-indexed rank among pending jobs. `Some` only while pending.
    pub position: Option<u32>,
    /// Directory exclusively owned by this job.
    pub workspace: PathBuf,
    pub inputs: Vec<StagedFile>,
    /// Produced artifacts, appended as individual conversions succeed.
    pub outputs: Vec<StagedFile>,
    /// Failure summary. `Some` only when `status == Error`.
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub finished_at: Option<Timestamp>,
}

impl Job {
    /// Create a pending job over already-staged inputs.
    pub fn new(
        id: JobId,
        workspace: PathBuf,
        inputs: Vec<StagedFile>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            position: None,
            workspace,
            inputs,
            outputs: Vec::new(),
            error: None,
            created_at,
            started_at: None,
            finished_at: None,
        }
    }

    fn transition(&mut self, to: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(to) {
            return Err(CoreError::Conflict(format!(
                "Invalid transition for job {}: {} -> {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// `pending -> running`. Clears the queue position.
    pub fn start(&mut self, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Running)?;
        self.position = None;
        self.started_at = Some(now);
        Ok(())
    }

    /// `running -> done`.
    pub fn complete(&mut self, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Done)?;
        self.finished_at = Some(now);
        Ok(())
    }

    /// `running -> error` with a human-readable summary.
    pub fn fail(&mut self, message: impl Into<String>, now: Timestamp) -> Result<(), CoreError> {
        self.transition(JobStatus::Error)?;
        self.error = Some(message.into());
        self.finished_at = Some(now);
        Ok(())
    }

    /// When a terminal job becomes eligible for automatic reclamation.
    pub fn expires_at(&self, ttl: Duration) -> Option<Timestamp> {
        let ttl = chrono::Duration::from_std(ttl).ok()?;
        self.finished_at.map(|finished| finished + ttl)
    }

    /// Build the caller-facing status view.
    pub fn view(&self, ttl: Duration) -> JobStatusView {
        match self.status {
            JobStatus::Pending => JobStatusView::Pending {
                position: self.position.unwrap_or(0),
                created_at: self.created_at,
            },
            JobStatus::Running => JobStatusView::Running {
                started_at: self.started_at,
                converted: self.outputs.len(),
                total: self.inputs.len(),
            },
            JobStatus::Done => JobStatusView::Done {
                file_count: self.outputs.len(),
                outputs: self.outputs.iter().map(|o| o.name.clone()).collect(),
                expires_at: self.expires_at(ttl),
            },
            JobStatus::Error => JobStatusView::Error {
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "Conversion failed".to_string()),
                expires_at: self.expires_at(ttl),
            },
        }
    }
}

/// What a status query returns for a known job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum JobStatusView {
    Pending {
        position: u32,
        created_at: Timestamp,
    },
    Running {
        started_at: Option<Timestamp>,
        converted: usize,
        total: usize,
    },
    Done {
        file_count: usize,
        outputs: Vec<String>,
        expires_at: Option<Timestamp>,
    },
    Error {
        message: String,
        expires_at: Option<Timestamp>,
    },
}

impl JobStatusView {
    pub fn status(&self) -> JobStatus {
        match self {
            JobStatusView::Pending { .. } => JobStatus::Pending,
            JobStatusView::Running { .. } => JobStatus::Running,
            JobStatusView::Done { .. } => JobStatus::Done,
            JobStatusView::Error { .. } => JobStatus::Error,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::Utc;

    fn pending_job() -> Job {
        Job::new(JobId::new(), PathBuf::from("/tmp/ws"), Vec::new(), Utc::now())
    }

    // -- JobId ----------------------------------------------------------------

    #[test]
    fn job_ids_are_unique_and_hex() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        let rendered = a.to_string();
        assert_eq!(rendered.len(), 32);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn job_id_round_trips_through_display() {
        let id = JobId::new();
        assert_eq!(JobId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn malformed_job_id_is_rejected() {
        assert_eq!(JobId::parse("1"), None);
        assert_eq!(JobId::parse("../../etc/passwd"), None);
        assert_eq!(JobId::parse(""), None);
    }

    #[test]
    fn job_id_serializes_like_display() {
        let id = JobId::new();
        let json = serde_json::to_value(id).unwrap();
        assert_eq!(json, serde_json::Value::String(id.to_string()));
    }

    // -- State machine --------------------------------------------------------

    #[test]
    fn pending_only_moves_to_running() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Done));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn terminal_states_have_no_transitions() {
        for status in [JobStatus::Done, JobStatus::Error] {
            assert!(status.is_terminal());
            assert!(status.valid_transitions().is_empty());
        }
    }

    #[test]
    fn start_clears_position() {
        let mut job = pending_job();
        job.position = Some(1);
        job.start(Utc::now()).unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.position, None);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn finished_job_cannot_restart() {
        let mut job = pending_job();
        job.start(Utc::now()).unwrap();
        job.complete(Utc::now()).unwrap();
        assert_matches!(job.start(Utc::now()), Err(CoreError::Conflict(_)));
        assert_matches!(job.fail("late", Utc::now()), Err(CoreError::Conflict(_)));
        assert_eq!(job.status, JobStatus::Done);
    }

    #[test]
    fn pending_job_cannot_complete_directly() {
        let mut job = pending_job();
        assert!(job.complete(Utc::now()).is_err());
        assert_eq!(job.status, JobStatus::Pending);
    }

    // -- Views ----------------------------------------------------------------

    #[test]
    fn error_view_carries_message_and_expiry() {
        let mut job = pending_job();
        job.start(Utc::now()).unwrap();
        let finished = Utc::now();
        job.fail("All 2 file(s) failed to convert", finished).unwrap();

        let view = job.view(Duration::from_secs(600));
        assert_matches!(view, JobStatusView::Error { ref message, expires_at: Some(at) } => {
            assert_eq!(message, "All 2 file(s) failed to convert");
            assert_eq!(at, finished + chrono::Duration::seconds(600));
        });
    }

    #[test]
    fn pending_view_serializes_with_status_tag() {
        let mut job = pending_job();
        job.position = Some(3);
        let json = serde_json::to_value(job.view(Duration::from_secs(60))).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["position"], 3);
    }
}
