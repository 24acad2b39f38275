//! Admission-controlled job scheduler for docq.
//!
//! [`Scheduler`] owns the in-memory [`JobStore`], admits pending jobs in
//! FIFO order while fewer than `max_concurrent` are running, drives the
//! converter for each admitted job, and reclaims finished jobs either on
//! explicit cleanup or when their TTL expires.

pub mod clock;
pub mod config;
pub mod error;
pub mod position;
pub mod reaper;
pub mod scheduler;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use scheduler::{Artifact, Scheduler, Submission};
pub use store::{JobStore, QueueStats};
