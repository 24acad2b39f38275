//! Domain types for the docq conversion queue.
//!
//! This crate has no internal dependencies. It defines the job record and
//! its state machine, the per-job workspace manager, and the converter
//! seam that the scheduler drives.

pub mod converter;
pub mod error;
pub mod job;
pub mod types;
pub mod workspace;
