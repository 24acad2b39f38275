use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of jobs converted at the same time.
pub const DEFAULT_MAX_CONCURRENT: usize = 2;

/// Default delay between a job finishing and its automatic reclamation.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(600);

/// Directory name created under the system temp dir when no root is set.
const DEFAULT_WORKSPACE_DIR: &str = "docq";

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Admission budget. Always at least 1.
    pub max_concurrent: usize,
    /// How long a finished job is kept before its workspace is reclaimed.
    pub job_ttl: Duration,
    /// Parent directory of all per-job workspaces.
    pub workspace_root: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            job_ttl: DEFAULT_JOB_TTL,
            workspace_root: std::env::temp_dir().join(DEFAULT_WORKSPACE_DIR),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var               | Default          |
    /// |-----------------------|------------------|
    /// | `MAX_CONCURRENT_JOBS` | `2`              |
    /// | `JOB_TTL_SECS`        | `600`            |
    /// | `WORKSPACE_ROOT`      | `$TMPDIR/docq`   |
    ///
    /// Panics on malformed values so misconfiguration fails at startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_concurrent = std::env::var("MAX_CONCURRENT_JOBS")
            .ok()
            .map(|v| {
                v.parse::<NonZeroUsize>()
                    .expect("MAX_CONCURRENT_JOBS must be a positive integer")
                    .get()
            })
            .unwrap_or(defaults.max_concurrent);

        let job_ttl = std::env::var("JOB_TTL_SECS")
            .ok()
            .map(|v| {
                Duration::from_secs(v.parse().expect("JOB_TTL_SECS must be a valid u64"))
            })
            .unwrap_or(defaults.job_ttl);

        let workspace_root = std::env::var("WORKSPACE_ROOT")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.workspace_root);

        Self {
            max_concurrent,
            job_ttl,
            workspace_root,
        }
    }
}
