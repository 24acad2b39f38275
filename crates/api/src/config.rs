use docq_core::converter::ConverterConfig;
use docq_scheduler::SchedulerConfig;

/// Default request body limit (50 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Default number of files accepted in one submission.
pub const DEFAULT_MAX_FILES_PER_JOB: usize = 20;

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
/// In production, override via environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS` env var.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds (default: `30`). Conversions run in
    /// the background and are not bound by it.
    pub request_timeout_secs: u64,
    /// How long shutdown waits for running conversions before killing
    /// them, in seconds (default: `30`).
    pub shutdown_timeout_secs: u64,
    /// Maximum request body size in bytes (default: 50 MiB).
    pub max_upload_bytes: usize,
    /// Maximum number of files in one submission (default: `20`).
    pub max_files_per_job: usize,
    /// Admission budget, TTL and workspace root.
    pub scheduler: SchedulerConfig,
    /// External converter program and argument template.
    pub converter: ConverterConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                | Default                    |
    /// |------------------------|----------------------------|
    /// | `HOST`                 | `0.0.0.0`                  |
    /// | `PORT`                 | `3000`                     |
    /// | `CORS_ORIGINS`         | `http://localhost:5173`    |
    /// | `REQUEST_TIMEOUT_SECS` | `30`                       |
    /// | `SHUTDOWN_TIMEOUT_SECS`| `30`                       |
    /// | `MAX_UPLOAD_BYTES`     | `52428800`                 |
    /// | `MAX_FILES_PER_JOB`    | `20`                       |
    ///
    /// Scheduler and converter variables are documented on
    /// [`SchedulerConfig::from_env`] and [`ConverterConfig::from_env`].
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());

        let port: u16 = std::env::var("PORT")
            .unwrap_or_else(|_| "3000".into())
            .parse()
            .expect("PORT must be a valid u16");

        let cors_origins: Vec<String> = std::env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:5173".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let request_timeout_secs: u64 = std::env::var("REQUEST_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("REQUEST_TIMEOUT_SECS must be a valid u64");

        let shutdown_timeout_secs: u64 = std::env::var("SHUTDOWN_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".into())
            .parse()
            .expect("SHUTDOWN_TIMEOUT_SECS must be a valid u64");

        let max_upload_bytes: usize = std::env::var("MAX_UPLOAD_BYTES")
            .map(|v| v.parse().expect("MAX_UPLOAD_BYTES must be a valid usize"))
            .unwrap_or(DEFAULT_MAX_UPLOAD_BYTES);

        let max_files_per_job: usize = std::env::var("MAX_FILES_PER_JOB")
            .map(|v| v.parse().expect("MAX_FILES_PER_JOB must be a valid usize"))
            .unwrap_or(DEFAULT_MAX_FILES_PER_JOB);

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            shutdown_timeout_secs,
            max_upload_bytes,
            max_files_per_job,
            scheduler: SchedulerConfig::from_env(),
            converter: ConverterConfig::from_env(),
        }
    }
}
