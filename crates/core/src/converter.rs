//! The external conversion tool seam.
//!
//! [`Converter`] is what the scheduler invokes once per staged input. The
//! production implementation, [`CommandConverter`], spawns a configurable
//! program (LibreOffice's `soffice` by default).
//!
//! There is deliberately no timeout here: a converter that hangs keeps its
//! concurrency slot until it exits.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Default converter binary.
pub const DEFAULT_PROGRAM: &str = "soffice";

/// Default argument template (LibreOffice headless conversion).
pub const DEFAULT_ARGS: &str = "--headless --convert-to {format} --outdir {outdir} {input}";

/// Default output format / extension.
pub const DEFAULT_FORMAT: &str = "pdf";

/// Maximum stderr captured from a converter run (64 KiB).
const MAX_STDERR_BYTES: u64 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("converter binary could not be started: {0}")]
    Spawn(std::io::Error),

    #[error("converter failed (exit code {exit_code:?}): {stderr}")]
    Failed {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("converter reported success but produced no output at {0}")]
    MissingOutput(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts one input file into one output file.
///
/// Implementations may be invoked concurrently (up to the scheduler's
/// budget) and must only write to `output` (or its parent directory).
#[async_trait]
pub trait Converter: Send + Sync {
    /// Extension (without dot) of the files this converter produces.
    fn output_format(&self) -> &str;

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError>;
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Converter settings loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub program: String,
    /// Whitespace-separated argument template. Placeholders: `{input}`,
    /// `{output}`, `{outdir}`, `{format}`.
    pub args: String,
    pub format: String,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            args: DEFAULT_ARGS.to_string(),
            format: DEFAULT_FORMAT.to_string(),
        }
    }
}

impl ConverterConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var             | Default                                                  |
    /// |---------------------|----------------------------------------------------------|
    /// | `CONVERTER_PROGRAM` | `soffice`                                                |
    /// | `CONVERTER_ARGS`    | `--headless --convert-to {format} --outdir {outdir} {input}` |
    /// | `TARGET_FORMAT`     | `pdf`                                                    |
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("CONVERTER_PROGRAM").unwrap_or(defaults.program),
            args: std::env::var("CONVERTER_ARGS").unwrap_or(defaults.args),
            format: std::env::var("TARGET_FORMAT")
                .map(|f| f.trim().trim_start_matches('.').to_ascii_lowercase())
                .ok()
                .filter(|f| !f.is_empty())
                .unwrap_or(defaults.format),
        }
    }
}

// ---------------------------------------------------------------------------
// Subprocess converter
// ---------------------------------------------------------------------------

/// Runs an external program once per file.
///
/// A conversion succeeds when the program exits with status 0 and the
/// expected output exists. Tools that pick their own output name inside
/// `{outdir}` (LibreOffice writes `<input stem>.<format>`) are supported:
/// `{outdir}` is a scratch directory private to one conversion, and the
/// tool's file is moved from there to the requested output path. Inputs
/// that share a stem therefore never overwrite each other.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
    format: String,
}

impl CommandConverter {
    pub fn new(config: &ConverterConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.split_whitespace().map(str::to_string).collect(),
            format: config.format.clone(),
        }
    }

    /// Substitute placeholders in the argument template.
    fn render_args(&self, input: &Path, output: &Path, outdir: &Path) -> Vec<String> {
        let input = input.to_string_lossy();
        let output = output.to_string_lossy();
        let outdir = outdir.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output}", &output)
                    .replace("{outdir}", &outdir)
                    .replace("{format}", &self.format)
            })
            .collect()
    }

    /// Scratch `{outdir}` for one conversion, next to `output`. Output names
    /// are unique within a job, so the directory is too.
    fn scratch_dir(output: &Path) -> PathBuf {
        let parent = output.parent().unwrap_or_else(|| Path::new("."));
        let mut name = std::ffi::OsString::from(".");
        name.push(output.file_name().unwrap_or_default());
        name.push(".work");
        parent.join(name)
    }

    /// Where a tool that names its own output would have put it.
    fn tool_chosen_output(&self, input: &Path, outdir: &Path) -> Option<PathBuf> {
        let stem = input.file_stem()?;
        let mut name = stem.to_os_string();
        name.push(".");
        name.push(&self.format);
        Some(outdir.join(name))
    }

    /// Run the program with `scratch` as `{outdir}` and settle the output.
    async fn run(&self, input: &Path, output: &Path, scratch: &Path) -> Result<(), ConvertError> {
        let args = self.render_args(input, output, scratch);

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ConvertError::Spawn)?;

        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));
        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(ConvertError::Failed {
                exit_code: status.code(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        if tokio::fs::try_exists(output).await? {
            return Ok(());
        }

        if let Some(produced) = self.tool_chosen_output(input, scratch) {
            if tokio::fs::try_exists(&produced).await? {
                tokio::fs::rename(&produced, output).await?;
                return Ok(());
            }
        }

        Err(ConvertError::MissingOutput(output.to_path_buf()))
    }
}

#[async_trait]
impl Converter for CommandConverter {
    fn output_format(&self) -> &str {
        &self.format
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        let scratch = Self::scratch_dir(output);
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.run(input, output, &scratch).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            tracing::debug!(
                path = %scratch.display(),
                error = %e,
                "Failed to remove scratch directory",
            );
        }
        result
    }
}

/// Read a child stream to the end, keeping at most [`MAX_STDERR_BYTES`].
async fn read_capped<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(h) = handle {
        let _ = h.take(MAX_STDERR_BYTES).read_to_end(&mut buf).await;
    }
    buf
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
