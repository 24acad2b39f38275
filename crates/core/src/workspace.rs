//! Per-job workspace management.
//!
//! Every job gets one directory under the configured root, named after its
//! [`JobId`]. Inputs are staged into `in/` and converters write into `out/`.
//! Caller-supplied file names only ever contribute a sanitized final path
//! component, so nothing can be written outside the job's own directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::job::JobId;

/// Sub-directory holding staged inputs.
pub const INPUT_DIR: &str = "in";

/// Sub-directory converters write into.
pub const OUTPUT_DIR: &str = "out";

/// Name used when sanitizing leaves nothing usable.
pub const FALLBACK_FILE_NAME: &str = "document";

/// Longest file name (in bytes) kept after sanitizing.
const MAX_FILE_NAME_BYTES: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("Workspace already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("Workspace I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An uploaded file as received from the submission layer.
#[derive(Debug, Clone)]
pub struct InputFile {
    /// Name as supplied by the client. Never trusted as a path.
    pub name: String,
    pub bytes: Vec<u8>,
}

impl InputFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
        }
    }
}

/// A file inside a job workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Display name, unique within the job.
    pub name: String,
    pub path: PathBuf,
}

/// The directory tree owned by one job.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub inputs: Vec<StagedFile>,
}

impl Workspace {
    pub fn output_dir(&self) -> PathBuf {
        self.root.join(OUTPUT_DIR)
    }
}

// ---------------------------------------------------------------------------
// Name handling
// ---------------------------------------------------------------------------

/// Reduce a client-supplied file name to a safe single path component.
///
/// - Only the final segment after any `/` or `\` is kept.
/// - Characters outside `[A-Za-z0-9._- ]` become `_`.
/// - Leading dots and surrounding whitespace are stripped, so `..` and
///   hidden names cannot survive.
/// - Empty results fall back to [`FALLBACK_FILE_NAME`].
pub fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or("");

    let mapped: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ' ') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let trimmed = mapped.trim().trim_start_matches('.').trim();

    let mut out = String::with_capacity(trimmed.len().min(MAX_FILE_NAME_BYTES));
    for c in trimmed.chars() {
        if out.len() + c.len_utf8() > MAX_FILE_NAME_BYTES {
            break;
        }
        out.push(c);
    }

    if out.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        out
    }
}

/// Split `name` into `(stem, extension)`; the extension excludes the dot.
pub fn split_extension(name: &str) -> (&str, Option<&str>) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => (&name[..idx], Some(&name[idx + 1..])),
        _ => (name, None),
    }
}

/// Return `name`, or `stem-N.ext` for the smallest `N >= 2` not yet in `used`.
///
/// The chosen name is recorded in `used`.
pub fn unique_name(name: &str, used: &mut HashSet<String>) -> String {
    if used.insert(name.to_string()) {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name);
    let mut n = 2u32;
    loop {
        let candidate = match ext {
            Some(ext) => format!("{stem}-{n}.{ext}"),
            None => format!("{stem}-{n}"),
        };
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

/// Output file name for an input converted to `format`.
pub fn output_name(input_name: &str, format: &str) -> String {
    let (stem, _) = split_extension(input_name);
    format!("{stem}.{format}")
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates and reclaims job workspaces under a single root directory.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `id`. Derived from the id alone.
    pub fn path_for(&self, id: &JobId) -> PathBuf {
        self.root.join(id.to_string())
    }

    /// Create the job directory and write every input into it.
    ///
    /// Fails if the directory already exists, so two jobs can never share
    /// one. A partially staged workspace is removed before returning an
    /// error.
    pub async fn stage(
        &self,
        id: &JobId,
        files: Vec<InputFile>,
    ) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let root = self.path_for(id);
        match tokio::fs::create_dir(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(WorkspaceError::AlreadyExists(root));
            }
            Err(e) => return Err(e.into()),
        }

        match Self::write_inputs(&root, files).await {
            Ok(inputs) => {
                tracing::debug!(job_id = %id, files = inputs.len(), "Workspace staged");
                Ok(Workspace { root, inputs })
            }
            Err(e) => {
                self.reclaim(&root).await;
                Err(e)
            }
        }
    }

    async fn write_inputs(
        root: &Path,
        files: Vec<InputFile>,
    ) -> Result<Vec<StagedFile>, WorkspaceError> {
        let input_dir = root.join(INPUT_DIR);
        tokio::fs::create_dir(&input_dir).await?;
        tokio::fs::create_dir(root.join(OUTPUT_DIR)).await?;

        let mut used = HashSet::with_capacity(files.len());
        let mut staged = Vec::with_capacity(files.len());
        for file in files {
            let name = unique_name(&sanitize_file_name(&file.name), &mut used);
            let path = input_dir.join(&name);
            tokio::fs::write(&path, &file.bytes).await?;
            staged.push(StagedFile { name, path });
        }
        Ok(staged)
    }

    /// Recursively delete a workspace. Best effort: failures are logged,
    /// never returned.
    ///
    /// Paths outside the manager's root are refused.
    pub async fn reclaim(&self, workspace: &Path) {
        if !workspace.starts_with(&self.root) || workspace == self.root {
            tracing::warn!(
                path = %workspace.display(),
                root = %self.root.display(),
                "Refusing to reclaim path outside workspace root",
            );
            return;
        }

        match tokio::fs::remove_dir_all(workspace).await {
            Ok(()) => {
                tracing::debug!(path = %workspace.display(), "Workspace reclaimed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %workspace.display(), "Workspace already gone");
            }
            Err(e) => {
                tracing::error!(
                    path = %workspace.display(),
                    error = %e,
                    "Failed to reclaim workspace",
                );
            }
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

    // -- sanitize_file_name ---------------------------------------------------

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_file_name("report.docx"), "report.docx");
        assert_eq!(sanitize_file_name("Q3 plan-v2_final.odt"), "Q3 plan-v2_final.odt");
    }

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\doc.doc"), "doc.doc");
        assert_eq!(sanitize_file_name("/abs/path/x.txt"), "x.txt");
    }

    #[test]
    fn sanitize_rejects_dot_names() {
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("dir/.."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name(".hidden.doc"), "hidden.doc");
        assert_eq!(sanitize_file_name(""), FALLBACK_FILE_NAME);
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        assert_eq!(sanitize_file_name("a:b*c?.doc"), "a_b_c_.doc");
        assert_eq!(sanitize_file_name("résumé.doc"), "r_sum_.doc");
    }

    #[test]
    fn sanitize_truncates_long_names() {
        let long = "a".repeat(1000);
        assert_eq!(sanitize_file_name(&long).len(), MAX_FILE_NAME_BYTES);
    }

    // -- unique_name / output_name --------------------------------------------

    #[test]
    fn unique_name_suffixes_collisions() {
        let mut used = HashSet::new();
        assert_eq!(unique_name("a.pdf", &mut used), "a.pdf");
        assert_eq!(unique_name("a.pdf", &mut used), "a-2.pdf");
        assert_eq!(unique_name("a.pdf", &mut used), "a-3.pdf");
        assert_eq!(unique_name("README", &mut used), "README");
        assert_eq!(unique_name("README", &mut used), "README-2");
    }

    #[test]
    fn output_name_replaces_extension() {
        assert_eq!(output_name("report.docx", "pdf"), "report.pdf");
        assert_eq!(output_name("archive.tar.gz", "pdf"), "archive.tar.pdf");
        assert_eq!(output_name("notes", "pdf"), "notes.pdf");
    }

    // -- WorkspaceManager -----------------------------------------------------

    #[tokio::test]
    async fn stage_writes_inputs_inside_job_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let id = JobId::new();

        let ws = manager
            .stage(
                &id,
                vec![
                    InputFile::new("../../escape.doc", b"one".to_vec()),
                    InputFile::new("escape.doc", b"two".to_vec()),
                ],
            )
            .await
            .unwrap();

        assert_eq!(ws.root, tmp.path().join(id.to_string()));
        assert_eq!(ws.inputs.len(), 2);
        assert_eq!(ws.inputs[0].name, "escape.doc");
        assert_eq!(ws.inputs[1].name, "escape-2.doc");
        for input in &ws.inputs {
            assert!(input.path.starts_with(&ws.root));
        }
        assert_eq!(tokio::fs::read(&ws.inputs[1].path).await.unwrap(), b"two");
        assert!(ws.output_dir().is_dir());
        assert!(!tmp.path().join("escape.doc").exists());
    }

    #[tokio::test]
    async fn stage_refuses_existing_workspace() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let id = JobId::new();

        manager.stage(&id, Vec::new()).await.unwrap();
        let second = manager.stage(&id, Vec::new()).await;
        assert_matches!(second, Err(WorkspaceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn reclaim_removes_workspace_and_tolerates_repeats() {
        let tmp = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path());
        let id = JobId::new();
        let ws = manager
            .stage(&id, vec![InputFile::new("a.doc", b"x".to_vec())])
            .await
            .unwrap();

        manager.reclaim(&ws.root).await;
        assert!(!ws.root.exists());

        // Second call must not panic.
        manager.reclaim(&ws.root).await;
    }

    #[tokio::test]
    async fn reclaim_ignores_paths_outside_root() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(tmp.path().join("jobs"));

        manager.reclaim(outside.path()).await;
        assert!(outside.path().exists());
    }
}
