//! Handlers for the `/jobs` resource and the queue snapshot.
//!
//! Submission only stages files and queues the job; conversion happens in
//! the background. Clients poll `GET /jobs/{id}` until the job is `done`
//! or `error`, then fetch `/jobs/{id}/download`, which also cleans the job
//! up. Unclaimed jobs are reclaimed automatically after the TTL.

use std::io::{Cursor, Write};

use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, Path, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use docq_core::error::CoreError;
use docq_core::job::{JobId, JobStatus, JobStatusView};
use docq_core::workspace::{split_extension, InputFile};
use docq_scheduler::{Artifact, QueueStats};
use serde::Serialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Multipart field carrying the uploaded documents.
pub const FILES_FIELD: &str = "files";

/// Name of the archive returned when a job produced several outputs.
pub const BUNDLE_NAME: &str = "converted.zip";

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

/// Returned by `POST /jobs`.
#[derive(Debug, Serialize)]
pub struct SubmittedJob {
    pub id: JobId,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

/// Returned by `GET /jobs/{id}`: the status view plus a download link once
/// the job is `done`.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub id: JobId,
    #[serde(flatten)]
    pub view: JobStatusView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Parse a job id from the path. Malformed ids are reported exactly like
/// unknown ones.
fn parse_job_id(raw: &str) -> AppResult<JobId> {
    JobId::parse(raw).ok_or(AppError::Core(CoreError::NotFound))
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::BadRequest(e.body_text())
    }
}

fn content_type_for(name: &str) -> &'static str {
    match split_extension(name).1.map(str::to_ascii_lowercase).as_deref() {
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("txt") => "text/plain; charset=utf-8",
        Some("html") => "text/html; charset=utf-8",
        Some("odt") => "application/vnd.oasis.opendocument.text",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        _ => "application/octet-stream",
    }
}

fn attachment(name: &str, bytes: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [
            (CONTENT_TYPE, content_type_for(name).to_string()),
            (
                CONTENT_DISPOSITION,
                format!("attachment; filename=\"{name}\""),
            ),
        ],
        bytes,
    )
        .into_response()
}

/// Bundle artifacts into an in-memory ZIP archive, in the given order.
pub fn zip_artifacts(artifacts: &[Artifact]) -> zip::result::ZipResult<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    for artifact in artifacts {
        writer.start_file(artifact.name.as_str(), options)?;
        writer.write_all(&artifact.bytes)?;
    }

    Ok(writer.finish()?.into_inner())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Accepts `multipart/form-data` with one or more `files` fields. Returns
/// 202 with the job id as soon as the job is queued.
pub async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DataResponse<SubmittedJob>>)> {
    let max_files = state.config.max_files_per_job;
    let mut files: Vec<InputFile> = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some(FILES_FIELD) {
            continue; // ignore unknown fields
        }
        if files.len() == max_files {
            return Err(AppError::BadRequest(format!(
                "Too many files: at most {max_files} per job"
            )));
        }
        let name = field.file_name().unwrap_or_default().to_string();
        let data = field.bytes().await.map_err(multipart_error)?;
        files.push(InputFile::new(name, data.to_vec()));
    }

    if files.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Missing required '{FILES_FIELD}' field"
        )));
    }

    let submission = state.scheduler.submit(files).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(DataResponse {
            data: SubmittedJob {
                id: submission.id,
                status: submission.status,
                position: submission.position,
            },
        }),
    ))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<DataResponse<JobStatusResponse>>> {
    let id = parse_job_id(&id)?;
    let view = state.scheduler.status(&id).await?;
    let download_url =
        (view.status() == JobStatus::Done).then(|| format!("/api/v1/jobs/{id}/download"));

    Ok(Json(DataResponse {
        data: JobStatusResponse {
            id,
            view,
            download_url,
        },
    }))
}

/// GET /api/v1/jobs/{id}/download
///
/// A single output is returned as-is; several are bundled into
/// `converted.zip`. The job is cleaned up once the outputs are read, so a
/// second download returns 404.
pub async fn download_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    let id = parse_job_id(&id)?;
    let mut artifacts = state.scheduler.download(&id).await?;

    if artifacts.len() == 1 {
        let Artifact { name, bytes } = artifacts.remove(0);
        return Ok(attachment(&name, bytes));
    }
    if artifacts.is_empty() {
        return Err(AppError::InternalError(format!(
            "Job {id} is done but has no outputs"
        )));
    }

    let count = artifacts.len();
    let archive = tokio::task::spawn_blocking(move || zip_artifacts(&artifacts))
        .await
        .map_err(|e| AppError::InternalError(format!("Bundling task failed: {e}")))?
        .map_err(|e| AppError::InternalError(format!("Failed to build archive: {e}")))?;

    tracing::debug!(job_id = %id, files = count, bytes = archive.len(), "Outputs bundled");
    Ok(attachment(BUNDLE_NAME, archive))
}

/// DELETE /api/v1/jobs/{id}
///
/// Discard a finished job without downloading it. Returns 204, 404 for
/// unknown ids, or 409 while the job is still pending or running.
pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<StatusCode> {
    let id = parse_job_id(&id)?;
    if state.scheduler.cleanup(&id).await {
        return Ok(StatusCode::NO_CONTENT);
    }

    let view = state.scheduler.status(&id).await?;
    Err(AppError::Core(CoreError::Conflict(format!(
        "Job is still {}",
        view.status()
    ))))
}

/// GET /api/v1/stats
pub async fn queue_stats(State(state): State<AppState>) -> Json<DataResponse<QueueStats>> {
    Json(DataResponse {
        data: state.scheduler.stats().await,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn content_type_follows_extension() {
        assert_eq!(content_type_for("report.pdf"), "application/pdf");
        assert_eq!(content_type_for("REPORT.PDF"), "application/pdf");
        assert_eq!(content_type_for("converted.zip"), "application/zip");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn malformed_ids_are_not_found() {
        assert_matches!(
            parse_job_id("../../etc/passwd"),
            Err(AppError::Core(CoreError::NotFound))
        );
        assert!(parse_job_id(&JobId::new().to_string()).is_ok());
    }

    #[test]
    fn bundle_preserves_order() {
        let artifacts = vec![
            Artifact {
                name: "b.pdf".to_string(),
                bytes: b"second".to_vec(),
            },
            Artifact {
                name: "a.pdf".to_string(),
                bytes: b"first".to_vec(),
            },
        ];
        let bytes = zip_artifacts(&artifacts).unwrap();
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).unwrap();
        assert_eq!(archive.len(), 2);
        assert_eq!(archive.by_index(0).unwrap().name(), "b.pdf");
        assert_eq!(archive.by_index(1).unwrap().name(), "a.pdf");
    }
}
