#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use docq_core::converter::{ConvertError, Converter, ConverterConfig};
use docq_scheduler::{Scheduler, SchedulerConfig};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use docq_api::config::ServerConfig;
use docq_api::router::build_app_router;
use docq_api::state::AppState;

const BOUNDARY: &str = "docq-test-boundary";

/// Converter double.
///
/// Inputs whose name contains `fail` fail; anything else produces
/// `%PDF-fake:<input name>`. With a gate, each conversion waits for one
/// permit first.
pub struct FakeConverter {
    gate: Option<Arc<Semaphore>>,
}

#[async_trait]
impl Converter for FakeConverter {
    fn output_format(&self) -> &str {
        "pdf"
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<(), ConvertError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let name = input.file_name().unwrap().to_string_lossy().to_string();
        if name.contains("fail") {
            return Err(ConvertError::Failed {
                exit_code: Some(1),
                stderr: "source file could not be loaded".to_string(),
            });
        }
        tokio::fs::write(output, format!("%PDF-fake:{name}")).await?;
        Ok(())
    }
}

/// A router plus the resources that must outlive it.
pub struct TestApp {
    pub router: Router,
    /// Released one permit per conversion; `None` converts immediately.
    pub gate: Option<Arc<Semaphore>>,
    pub workspace: TempDir,
}

/// Build a test `ServerConfig` with safe defaults rooted at `workspace_root`.
pub fn test_config(workspace_root: &Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        max_upload_bytes: 1024 * 1024,
        max_files_per_job: 5,
        scheduler: SchedulerConfig {
            max_concurrent: 2,
            job_ttl: Duration::from_secs(600),
            workspace_root: workspace_root.to_path_buf(),
        },
        converter: ConverterConfig::default(),
    }
}

/// Build the full application router around a fake converter.
///
/// Uses [`build_app_router`] so tests exercise the same middleware stack
/// (CORS, request ID, timeout, tracing, panic recovery, body limit) as
/// production.
pub fn build_test_app() -> TestApp {
    build_test_app_with(|_| {}, false)
}

/// Like [`build_test_app`], with a config override and an optional gate
/// holding every conversion until permits are added.
pub fn build_test_app_with(configure: impl FnOnce(&mut ServerConfig), gated: bool) -> TestApp {
    let workspace = tempfile::tempdir().unwrap();
    let mut config = test_config(workspace.path());
    configure(&mut config);

    let gate = gated.then(|| Arc::new(Semaphore::new(0)));
    let converter = Arc::new(FakeConverter { gate: gate.clone() });
    let scheduler = Scheduler::new(&config.scheduler, converter);

    let state = AppState {
        scheduler,
        config: Arc::new(config.clone()),
    };

    TestApp {
        router: build_app_router(state, &config),
        gate,
        workspace,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: &Router, uri: &str) -> Response<Body> {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn delete(app: &Router, uri: &str) -> Response<Body> {
    send(app, Request::delete(uri).body(Body::empty()).unwrap()).await
}

pub async fn send(app: &Router, request: Request<Body>) -> Response<Body> {
    app.clone().oneshot(request).await.unwrap()
}

/// POST `files` to `/api/v1/jobs` as `multipart/form-data`.
pub async fn submit(app: &Router, files: &[(&str, &[u8])]) -> Response<Body> {
    send(app, multipart_request("/api/v1/jobs", "files", files)).await
}

pub fn multipart_request(uri: &str, field: &str, files: &[(&str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, bytes) in files {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{name}\"\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::post(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

pub async fn body_bytes(response: Response<Body>) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = body_bytes(response).await;
    serde_json::from_slice(&bytes).unwrap()
}

/// Submit `files` and return the new job id.
pub async fn submit_ok(app: &Router, files: &[(&str, &[u8])]) -> String {
    let response = submit(app, files).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    json["data"]["id"].as_str().unwrap().to_string()
}

/// Poll `GET /api/v1/jobs/{id}` until it reports `status`; returns the
/// `data` object.
pub async fn wait_for_status(app: &Router, id: &str, status: &str) -> serde_json::Value {
    let uri = format!("/api/v1/jobs/{id}");
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let response = get(app, &uri).await;
            if response.status() == StatusCode::OK {
                let json = body_json(response).await;
                if json["data"]["status"] == status {
                    return json["data"].clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {id} never reached status {status}"))
}
