#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

use kneepipe_api::config::{ServerConfig, StorageConfig};
use kneepipe_api::router::build_app_router;
use kneepipe_api::state::AppState;
use kneepipe_db::Stores;
use kneepipe_worker::{GpuReleaser, JobOrchestrator, PipelineConfig};

pub const BOUNDARY: &str = "kneepipe-test-boundary";

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:3000".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
    }
}

/// An app backed by the in-memory store and a scratch data directory.
///
/// The worker is not started, so uploaded jobs stay queued.
pub struct TestApp {
    pub dir: TempDir,
    pub stores: Stores,
    pub storage: StorageConfig,
    state: AppState,
}

impl TestApp {
    pub fn new() -> Self {
        Self::with_max_upload_mb(600)
    }

    pub fn with_max_upload_mb(max_upload_size_mb: u64) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = StorageConfig {
            upload_dir: dir.path().join("uploads"),
            temp_dir: dir.path().join("temp"),
            results_dir: dir.path().join("results"),
            max_upload_size_mb,
            database_url: None,
            run_worker: false,
        };
        let pipeline = PipelineConfig {
            results_dir: storage.results_dir.clone(),
            ..PipelineConfig::default()
        };

        let stores = Stores::memory();
        let orchestrator = Arc::new(JobOrchestrator::new(
            stores.clone(),
            Arc::new(pipeline),
            Arc::new(GpuReleaser::new(None, std::time::Duration::ZERO)),
        ));
        let state = AppState {
            stores: stores.clone(),
            orchestrator,
            config: Arc::new(test_config()),
            storage: Arc::new(storage.clone()),
            worker_enabled: false,
        };

        Self {
            dir,
            stores,
            storage,
            state,
        }
    }

    /// The full router with the production middleware stack.
    pub fn router(&self) -> Router {
        build_app_router(self.state.clone(), &test_config())
    }

    pub async fn get(&self, uri: &str) -> Response {
        get(self.router(), uri).await
    }

    pub async fn upload(&self, parts: &[Part<'_>]) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(multipart_body(parts)))
            .unwrap();
        self.router().oneshot(request).await.unwrap()
    }
}

/// One multipart form part.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a [u8]),
}

pub fn multipart_body(parts: &[Part<'_>]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn get(app: Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}
