//! Integration tests for upload, status, download and stats.

mod common;

use std::io::Write;

use axum::http::{header, StatusCode};
use chrono::Utc;
use common::{body_bytes, body_json, Part, TestApp};
use kneepipe_core::job::{Job, NewJob};
use kneepipe_core::options::JobOptions;
use uuid::Uuid;

const NRRD: &[u8] = b"NRRD0004\ntype: short\ndimension: 3\nsizes: 64 64 64\n\n";

fn dir_is_empty(path: &std::path::Path) -> bool {
    match std::fs::read_dir(path) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => true,
    }
}

/// Insert a finished job whose archive exists on disk.
async fn completed_job(app: &TestApp, contents: &[u8]) -> Job {
    let archive = app.dir.path().join("knee_results.zip");
    std::fs::write(&archive, contents).unwrap();

    let now = Utc::now();
    let mut job = Job::new(
        NewJob {
            id: Uuid::new_v4(),
            input_filename: "knee.nii.gz".into(),
            input_path: "/tmp/knee.nii.gz".into(),
            options: JobOptions::default(),
            retain_for_research: false,
            email: None,
        },
        now,
    );
    app.stores.jobs.create(&job).await.unwrap();
    job.start(now).unwrap();
    job.complete(
        archive.display().to_string(),
        contents.len() as u64,
        Utc::now(),
    )
    .unwrap();
    app.stores.jobs.update(&job).await.unwrap();
    job
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_creates_a_queued_job() {
    let app = TestApp::new();
    let response = app
        .upload(&[
            Part::Text("email", "Someone@Example.org"),
            Part::Text("segmentation_model", "goyal_sagittal"),
            Part::File("knee.nrrd", NRRD),
        ])
        .await;

    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["status"], "queued");
    assert_eq!(json["queue_position"], 1);
    assert_eq!(json["estimated_wait_seconds"], 240);
    assert_eq!(
        json["message"],
        "File uploaded successfully. You are #1 in queue."
    );

    let id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
    let job = app.stores.jobs.get(id).await.unwrap();
    assert_eq!(job.input_filename, "knee.nrrd");
    assert!(job.retain_for_research);
    assert!(std::path::Path::new(&job.input_path).exists());
    assert_eq!(app.stores.queue.length().await.unwrap(), 1);
}

#[tokio::test]
async fn second_upload_queues_behind_the_first() {
    let app = TestApp::new();
    app.upload(&[Part::File("a.nrrd", NRRD)]).await;
    let response = app.upload(&[Part::File("b.nrrd", NRRD)]).await;

    let json = body_json(response).await;
    assert_eq!(json["queue_position"], 2);
    assert_eq!(json["estimated_wait_seconds"], 480);
}

#[tokio::test]
async fn zip_upload_is_extracted() {
    let app = TestApp::new();

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("scan/knee.nrrd", options).unwrap();
        zip.write_all(NRRD).unwrap();
        zip.finish().unwrap();
    }

    let response = app
        .upload(&[Part::File("study.zip", &buf.into_inner())])
        .await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let json = body_json(response).await;
    let id: Uuid = json["job_id"].as_str().unwrap().parse().unwrap();
    let job = app.stores.jobs.get(id).await.unwrap();
    assert!(job.input_path.ends_with("knee.nrrd"));
    assert!(job.input_path.starts_with(&app.storage.temp_dir.display().to_string()));
}

#[tokio::test]
async fn unsupported_extension_is_rejected_without_leftovers() {
    let app = TestApp::new();
    let response = app.upload(&[Part::File("notes.txt", b"hello")]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains(".txt"));
    assert!(dir_is_empty(&app.storage.upload_dir));
    assert_eq!(app.stores.queue.length().await.unwrap(), 0);
}

#[tokio::test]
async fn empty_file_is_rejected() {
    let app = TestApp::new();
    let response = app.upload(&[Part::File("knee.nrrd", b"")]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(dir_is_empty(&app.storage.upload_dir));
}

#[tokio::test]
async fn broken_zip_is_rejected_and_cleaned_up() {
    let app = TestApp::new();
    let response = app.upload(&[Part::File("study.zip", b"not a zip")]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_UPLOAD");
    assert!(dir_is_empty(&app.storage.upload_dir));
    assert!(dir_is_empty(&app.storage.temp_dir));
}

#[tokio::test]
async fn missing_file_field_is_rejected() {
    let app = TestApp::new();
    let response = app.upload(&[Part::Text("email", "a@b.c")]).await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn invalid_options_are_rejected() {
    let app = TestApp::new();
    let response = app
        .upload(&[
            Part::Text("cartilage_smoothing", "7.5"),
            Part::File("knee.nrrd", NRRD),
        ])
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "VALIDATION_ERROR");
    assert!(dir_is_empty(&app.storage.upload_dir));
}

#[tokio::test]
async fn oversized_upload_is_413() {
    let app = TestApp::with_max_upload_mb(0);
    let response = app.upload(&[Part::File("knee.nrrd", NRRD)]).await;

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(dir_is_empty(&app.storage.upload_dir));
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[tokio::test]
async fn status_of_queued_job() {
    let app = TestApp::new();
    let json = body_json(app.upload(&[Part::File("knee.nrrd", NRRD)]).await).await;
    let id = json["job_id"].as_str().unwrap();

    let response = app.get(&format!("/api/v1/status/{id}")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(
        json,
        serde_json::json!({
            "job_id": id,
            "status": "queued",
            "queue_position": 1,
            "estimated_wait_seconds": 240,
        })
    );
}

#[tokio::test]
async fn status_of_completed_job() {
    let app = TestApp::new();
    let job = completed_job(&app, b"zip bytes").await;

    let json = body_json(app.get(&format!("/api/v1/status/{}", job.id)).await).await;
    assert_eq!(json["status"], "complete");
    assert_eq!(json["download_url"], format!("/api/v1/download/{}", job.id));
    assert_eq!(json["result_size_bytes"], 9);
}

#[tokio::test]
async fn status_of_unknown_job_is_404() {
    let app = TestApp::new();
    let response = app
        .get(&format!("/api/v1/status/{}", Uuid::new_v4()))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_job_id_is_400() {
    let app = TestApp::new();
    let response = app.get("/api/v1/status/not-a-uuid").await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

#[tokio::test]
async fn download_streams_the_archive() {
    let app = TestApp::new();
    let job = completed_job(&app, b"zip bytes").await;

    let response = app.get(&format!("/api/v1/download/{}", job.id)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/zip"
    );
    assert_eq!(
        response.headers().get(header::CONTENT_DISPOSITION).unwrap(),
        "attachment; filename=\"knee_results.zip\""
    );
    assert_eq!(body_bytes(response).await, b"zip bytes");
}

#[tokio::test]
async fn download_before_completion_is_400() {
    let app = TestApp::new();
    let json = body_json(app.upload(&[Part::File("knee.nrrd", NRRD)]).await).await;
    let id = json["job_id"].as_str().unwrap();

    let response = app.get(&format!("/api/v1/download/{id}")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert!(json["error"].as_str().unwrap().contains("queued"));
}

#[tokio::test]
async fn download_of_unknown_job_is_404() {
    let app = TestApp::new();
    let response = app
        .get(&format!("/api/v1/download/{}", Uuid::new_v4()))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn download_with_missing_archive_is_404() {
    let app = TestApp::new();
    let job = completed_job(&app, b"zip bytes").await;
    std::fs::remove_file(job.result_path.as_deref().unwrap()).unwrap();

    let response = app.get(&format!("/api/v1/download/{}", job.id)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stats_reflect_queue_and_submitters() {
    let app = TestApp::new();
    app.upload(&[
        Part::Text("email", "someone@example.org"),
        Part::File("a.nrrd", NRRD),
    ])
    .await;
    app.upload(&[
        Part::Text("email", " SOMEONE@example.org "),
        Part::File("b.nrrd", NRRD),
    ])
    .await;

    let response = app.get("/api/v1/stats").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["total_jobs_processed"], 0);
    assert_eq!(json["total_jobs_today"], 0);
    assert_eq!(json["unique_users"], 1);
    assert_eq!(json["jobs_in_queue"], 2);
    assert_eq!(json["average_processing_time_seconds"], 240.0);
    assert_eq!(json["uptime_hours"], 0.0);
}
