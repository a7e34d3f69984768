use std::sync::Arc;
use std::time::Duration;

use outreach::{ApiError, DownloadFinalizer, ExportFilters, HttpJobsApi, ImportUpload, JobsApi};
use progress::JobId;
use serde_json::json;
use wiremock::matchers::{body_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api(server: &MockServer, token: Option<&str>) -> HttpJobsApi {
    HttpJobsApi::new(&server.uri(), token.map(str::to_string), Duration::from_secs(5)).unwrap()
}

fn upload() -> ImportUpload {
    ImportUpload::new("roster.xlsx", b"PK\x03\x04fake".to_vec())
}

#[tokio::test]
async fn test_submit_import_returns_job_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/import/upload"))
        .and(header("authorization", "Bearer tok"))
        .and(body_string_contains("roster.xlsx"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"jobId": "imp-9"})))
        .expect(1)
        .mount(&server)
        .await;

    let job_id = api(&server, Some("tok")).submit_import(upload()).await.unwrap();
    assert_eq!(job_id, JobId::from("imp-9"));
}

#[tokio::test]
async fn test_submit_import_error_message_from_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/import/upload"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"message": "bad file"})))
        .mount(&server)
        .await;

    let err = api(&server, None).submit_import(upload()).await.unwrap_err();
    assert_eq!(err.display_message(), "bad file");
    assert_eq!(err.status(), Some(400));
}

#[tokio::test]
async fn test_submit_import_unrecognized_error_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/import/upload"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"code": 17})))
        .mount(&server)
        .await;

    let err = api(&server, None).submit_import(upload()).await.unwrap_err();
    let msg = err.display_message();
    assert!(!msg.is_empty());
    assert_eq!(msg, "Request failed with status code 400");
}

#[tokio::test]
async fn test_submit_export_forwards_filters() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/export"))
        .and(body_json(json!({"status": "PING_1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobId": "exp-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let filters = ExportFilters::new().status("PING_1");
    let job_id = api(&server, None).submit_export(Some(filters)).await.unwrap();
    assert_eq!(job_id, JobId::from("exp-1"));
}

#[tokio::test]
async fn test_submit_export_without_filters_sends_null() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/export"))
        .and(body_json(json!(null)))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"jobId": "exp-2"})))
        .expect(1)
        .mount(&server)
        .await;

    let job_id = api(&server, None).submit_export(None).await.unwrap();
    assert_eq!(job_id, JobId::from("exp-2"));
}

#[tokio::test]
async fn test_success_without_job_id_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/export"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"queued": true})))
        .mount(&server)
        .await;

    let err = api(&server, None).submit_export(None).await.unwrap_err();
    assert!(matches!(err, ApiError::Decode { .. }));
}

#[tokio::test]
async fn test_unreachable_backend_is_network_error() {
    let api = HttpJobsApi::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
    let err = api.submit_export(None).await.unwrap_err();
    assert!(matches!(err, ApiError::Network { .. }), "got {err:?}");
    assert!(!err.display_message().is_empty());
}

#[tokio::test]
async fn test_job_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/import/imp-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "FAILED",
            "totalRows": 120,
            "successCount": 0,
            "failedCount": 120,
            "duplicates": 0,
            "errors": [{"row": 1, "message": "invalid header row"}],
            "fileName": "roster.xlsx"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/export/exp-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "DONE",
            "totalRows": 100,
            "filters": {"status": "PING_1"},
            "filePath": "/exports/exp-1.xlsx"
        })))
        .mount(&server)
        .await;

    let api = api(&server, None);
    let row = api.import_job(&JobId::from("imp-9")).await.unwrap();
    assert_eq!(row.status.as_deref(), Some("FAILED"));
    assert_eq!(row.failed_count, Some(120));
    assert_eq!(row.extra.get("fileName"), Some(&json!("roster.xlsx")));

    let row = api.export_job(&JobId::from("exp-1")).await.unwrap();
    assert_eq!(row.total_rows, Some(100));
    assert_eq!(row.filters, Some(json!({"status": "PING_1"})));
}

#[tokio::test]
async fn test_cancel_import() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/import/imp-1/cancel"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/import/imp-2/cancel"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({"error": "Job already finished"})))
        .mount(&server)
        .await;

    let api = api(&server, None);
    let ack = api.cancel_import(&JobId::from("imp-1")).await.unwrap();
    assert!(ack.status.is_none());

    let err = api.cancel_import(&JobId::from("imp-2")).await.unwrap_err();
    assert_eq!(err.to_string(), "Job already finished");
}

#[tokio::test]
async fn test_download_saves_named_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export/exp-1/download"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-disposition", r#"attachment; filename="influencers.xlsx""#)
                .set_body_bytes(b"xlsx-bytes".to_vec()),
        )
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let api: Arc<dyn JobsApi> = Arc::new(api(&server, None));
    let finalizer = DownloadFinalizer::new(api, dir.path());

    let saved = finalizer.download(&JobId::from("exp-1")).await.unwrap();
    assert_eq!(saved.path, dir.path().join("influencers.xlsx"));
    assert_eq!(saved.size, 10);
    assert_eq!(std::fs::read(&saved.path).unwrap(), b"xlsx-bytes");

    // downloading again just re-fetches
    let again = finalizer.download(&JobId::from("exp-1")).await.unwrap();
    assert_eq!(again, saved);
}

#[tokio::test]
async fn test_download_without_disposition_uses_job_id() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export/exp-3/download"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"x".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let finalizer = DownloadFinalizer::new(Arc::new(api(&server, None)), dir.path());
    let saved = finalizer.download(&JobId::from("exp-3")).await.unwrap();
    assert_eq!(saved.path, dir.path().join("export-exp-3.xlsx"));
}

#[tokio::test]
async fn test_download_failures() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/export/exp-4/download"))
        .respond_with(ResponseTemplate::new(404).set_body_string("Export file not ready"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/export/exp-5/download"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let finalizer = DownloadFinalizer::new(Arc::new(api(&server, None)), dir.path());

    let err = finalizer.download(&JobId::from("exp-4")).await.unwrap_err();
    assert_eq!(err.display_message(), "Export file not ready");

    let err = finalizer.download(&JobId::from("exp-5")).await.unwrap_err();
    assert_eq!(err.display_message(), "Failed to download: 500");

    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
