use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use progress::JobId;
use reqwest::{header, multipart, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::error::{ApiError, Result};

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Spreadsheet to upload for an import job.
#[derive(Debug, Clone)]
pub struct ImportUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImportUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { file_name: file_name.into(), bytes }
    }

    pub async fn from_path(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ApiError::Io {
            message: format!("Could not read {}: {e}", path.display()),
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "import.xlsx".to_string());
        Ok(Self { file_name, bytes })
    }

    fn mime(&self) -> &'static str {
        let lower = self.file_name.to_ascii_lowercase();
        if lower.ends_with(".xlsx") {
            XLSX_MIME
        } else if lower.ends_with(".xls") {
            "application/vnd.ms-excel"
        } else if lower.ends_with(".csv") {
            "text/csv"
        } else {
            "application/octet-stream"
        }
    }
}

/// Opaque filter bag forwarded to `POST /export` as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExportFilters(BTreeMap<String, JsonValue>);

impl ExportFilters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn status(self, status: impl Into<String>) -> Self {
        self.insert("status", JsonValue::String(status.into()))
    }

    pub fn search(self, text: impl Into<String>) -> Self {
        self.insert("search", JsonValue::String(text.into()))
    }

    pub fn has_email(self, has_email: bool) -> Self {
        self.insert("hasEmail", JsonValue::Bool(has_email))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportJobRow {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub success_count: Option<u64>,
    #[serde(default)]
    pub failed_count: Option<u64>,
    // count or list of duplicate rows depending on backend version
    #[serde(default)]
    pub duplicates: Option<JsonValue>,
    #[serde(default)]
    pub errors: Option<JsonValue>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJobRow {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub total_rows: Option<u64>,
    #[serde(default)]
    pub filters: Option<JsonValue>,
    #[serde(default)]
    pub file_path: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelAck {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Raw export file as served by the download endpoint.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub bytes: Bytes,
    pub content_disposition: Option<String>,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait JobsApi: Send + Sync {
    async fn submit_import(&self, upload: ImportUpload) -> Result<JobId>;
    async fn submit_export(&self, filters: Option<ExportFilters>) -> Result<JobId>;
    async fn import_job(&self, job_id: &JobId) -> Result<ImportJobRow>;
    async fn export_job(&self, job_id: &JobId) -> Result<ExportJobRow>;
    async fn cancel_import(&self, job_id: &JobId) -> Result<CancelAck>;
    async fn fetch_export_artifact(&self, job_id: &JobId) -> Result<Artifact>;
}

pub struct HttpJobsApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpJobsApi {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Unknown { raw: e.to_string() })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        Self::new(&cfg.api_url, cfg.token.clone(), cfg.http_timeout)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn job_url(&self, kind: &str, job_id: &JobId, suffix: &str) -> String {
        let id = urlencoding::encode(job_id.as_str());
        self.url(&format!("{kind}/{id}{suffix}"))
    }

    fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response> {
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        warn!(status = status.as_u16(), "api: request failed");
        Err(ApiError::Transport { status: status.as_u16(), body })
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = self.send(req).await?;
        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode { message: e.to_string() })
    }
}

/// `{jobId}` from a creation response; some routes answer with `{id}`.
fn job_id_from(body: &JsonValue) -> Result<JobId> {
    let raw = body.get("jobId").or_else(|| body.get("id"));
    match raw {
        Some(JsonValue::String(s)) if !s.is_empty() => Ok(JobId::new(s.clone())),
        Some(JsonValue::Number(n)) => Ok(JobId::new(n.to_string())),
        _ => Err(ApiError::Decode {
            message: "response has no job id".to_string(),
        }),
    }
}

#[async_trait]
impl JobsApi for HttpJobsApi {
    async fn submit_import(&self, upload: ImportUpload) -> Result<JobId> {
        let mime = upload.mime();
        let size = upload.bytes.len();
        let part = multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name.clone())
            .mime_str(mime)?;
        let form = multipart::Form::new().part("file", part);

        let body: JsonValue = self
            .send_json(self.client.post(self.url("import/upload")).multipart(form))
            .await?;
        let job_id = job_id_from(&body)?;
        info!(job_id = %job_id, file = %upload.file_name, size, "api: import submitted");
        Ok(job_id)
    }

    async fn submit_export(&self, filters: Option<ExportFilters>) -> Result<JobId> {
        let body: JsonValue = self
            .send_json(self.client.post(self.url("export")).json(&filters))
            .await?;
        let job_id = job_id_from(&body)?;
        info!(job_id = %job_id, filtered = filters.is_some(), "api: export submitted");
        Ok(job_id)
    }

    async fn import_job(&self, job_id: &JobId) -> Result<ImportJobRow> {
        self.send_json(self.client.get(self.job_url("import", job_id, "")))
            .await
    }

    async fn export_job(&self, job_id: &JobId) -> Result<ExportJobRow> {
        self.send_json(self.client.get(self.job_url("export", job_id, "")))
            .await
    }

    async fn cancel_import(&self, job_id: &JobId) -> Result<CancelAck> {
        let resp = self
            .send(self.client.post(self.job_url("import", job_id, "/cancel")))
            .await?;
        let bytes = resp.bytes().await?;
        info!(job_id = %job_id, "api: import cancel requested");
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(CancelAck::default());
        }
        serde_json::from_slice(&bytes).map_err(|e| ApiError::Decode { message: e.to_string() })
    }

    async fn fetch_export_artifact(&self, job_id: &JobId) -> Result<Artifact> {
        let req = self.client.get(self.job_url("export", job_id, "/download"));
        let resp = self.authorized(req).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(job_id = %job_id, status = status.as_u16(), "api: download failed");
            return Err(ApiError::Download { status: status.as_u16(), body });
        }

        let header_str = |name: header::HeaderName| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let content_disposition = header_str(header::CONTENT_DISPOSITION);
        let content_type = header_str(header::CONTENT_TYPE);
        let bytes = resp.bytes().await?;
        debug!(job_id = %job_id, size = bytes.len(), "api: artifact fetched");

        Ok(Artifact { bytes, content_disposition, content_type })
    }
}
