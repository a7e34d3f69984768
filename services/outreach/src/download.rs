use std::path::{Path, PathBuf};
use std::sync::Arc;

use progress::JobId;
use tracing::{info, warn};

use crate::api::JobsApi;
use crate::error::{ApiError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct SavedFile {
    pub path: PathBuf,
    pub size: usize,
}

/// Fetches finished export artifacts and writes them to a local directory.
/// Never touches the job registries.
pub struct DownloadFinalizer {
    api: Arc<dyn JobsApi>,
    dir: PathBuf,
}

impl DownloadFinalizer {
    pub fn new(api: Arc<dyn JobsApi>, dir: impl Into<PathBuf>) -> Self {
        Self { api, dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Re-fetches on every call; an existing file with the same name is replaced.
    pub async fn download(&self, job_id: &JobId) -> Result<SavedFile> {
        let artifact = self.api.fetch_export_artifact(job_id).await?;
        let name = filename_from_disposition(artifact.content_disposition.as_deref(), job_id);
        let path = self.dir.join(&name);

        write_atomically(&path, &artifact.bytes).await?;
        info!(job_id = %job_id, path = %path.display(), size = artifact.bytes.len(), "download: saved");

        Ok(SavedFile { path, size: artifact.bytes.len() })
    }
}

async fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    if let Err(e) = tokio::fs::write(&partial, bytes).await {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(ApiError::Io { message: format!("Could not write {}: {e}", path.display()) });
    }
    if let Err(e) = tokio::fs::rename(&partial, path).await {
        warn!(path = %path.display(), "download: rename failed");
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(ApiError::Io { message: format!("Could not save {}: {e}", path.display()) });
    }
    Ok(())
}

/// File name from a Content-Disposition header, else `export-<jobId>.xlsx`.
pub fn filename_from_disposition(header: Option<&str>, job_id: &JobId) -> String {
    header
        .and_then(parse_disposition)
        .and_then(|n| sanitize(&n))
        .unwrap_or_else(|| fallback_name(job_id))
}

fn fallback_name(job_id: &JobId) -> String {
    sanitize(&format!("export-{job_id}.xlsx")).unwrap_or_else(|| "export.xlsx".to_string())
}

fn parse_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';').map(str::trim) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            // RFC 5987: charset'lang'percent-encoded
            "filename*" => {
                let value = value.trim().trim_matches('"');
                let encoded = value.splitn(3, '\'').nth(2).unwrap_or(value);
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    return Some(decoded.into_owned());
                }
            }
            "filename" => {
                plain = Some(value.trim().trim_matches('"').to_string());
            }
            _ => {}
        }
    }
    plain
}

/// Keeps only the last path component.
fn sanitize(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name).trim();
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
        None
    } else {
        Some(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(h: Option<&str>) -> String {
        filename_from_disposition(h, &JobId::from("exp-1"))
    }

    #[test]
    fn test_quoted_filename() {
        assert_eq!(name(Some(r#"attachment; filename="influencers.xlsx""#)), "influencers.xlsx");
        assert_eq!(name(Some("attachment; filename=roster.csv")), "roster.csv");
    }

    #[test]
    fn test_extended_filename_wins() {
        let h = r#"attachment; filename="fallback.xlsx"; filename*=UTF-8''Influenceurs%20%C3%A9t%C3%A9.xlsx"#;
        assert_eq!(name(Some(h)), "Influenceurs été.xlsx");
    }

    #[test]
    fn test_fallback() {
        assert_eq!(name(None), "export-exp-1.xlsx");
        assert_eq!(name(Some("attachment")), "export-exp-1.xlsx");
        assert_eq!(name(Some(r#"attachment; filename="""#)), "export-exp-1.xlsx");
    }

    #[test]
    fn test_strips_directories() {
        assert_eq!(name(Some(r#"attachment; filename="../../etc/passwd""#)), "passwd");
        assert_eq!(name(Some(r#"attachment; filename="C:\\tmp\\x.xlsx""#)), "x.xlsx");
        assert_eq!(name(Some(r#"attachment; filename="..""#)), "export-exp-1.xlsx");
    }

    #[tokio::test]
    async fn test_write_atomically_leaves_no_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.xlsx");
        write_atomically(&path, b"data").await.unwrap();

        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"data");
        assert!(!dir.path().join("nested").join("out.xlsx.part").exists());
    }
}
