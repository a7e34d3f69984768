use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Import,
    Export,
}

impl JobKind {
    /// Name of the channel event carrying this kind's progress.
    pub fn event_name(self) -> &'static str {
        match self {
            JobKind::Import => "import:progress",
            JobKind::Export => "export:progress",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "import:progress" => Some(JobKind::Import),
            "export:progress" => Some(JobKind::Export),
            _ => None,
        }
    }

    /// REST path prefix (`/import`, `/export`).
    pub fn path(self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Export => "export",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// Opaque job identifier assigned by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Latest import status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicates_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // Fields the backend sends that we don't model.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Latest export status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportProgress {
    pub job_id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_ready: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl ImportProgress {
    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_done() || self.error.is_some()
    }
}

impl ExportProgress {
    pub fn is_done(&self) -> bool {
        self.done == Some(true)
    }

    pub fn is_download_ready(&self) -> bool {
        self.download_ready == Some(true)
    }

    pub fn is_terminal(&self) -> bool {
        self.is_done() || self.error.is_some()
    }

    /// Backend-supplied percent, or processed/total once the total is known.
    pub fn percent_complete(&self) -> Option<f64> {
        if let Some(p) = self.percent {
            return Some(p);
        }
        match (self.processed, self.total) {
            (Some(processed), Some(total)) if total > 0 => {
                Some((processed as f64 * 100.0 / total as f64).min(100.0))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    Import(ImportProgress),
    Export(ExportProgress),
}

impl ProgressEvent {
    /// Decodes a raw channel payload. Returns None only when the payload is
    /// not an object or has no non-empty string `jobId`. Known fields that
    /// don't fit their type are left unset and kept verbatim in `extra`.
    pub fn from_payload(kind: JobKind, payload: JsonValue) -> Option<Self> {
        let JsonValue::Object(mut obj) = payload else {
            return None;
        };
        let has_id = obj
            .get("jobId")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if !has_id {
            return None;
        }

        match kind {
            JobKind::Import => {
                let misfits = normalize_fields(&mut obj, IMPORT_FIELDS);
                let mut p: ImportProgress = serde_json::from_value(JsonValue::Object(obj)).ok()?;
                p.extra.extend(misfits);
                Some(ProgressEvent::Import(p))
            }
            JobKind::Export => {
                let misfits = normalize_fields(&mut obj, EXPORT_FIELDS);
                let mut p: ExportProgress = serde_json::from_value(JsonValue::Object(obj)).ok()?;
                p.extra.extend(misfits);
                Some(ProgressEvent::Export(p))
            }
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            ProgressEvent::Import(_) => JobKind::Import,
            ProgressEvent::Export(_) => JobKind::Export,
        }
    }

    pub fn job_id(&self) -> &JobId {
        match self {
            ProgressEvent::Import(p) => &p.job_id,
            ProgressEvent::Export(p) => &p.job_id,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            ProgressEvent::Import(p) => p.error.as_deref(),
            ProgressEvent::Export(p) => p.error.as_deref(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            ProgressEvent::Import(p) => p.is_terminal(),
            ProgressEvent::Export(p) => p.is_terminal(),
        }
    }
}

#[derive(Clone, Copy)]
enum Shape {
    Count,
    Flag,
    Percent,
    Text,
}

const IMPORT_FIELDS: &[(&str, Shape)] = &[
    ("processed", Shape::Count),
    ("success", Shape::Count),
    ("failed", Shape::Count),
    ("duplicatesCount", Shape::Count),
    ("done", Shape::Flag),
    ("error", Shape::Text),
];

const EXPORT_FIELDS: &[(&str, Shape)] = &[
    ("processed", Shape::Count),
    ("total", Shape::Count),
    ("percent", Shape::Percent),
    ("done", Shape::Flag),
    ("downloadReady", Shape::Flag),
    ("error", Shape::Text),
];

impl Shape {
    fn coerce(self, value: &JsonValue) -> Option<JsonValue> {
        match self {
            Shape::Count => match value {
                JsonValue::Number(n) if n.is_u64() => Some(value.clone()),
                JsonValue::Number(n) => n
                    .as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                    .map(|f| JsonValue::from(f as u64)),
                _ => None,
            },
            Shape::Flag => value.is_boolean().then(|| value.clone()),
            Shape::Percent => value.as_f64().map(JsonValue::from),
            // an error of any shape still ends the job
            Shape::Text => Some(match value {
                JsonValue::String(_) => value.clone(),
                JsonValue::Object(o) => match o.get("message").and_then(|m| m.as_str()) {
                    Some(msg) => JsonValue::from(msg),
                    None => JsonValue::from(value.to_string()),
                },
                other => JsonValue::from(other.to_string()),
            }),
        }
    }
}

/// Brings known fields into shape in place and takes out the ones that can't
/// be, returning them so they survive in `extra`.
fn normalize_fields(obj: &mut Map<String, JsonValue>, fields: &[(&str, Shape)]) -> Map<String, JsonValue> {
    let mut misfits = Map::new();
    for &(key, shape) in fields {
        let coerced = match obj.get(key) {
            None | Some(JsonValue::Null) => continue,
            Some(v) => shape.coerce(v),
        };
        match coerced {
            Some(v) => {
                obj.insert(key.to_string(), v);
            }
            None => {
                if let Some(raw) = obj.remove(key) {
                    misfits.insert(key.to_string(), raw);
                }
            }
        }
    }
    misfits
}
