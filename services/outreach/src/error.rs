use serde_json::Value as JsonValue;
use thiserror::Error;

/// Every failure the job API can report. Display is always a short,
/// non-empty message fit for showing to a user.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ApiError {
    #[error("{}", transport_message(.status, .body))]
    Transport { status: u16, body: String },

    #[error("{}", download_message(.status, .body))]
    Download { status: u16, body: String },

    #[error("{}", or_fallback(.message, "Network error"))]
    Network { message: String },

    #[error("Unexpected response: {message}")]
    Decode { message: String },

    #[error("{}", or_fallback(.message, "File error"))]
    Io { message: String },

    #[error("{}", or_fallback(.raw, "Unexpected error"))]
    Unknown { raw: String },
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl ApiError {
    pub fn display_message(&self) -> String {
        self.to_string()
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Transport { status, .. } | ApiError::Download { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode { message: e.to_string() }
        } else if e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() {
            ApiError::Network { message: e.to_string() }
        } else {
            ApiError::Unknown { raw: e.to_string() }
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        ApiError::Io { message: e.to_string() }
    }
}

/// `message`, then `error` from a JSON body, then the plain body text.
fn transport_message(status: &u16, body: &str) -> String {
    let trimmed = body.trim();
    match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(json) => {
            for key in ["message", "error"] {
                if let Some(msg) = json.get(key).and_then(text_of) {
                    return msg;
                }
            }
        }
        Err(_) if !trimmed.is_empty() => return trimmed.to_string(),
        Err(_) => {}
    }
    format!("Request failed with status code {status}")
}

// Some backends send `message` as an array of validation errors.
fn text_of(v: &JsonValue) -> Option<String> {
    match v {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Array(items) => {
            let parts: Vec<&str> = items.iter().filter_map(|i| i.as_str()).collect();
            (!parts.is_empty()).then(|| parts.join(", "))
        }
        _ => None,
    }
}

fn download_message(status: &u16, body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("Failed to download: {status}")
    } else {
        trimmed.to_string()
    }
}

fn or_fallback(s: &str, fallback: &str) -> String {
    if s.trim().is_empty() {
        fallback.to_string()
    } else {
        s.to_string()
    }
}
