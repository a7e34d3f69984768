use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

const DEFAULT_RECONNECT_MS: u64 = 1500;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 20;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub api_url: String,
    pub socket_url: String,

    pub token: Option<String>,
    pub manager_id: Option<String>,

    pub reconnect_delay: Duration,
    pub http_timeout: Duration,
    pub handshake_timeout: Duration,
    pub download_dir: PathBuf,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let api_url = get("OUTREACH_API_URL")?;
        // Progress can't be observed without the channel
        let socket_url = get("OUTREACH_SOCKET_URL")?;

        let token = optional("OUTREACH_TOKEN");
        let manager_id = optional("OUTREACH_MANAGER_ID");

        let reconnect_ms = parse_or("OUTREACH_RECONNECT_MS", DEFAULT_RECONNECT_MS)?;
        let timeout_secs = parse_or("OUTREACH_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)?;
        let handshake_secs = parse_or("OUTREACH_HANDSHAKE_TIMEOUT_SECS", DEFAULT_HANDSHAKE_TIMEOUT_SECS)?;
        let download_dir = optional("OUTREACH_DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));

        let cfg = Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            socket_url: socket_url.trim_end_matches('/').to_string(),
            token,
            manager_id,
            reconnect_delay: Duration::from_millis(reconnect_ms),
            http_timeout: Duration::from_secs(timeout_secs),
            handshake_timeout: Duration::from_secs(handshake_secs),
            download_dir,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            bail!("OUTREACH_API_URL must start with http:// or https://");
        }
        let socket_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|p| self.socket_url.starts_with(p));
        if !socket_ok {
            bail!("OUTREACH_SOCKET_URL must start with http(s):// or ws(s)://");
        }
        if self.reconnect_delay.is_zero() {
            bail!("OUTREACH_RECONNECT_MS must be greater than zero");
        }
        if self.handshake_timeout.is_zero() {
            bail!("OUTREACH_HANDSHAKE_TIMEOUT_SECS must be greater than zero");
        }
        Ok(())
    }
}

fn get(key: &str) -> Result<String> {
    let v = std::env::var(key).with_context(|| format!("Missing required env var: {key}"))?;
    if v.trim().is_empty() {
        bail!("Required env var is empty: {key}");
    }
    Ok(v)
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or(key: &str, default: u64) -> Result<u64> {
    match optional(key) {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a non-negative integer, got {v:?}")),
        None => Ok(default),
    }
}
