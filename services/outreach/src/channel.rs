//! Process-wide realtime progress channel (Socket.IO over websocket).
//!
//! One connection per [`ProgressChannel`]; every consumer shares it through
//! cloned [`ChannelHandle`]s. Dropping handles or subscriptions never closes
//! the connection, only [`ProgressChannel::shutdown`] does.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use progress::packet::{self, Frame, DEFAULT_NAMESPACE};
use progress::{JobId, ProgressEvent, ProgressHub, Subscription};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::AppConfig;

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub socket_url: String,
    pub manager_id: Option<String>,
    pub reconnect_delay: Duration,
    /// Limit for the websocket connect and the Engine.IO open frame.
    pub handshake_timeout: Duration,
}

impl ChannelConfig {
    pub fn from_app(cfg: &AppConfig) -> Self {
        Self {
            socket_url: cfg.socket_url.clone(),
            manager_id: cfg.manager_id.clone(),
            reconnect_delay: cfg.reconnect_delay,
            handshake_timeout: cfg.handshake_timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    Connected { sid: String },
    /// Last attempt failed; a reconnect is scheduled.
    Disconnected { error: String },
    Closed,
}

#[derive(Debug, Error)]
enum ChannelError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("socket error: {0}")]
    Socket(String),

    #[error("connection rejected: {0}")]
    Rejected(String),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("server closed the connection")]
    Closed,
}

/// Cheap, cloneable view of a running channel.
#[derive(Clone)]
pub struct ChannelHandle {
    hub: Arc<ProgressHub>,
    status: watch::Receiver<ChannelStatus>,
}

impl ChannelHandle {
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    pub fn watch<F>(&self, job_id: JobId, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.hub.watch(job_id, callback)
    }

    /// Latest snapshot for the job from either registry.
    pub fn latest(&self, job_id: &JobId) -> Option<ProgressEvent> {
        let regs = &self.hub.registries;
        regs.imports
            .get(job_id)
            .map(ProgressEvent::Import)
            .or_else(|| regs.exports.get(job_id).map(ProgressEvent::Export))
    }

    /// Feeds every update for `job_id` to `on_update` until a terminal
    /// snapshot arrives. None if the channel is shut down first.
    pub async fn wait_for_terminal<F>(&self, job_id: &JobId, mut on_update: F) -> Option<ProgressEvent>
    where
        F: FnMut(&ProgressEvent),
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = self.watch(job_id.clone(), move |ev| {
            let _ = tx.send(ev.clone());
        });

        // events that landed before we subscribed
        let mut delivered = self.latest(job_id);
        if let Some(ev) = &delivered {
            on_update(ev);
            if ev.is_terminal() {
                return delivered;
            }
        }

        let mut status = self.status.clone();
        loop {
            if *status.borrow() == ChannelStatus::Closed {
                return None;
            }
            tokio::select! {
                Some(ev) = rx.recv() => {
                    // may be the same event `latest` already handed over
                    if delivered.take().is_some_and(|prev| prev == ev) {
                        continue;
                    }
                    on_update(&ev);
                    if ev.is_terminal() {
                        return Some(ev);
                    }
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

struct Running {
    handle: ChannelHandle,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Owns the single connection. Inject it where consumers need progress.
pub struct ProgressChannel {
    config: ChannelConfig,
    hub: Arc<ProgressHub>,
    running: Mutex<Option<Running>>,
}

impl ProgressChannel {
    pub fn new(config: ChannelConfig, hub: Arc<ProgressHub>) -> Self {
        Self {
            config,
            hub,
            running: Mutex::new(None),
        }
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    /// Starts the connection task on first call; later calls return the
    /// existing handle and ignore `token`.
    pub fn init(&self, token: Option<String>) -> ChannelHandle {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(r) = running.as_ref() {
            return r.handle.clone();
        }

        let (status_tx, status_rx) = watch::channel(ChannelStatus::Connecting);
        let handle = ChannelHandle {
            hub: self.hub.clone(),
            status: status_rx,
        };
        let cancel = CancellationToken::new();

        let task = match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let config = self.config.clone();
                let hub = self.hub.clone();
                let cancel = cancel.clone();
                Some(rt.spawn(run_channel(config, token, hub, status_tx, cancel)))
            }
            Err(e) => {
                warn!("channel: cannot start without a tokio runtime");
                status_tx.send_replace(ChannelStatus::Disconnected { error: e.to_string() });
                None
            }
        };

        *running = Some(Running {
            handle: handle.clone(),
            cancel,
            task,
        });
        handle
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|r| r.handle.clone())
    }

    /// No-op subscription when the channel was never initialized.
    pub fn watch<F>(&self, job_id: JobId, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        match self.handle() {
            Some(h) => h.watch(job_id, callback),
            None => Subscription::noop(),
        }
    }

    /// Closes the connection and stops reconnecting. A later `init` opens a
    /// fresh connection.
    pub async fn shutdown(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut r) = running else {
            return;
        };
        r.cancel.cancel();
        if let Some(task) = r.task.take() {
            let _ = task.await;
        }
        info!("channel: shut down");
    }
}

impl Drop for ProgressChannel {
    fn drop(&mut self) {
        if let Some(r) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            r.cancel.cancel();
        }
    }
}

/// `http(s)://host[/path]` to the Engine.IO websocket endpoint.
pub fn socket_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };
    let base = base.strip_suffix("/socket.io").unwrap_or(&base);
    format!("{base}/socket.io/?EIO=4&transport=websocket")
}

async fn run_channel(
    config: ChannelConfig,
    token: Option<String>,
    hub: Arc<ProgressHub>,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
) {
    let url = socket_endpoint(&config.socket_url);
    info!(url = %url, "channel: starting");

    loop {
        status.send_replace(ChannelStatus::Connecting);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            r = connect_and_stream(&url, token.as_deref(), &config, &hub, &status) => r,
        };

        let error = match outcome {
            Ok(()) => ChannelError::Closed.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(
            error = %error,
            retry_ms = config.reconnect_delay.as_millis() as u64,
            "channel: disconnected"
        );
        status.send_replace(ChannelStatus::Disconnected { error });

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    status.send_replace(ChannelStatus::Closed);
}

async fn connect_and_stream(
    url: &str,
    token: Option<&str>,
    config: &ChannelConfig,
    hub: &ProgressHub,
    status: &watch::Sender<ChannelStatus>,
) -> Result<(), ChannelError> {
    let (ws_stream, _) = tokio::time::timeout(config.handshake_timeout, connect_async(url))
        .await
        .map_err(|_| ChannelError::Timeout("connect"))?
        .map_err(|e| ChannelError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws_stream.split();

    let auth: Option<JsonValue> = token.map(|t| json!({ "token": t }));
    // set from the handshake; server pings at least this often
    let mut heartbeat: Option<Duration> = None;

    loop {
        let (limit, phase) = match heartbeat {
            Some(limit) => (limit, "heartbeat"),
            None => (config.handshake_timeout, "handshake"),
        };
        let next = tokio::time::timeout(limit, stream.next())
            .await
            .map_err(|_| ChannelError::Timeout(phase))?;

        let text = match next {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | None => return Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(ChannelError::Socket(e.to_string())),
        };

        let frame = match packet::decode(text.as_str()) {
            Ok(f) => f,
            Err(e) => {
                trace!(error = %e, "channel: undecodable frame");
                continue;
            }
        };

        let reply = match frame {
            Frame::Open(hs) => {
                debug!(sid = %hs.sid, ping_interval = hs.ping_interval, "channel: engine open");
                heartbeat = Some(Duration::from_millis(hs.ping_interval + hs.ping_timeout));
                Some(packet::encode_connect(auth.as_ref()))
            }
            Frame::Ping(payload) => Some(packet::encode_pong(&payload)),
            Frame::Connect { namespace, data } if namespace == DEFAULT_NAMESPACE => {
                let sid = data
                    .as_ref()
                    .and_then(|d| d.get("sid"))
                    .and_then(|s| s.as_str())
                    .unwrap_or_default()
                    .to_string();
                info!(sid = %sid, "channel: connected");
                status.send_replace(ChannelStatus::Connected { sid });

                config.manager_id.as_ref().map(|id| {
                    info!(manager_id = %id, "channel: joining room");
                    packet::encode_event("join", &[JsonValue::String(id.clone())])
                })
            }
            Frame::ConnectError { message, .. } => return Err(ChannelError::Rejected(message)),
            Frame::Event { namespace, name, args } if namespace == DEFAULT_NAMESPACE => {
                let payload = args.into_iter().next().unwrap_or(JsonValue::Null);
                hub.handle_event(&name, payload);
                None
            }
            Frame::Close | Frame::Disconnect { .. } => return Ok(()),
            _ => None,
        };

        if let Some(out) = reply {
            sink.send(Message::Text(out.into()))
                .await
                .map_err(|e| ChannelError::Socket(e.to_string()))?;
        }
    }
}
