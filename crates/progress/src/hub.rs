use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::Value as JsonValue;
use tracing::trace;

use crate::registry::Registries;
use crate::types::{JobId, JobKind, ProgressEvent};

type Callback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

struct Watcher {
    job_id: JobId,
    callback: Callback,
}

#[derive(Default)]
struct WatchTable {
    next_id: AtomicU64,
    watchers: Mutex<BTreeMap<u64, Watcher>>,
}

impl WatchTable {
    fn detach(&self, id: u64) {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn is_attached(&self, id: u64) -> bool {
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

/// Per-job callbacks layered over the shared event stream.
#[derive(Clone, Default)]
pub struct WatchHub {
    table: Arc<WatchTable>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch<F>(&self, job_id: JobId, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = self.table.next_id.fetch_add(1, Ordering::Relaxed);
        self.table
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Watcher {
                    job_id,
                    callback: Arc::new(callback),
                },
            );

        Subscription {
            target: Some((Arc::downgrade(&self.table), id)),
            active: AtomicBool::new(true),
        }
    }

    /// Calls every watcher of the event's job once. Callbacks run outside the
    /// lock so they may watch or unsubscribe re-entrantly; a watcher detached
    /// by an earlier callback is skipped.
    pub fn dispatch(&self, event: &ProgressEvent) -> usize {
        let matching: Vec<(u64, Callback)> = {
            let watchers = self
                .table
                .watchers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            watchers
                .iter()
                .filter(|(_, w)| &w.job_id == event.job_id())
                .map(|(id, w)| (*id, w.callback.clone()))
                .collect()
        };

        let mut called = 0;
        for (id, cb) in &matching {
            if !self.table.is_attached(*id) {
                continue;
            }
            cb(event);
            called += 1;
        }
        called
    }

    pub fn watcher_count(&self) -> usize {
        self.table
            .watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle for one `watch` call. Unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    target: Option<(Weak<WatchTable>, u64)>,
    active: AtomicBool,
}

impl Subscription {
    /// A subscription attached to nothing.
    pub fn noop() -> Self {
        Self {
            target: None,
            active: AtomicBool::new(false),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Detaches this watcher only. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some((table, id)) = &self.target {
            if let Some(table) = table.upgrade() {
                table.detach(*id);
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.target.as_ref().map(|(_, id)| *id))
            .field("active", &self.is_active())
            .finish()
    }
}

/// Registries plus watchers: the single sink for inbound channel events.
#[derive(Default)]
pub struct ProgressHub {
    pub registries: Registries,
    pub watchers: WatchHub,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes a raw channel event. Returns false when the event was ignored
    /// (unknown name or malformed payload).
    pub fn handle_event(&self, event_name: &str, payload: JsonValue) -> bool {
        let Some(kind) = JobKind::from_event_name(event_name) else {
            trace!(event = event_name, "hub: ignoring event");
            return false;
        };
        match ProgressEvent::from_payload(kind, payload) {
            Some(event) => {
                self.apply(event);
                true
            }
            None => {
                trace!(event = event_name, "hub: dropped malformed payload");
                false
            }
        }
    }

    pub fn apply(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::Import(p) => self.registries.imports.apply(p.clone()),
            ProgressEvent::Export(p) => self.registries.exports.apply(p.clone()),
        }
        self.watchers.dispatch(&event);
    }

    pub fn watch<F>(&self, job_id: JobId, callback: F) -> Subscription
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        self.watchers.watch(job_id, callback)
    }
}
