use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use crate::types::{ExportProgress, ImportProgress, JobId};

const UPDATE_BUFFER: usize = 256;

/// Progress payload stored by a [`JobRegistry`].
pub trait Snapshot: Clone + Send + Sync + 'static {
    fn job_id(&self) -> &JobId;
    fn is_terminal(&self) -> bool;
}

impl Snapshot for ImportProgress {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn is_terminal(&self) -> bool {
        ImportProgress::is_terminal(self)
    }
}

impl Snapshot for ExportProgress {
    fn job_id(&self) -> &JobId {
        &self.job_id
    }

    fn is_terminal(&self) -> bool {
        ExportProgress::is_terminal(self)
    }
}

#[derive(Debug, Clone)]
pub struct RegistryUpdate<P> {
    pub job_id: JobId,
    pub snapshot: P,
}

#[derive(Debug, Clone)]
struct Entry<P> {
    snapshot: P,
    received_at: DateTime<Utc>,
}

/// Latest known snapshot per job. Each apply replaces the whole entry.
pub struct JobRegistry<P: Snapshot> {
    entries: RwLock<HashMap<JobId, Entry<P>>>,
    updates: broadcast::Sender<RegistryUpdate<P>>,
}

impl<P: Snapshot> JobRegistry<P> {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(UPDATE_BUFFER);
        Self {
            entries: RwLock::new(HashMap::new()),
            updates,
        }
    }

    pub fn apply(&self, snapshot: P) {
        self.apply_at(snapshot, Utc::now());
    }

    pub fn apply_at(&self, snapshot: P, received_at: DateTime<Utc>) {
        let job_id = snapshot.job_id().clone();
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            entries.insert(
                job_id.clone(),
                Entry {
                    snapshot: snapshot.clone(),
                    received_at,
                },
            );
        }
        // No observers is fine
        let _ = self.updates.send(RegistryUpdate { job_id, snapshot });
    }

    /// None means no event was ever seen for this id.
    pub fn get(&self, job_id: &JobId) -> Option<P> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(job_id).map(|e| e.snapshot.clone())
    }

    pub fn received_at(&self, job_id: &JobId) -> Option<DateTime<Utc>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(job_id).map(|e| e.received_at)
    }

    /// Non-terminal jobs whose last update is older than `older_than`.
    pub fn idle_jobs(&self, now: DateTime<Utc>, older_than: Duration) -> Vec<JobId> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut idle: Vec<JobId> = entries
            .iter()
            .filter(|(_, e)| !e.snapshot.is_terminal() && now - e.received_at > older_than)
            .map(|(id, _)| id.clone())
            .collect();
        idle.sort();
        idle
    }

    pub fn remove(&self, job_id: &JobId) -> Option<P> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(job_id).map(|e| e.snapshot)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<JobId> = entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receives every snapshot applied after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryUpdate<P>> {
        self.updates.subscribe()
    }
}

impl<P: Snapshot> Default for JobRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
pub struct Registries {
    pub imports: JobRegistry<ImportProgress>,
    pub exports: JobRegistry<ExportProgress>,
}

impl Registries {
    pub fn new() -> Self {
        Self::default()
    }
}
