//! Import/export job progress: snapshots, registries, per-job watchers and
//! the Socket.IO frame codec used by the progress channel.

mod hub;
pub mod packet;
mod registry;
mod types;

pub use hub::{ProgressHub, Subscription, WatchHub};
pub use registry::{JobRegistry, Registries, RegistryUpdate, Snapshot};
pub use types::{ExportProgress, ImportProgress, JobId, JobKind, ProgressEvent};
