pub mod api;
pub mod channel;
pub mod config;
pub mod download;
pub mod error;

pub use api::{ExportFilters, HttpJobsApi, ImportUpload, JobsApi};
pub use channel::{ChannelConfig, ChannelHandle, ChannelStatus, ProgressChannel};
pub use config::AppConfig;
pub use download::{DownloadFinalizer, SavedFile};
pub use error::ApiError;
