//! Transfer job scheduling for object storage.
//!
//! Jobs (uploads and downloads) are small state machines owned by a
//! manager that schedules them greedily in insertion order under a
//! concurrency ceiling, persists their snapshots across restarts, and
//! surfaces presentation data for a host UI. The actual storage
//! protocol lives behind the [`ObjectClient`] adapter trait from
//! `duffel-storage`.
//!
//! [`ObjectClient`]: duffel_storage::ObjectClient

use std::time::Duration;

use duffel_storage::{StorageError, StoreError};

pub mod commands;
pub mod download;
pub mod download_manager;
pub mod job;
pub mod manager;
pub mod persist;
pub mod single_flight;
pub mod speed;
pub mod status;
pub mod upload;
pub mod upload_manager;

pub use commands::{
    CommandReply, DownloadCommand, UploadCommand, handle_download_command, handle_upload_command,
};
pub use download::{DownloadJob, DownloadOptions, temp_file_path};
pub use download_manager::{DownloadManager, WalkControl};
pub use job::{EventReceiver, EventSender, JobEvent, Progress, TransferJob, UiData};
pub use manager::{
    ConfigUpdate, JobCounters, JobPage, JobQuery, ManagerCore, ManagerHooks, TransferConfig,
};
pub use persist::{DownloadPersistInfo, LocalDestination, LocalFileRef, PersistInfo, UploadPersistInfo};
pub use single_flight::SingleFlight;
pub use status::Status;
pub use upload::{UploadJob, UploadOptions};
pub use upload_manager::{UploadManager, resolve_part_size};

/// Default multipart part size: 8 MiB.
pub const DEFAULT_MULTIPART_SIZE: u64 = 8 * 1024 * 1024;

/// Files at or above this size upload via the multipart path: 100 MiB.
pub const DEFAULT_MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;

/// Hard backend limit on parts per multipart upload.
pub const MAX_MULTIPART_PARTS: u64 = 10_000;

/// Part sizes are whole multiples of this when auto-grown: 4 MiB.
pub const MIN_PART_GRANULARITY: u64 = 4 * 1024 * 1024;

/// First retry delay; doubles per attempt.
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Retry delay ceiling.
pub const BACKOFF_CAP: Duration = Duration::from_secs(60);

/// Errors surfaced by managers and jobs.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("verification failed: {0}")]
    Verify(String),

    #[error("unknown job id: {0}")]
    UnknownJob(String),
}

impl TransferError {
    /// Whether this is the user-cancellation sentinel rather than a
    /// real failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Storage(e) if e.is_cancelled())
    }
}
