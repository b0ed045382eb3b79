//! Upload-side manager: local tree walking, remote directory
//! creation, and recovery of persisted upload jobs.
//!
//! Directory markers are created while walking, deduplicated through
//! a [`SingleFlight`] so overlapping walks (two selections sharing a
//! subtree) issue one remote call per directory. Recovery
//! cross-checks each snapshot against the file on disk and discards
//! progress when the size/mtime fingerprint changed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use tracing::{debug, info, warn};

use duffel_storage::{BoxFuture, JobStore, ObjectClient, ObjectRef};

use crate::manager::{ManagerCore, ManagerHooks, TransferConfig};
use crate::persist::{LocalFileRef, PersistInfo, UploadPersistInfo};
use crate::single_flight::SingleFlight;
use crate::upload::{UploadJob, UploadOptions};
use crate::{MAX_MULTIPART_PARTS, MIN_PART_GRANULARITY, TransferError};

pub struct UploadManager {
    core: Arc<ManagerCore>,
    client: Arc<dyn ObjectClient>,
    dir_flights: SingleFlight<()>,
}

impl std::ops::Deref for UploadManager {
    type Target = ManagerCore;

    fn deref(&self) -> &ManagerCore {
        &self.core
    }
}

impl UploadManager {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        store: Arc<dyn JobStore>,
        config: TransferConfig,
        hooks: ManagerHooks,
    ) -> Self {
        Self {
            core: ManagerCore::new(store, config, hooks),
            client,
            dir_flights: SingleFlight::new(),
        }
    }

    /// Queues upload jobs for `paths` (files and directories), rooted
    /// at `key_prefix` inside the bucket. Each file goes through an
    /// admission pass as it is queued, so transfers start while the
    /// walk is still running. Returns the number of jobs added.
    /// Unreadable entries are reported and skipped; the walk carries
    /// on.
    pub async fn add_jobs_from_paths(
        &self,
        region: &str,
        bucket: &str,
        key_prefix: &str,
        paths: &[PathBuf],
    ) -> usize {
        let mut added = 0;
        for path in paths {
            let meta = match tokio::fs::metadata(path).await {
                Ok(meta) => meta,
                Err(e) => {
                    self.core.report(e.into());
                    continue;
                }
            };
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if meta.is_dir() {
                let key = format!("{key_prefix}{name}/");
                self.ensure_remote_dir(region, bucket, &key).await;
                added += self.walk_dir(region, bucket, key, path.clone()).await;
            } else {
                added +=
                    self.add_file_job(region, bucket, format!("{key_prefix}{name}"), path, &meta);
            }
        }
        info!(added, bucket, key_prefix, "queued upload jobs");
        added
    }

    fn walk_dir<'a>(
        &'a self,
        region: &'a str,
        bucket: &'a str,
        key_prefix: String,
        dir: PathBuf,
    ) -> BoxFuture<'a, usize> {
        Box::pin(async move {
            let mut added = 0;
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.core.report(e.into());
                    return 0;
                }
            };
            loop {
                match entries.next_entry().await {
                    Ok(Some(entry)) => {
                        let meta = match entry.metadata().await {
                            Ok(meta) => meta,
                            Err(e) => {
                                self.core.report(e.into());
                                continue;
                            }
                        };
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if meta.is_dir() {
                            let key = format!("{key_prefix}{name}/");
                            self.ensure_remote_dir(region, bucket, &key).await;
                            added += self.walk_dir(region, bucket, key, entry.path()).await;
                        } else if meta.is_file() {
                            added += self.add_file_job(
                                region,
                                bucket,
                                format!("{key_prefix}{name}"),
                                &entry.path(),
                                &meta,
                            );
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.core.report(e.into());
                        break;
                    }
                }
            }
            added
        })
    }

    /// Creates the remote directory marker for `key`, at most once per
    /// `region:bucket:key` across all concurrent walks.
    pub(crate) async fn ensure_remote_dir(&self, region: &str, bucket: &str, key: &str) {
        let flight_key = format!("{region}:{bucket}:{key}");
        let client = Arc::clone(&self.client);
        let region = region.to_string();
        let object = ObjectRef::new(bucket, key);
        let outcome = self
            .dir_flights
            .call(&flight_key, move || async move {
                client.create_dir_marker(&region, &object).await
            })
            .await;
        if let Err(message) = outcome {
            warn!(key = %flight_key, %message, "remote directory creation failed");
        }
    }

    fn add_file_job(
        &self,
        region: &str,
        bucket: &str,
        key: String,
        path: &Path,
        meta: &std::fs::Metadata,
    ) -> usize {
        let config = self.core.config();
        let from = LocalFileRef {
            path: path.to_path_buf(),
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            size: meta.len(),
            mtime: epoch_secs(meta),
        };
        let opts = UploadOptions {
            region: region.to_string(),
            from,
            to: ObjectRef::new(bucket, key),
            overwrite: config.overwrite,
            storage_class: config.storage_class,
            backend_mode: config.backend_mode,
            multipart_size: resolve_part_size(meta.len(), config.multipart_size),
            multipart_threshold: config.multipart_threshold,
            speed_limit: config.speed_limit,
            resumable: config.resumable,
            max_retries: config.max_retries,
        };
        let job = Arc::new(UploadJob::new(
            None,
            Arc::clone(&self.client),
            opts,
            self.core.event_sender(),
        ));
        if !self.core.add_job(job) {
            return 0;
        }
        // Admit per file so transfers start while the walk is still
        // going.
        self.core.schedule_jobs();
        1
    }

    /// Rebuilds persisted upload jobs into the table without starting
    /// them. Snapshots whose source file vanished are dropped;
    /// snapshots whose file changed size or mtime lose their recorded
    /// progress and multipart session. Returns the number of jobs
    /// restored.
    pub fn load_jobs_from_storage(&self) -> Result<usize, TransferError> {
        let config = self.core.config();
        let mut restored = 0;
        for (id, snapshot) in self.core.store().iterate()? {
            if self.core.contains_job(&id) {
                continue;
            }
            let info = match PersistInfo::from_value(&snapshot) {
                Ok(PersistInfo::Upload(info)) => info,
                Ok(PersistInfo::Download(_)) => {
                    warn!(%id, "download snapshot in upload store, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "unreadable job snapshot, skipping");
                    continue;
                }
            };
            let Some(info) = reconcile_with_disk(info) else {
                debug!(%id, "source file gone, dropping snapshot");
                continue;
            };
            let job = Arc::new(UploadJob::from_persist_info(
                id,
                info,
                Arc::clone(&self.client),
                self.core.event_sender(),
                config.speed_limit,
                config.max_retries,
            ));
            if self.core.add_job(job) {
                restored += 1;
            }
        }
        info!(restored, "restored upload jobs from storage");
        Ok(restored)
    }
}

/// Integrity check for a restored snapshot: the source file must still
/// exist, and if its size or mtime moved since the snapshot was
/// taken, recorded progress and the multipart session are void.
fn reconcile_with_disk(mut info: UploadPersistInfo) -> Option<UploadPersistInfo> {
    let meta = std::fs::metadata(&info.from.path).ok()?;
    let mtime = epoch_secs(&meta);
    if meta.len() != info.from.size || mtime != info.from.mtime {
        debug!(
            path = %info.from.path.display(),
            "source file changed since snapshot, restarting from zero"
        );
        info.progress.loaded = 0;
        info.progress.total = meta.len();
        info.from.size = meta.len();
        info.from.mtime = mtime;
        info.uploaded_id.clear();
        info.uploaded_parts.clear();
    }
    Some(info)
}

fn epoch_secs(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Grows the configured part size just enough to keep the part count
/// within the backend's per-upload limit, rounded up to whole
/// granularity units.
pub fn resolve_part_size(file_size: u64, configured: u64) -> u64 {
    let configured = configured.max(1);
    if file_size.div_ceil(configured) <= MAX_MULTIPART_PARTS {
        return configured;
    }
    let needed = file_size.div_ceil(MAX_MULTIPART_PARTS);
    needed.div_ceil(MIN_PART_GRANULARITY) * MIN_PART_GRANULARITY
}
