//! Download-side manager: remote tree walking and recovery of
//! persisted download jobs.
//!
//! Remote listings are continuation-token driven and recurse through
//! common prefixes; the per-object visitor can halt the walk early,
//! which aborts all remaining pages and subtrees.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use duffel_storage::{BoxFuture, JobStore, ObjectClient, RemoteObject};

use crate::download::{DownloadJob, DownloadOptions};
use crate::manager::{ManagerCore, ManagerHooks, TransferConfig};
use crate::persist::{LocalDestination, PersistInfo};
use crate::TransferError;

/// Verdict of the per-object walk visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkControl {
    Continue,
    /// Abandon the walk: remaining pages and subtrees are skipped.
    Halt,
}

const WALK_PAGE_SIZE: u32 = 1000;

pub struct DownloadManager {
    core: Arc<ManagerCore>,
    client: Arc<dyn ObjectClient>,
}

impl std::ops::Deref for DownloadManager {
    type Target = ManagerCore;

    fn deref(&self) -> &ManagerCore {
        &self.core
    }
}

impl DownloadManager {
    pub fn new(
        client: Arc<dyn ObjectClient>,
        store: Arc<dyn JobStore>,
        config: TransferConfig,
        hooks: ManagerHooks,
    ) -> Self {
        Self {
            core: ManagerCore::new(store, config, hooks),
            client,
        }
    }

    /// Queues download jobs for the selected remote entries into
    /// `local_root`. A selection whose key ends in `/` is a directory:
    /// its subtree is walked and mirrored locally. Jobs go through an
    /// admission pass as they are discovered, so transfers start while
    /// the listing is still paging. Returns the number of jobs added.
    pub async fn add_jobs_from_remote(
        &self,
        region: &str,
        selections: &[RemoteObject],
        local_root: &Path,
    ) -> Result<usize, TransferError> {
        let mut added = 0;
        for selection in selections {
            if selection.is_dir() {
                added += self
                    .download_tree(region, selection, local_root)
                    .await?;
            } else {
                let local = local_root.join(selection.name());
                added += self.add_file_job(region, selection.clone(), local);
            }
        }
        info!(added, local_root = %local_root.display(), "queued download jobs");
        Ok(added)
    }

    async fn download_tree(
        &self,
        region: &str,
        dir: &RemoteObject,
        local_root: &Path,
    ) -> Result<usize, TransferError> {
        // "photos/raw/" mirrors into <local_root>/raw/... when the
        // selection is "photos/raw/".
        let base = dir.key.clone();
        let root = local_root.join(dir.name());
        tokio::fs::create_dir_all(&root).await?;

        let mut added = 0;
        let mut fs_error: Option<std::io::Error> = None;
        self.walk_remote(region, &dir.bucket, &base, &mut |object| {
            let rel = object.key.strip_prefix(&base).unwrap_or(object.name());
            let local = root.join(rel);
            let target = if object.is_dir() {
                local.as_path()
            } else {
                local.parent().unwrap_or(&root)
            };
            if let Err(e) = std::fs::create_dir_all(target) {
                fs_error = Some(e);
                return WalkControl::Halt;
            }
            if !object.is_dir() {
                added += self.add_file_job(region, object.clone(), local);
            }
            WalkControl::Continue
        })
        .await?;
        if let Some(e) = fs_error {
            return Err(e.into());
        }
        Ok(added)
    }

    /// Walks every object under `prefix`, page by page, recursing into
    /// common prefixes depth-first. Returns `Ok(false)` when the
    /// visitor halted the walk early.
    pub fn walk_remote<'a>(
        &'a self,
        region: &'a str,
        bucket: &'a str,
        prefix: &'a str,
        visit: &'a mut (dyn FnMut(&RemoteObject) -> WalkControl + Send),
    ) -> BoxFuture<'a, Result<bool, TransferError>> {
        Box::pin(async move {
            let mut token = None;
            loop {
                let page = self
                    .client
                    .list_page(region, bucket, prefix, token.take(), WALK_PAGE_SIZE)
                    .await?;
                for object in &page.objects {
                    if visit(object) == WalkControl::Halt {
                        return Ok(false);
                    }
                }
                for sub_prefix in &page.common_prefixes {
                    if !self
                        .walk_remote(region, bucket, sub_prefix, &mut *visit)
                        .await?
                    {
                        return Ok(false);
                    }
                }
                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
            Ok(true)
        })
    }

    fn add_file_job(&self, region: &str, from: RemoteObject, local: PathBuf) -> usize {
        let config = self.core.config();
        let opts = DownloadOptions {
            region: region.to_string(),
            to: LocalDestination {
                name: from.name().to_string(),
                path: local,
            },
            from,
            overwrite: config.overwrite,
            backend_mode: config.backend_mode,
            multipart_size: config.multipart_size,
            speed_limit: config.speed_limit,
            resumable: config.resumable,
            max_retries: config.max_retries,
        };
        let job = Arc::new(DownloadJob::new(
            None,
            Arc::clone(&self.client),
            opts,
            self.core.event_sender(),
        ));
        if !self.core.add_job(job) {
            return 0;
        }
        // Admit as soon as the job exists so transfers start while a
        // listing is still paging.
        self.core.schedule_jobs();
        1
    }

    /// Rebuilds persisted download jobs into the table without
    /// starting them. Returns the number of jobs restored.
    pub fn load_jobs_from_storage(&self) -> Result<usize, TransferError> {
        let config = self.core.config();
        let mut restored = 0;
        for (id, snapshot) in self.core.store().iterate()? {
            if self.core.contains_job(&id) {
                continue;
            }
            let info = match PersistInfo::from_value(&snapshot) {
                Ok(PersistInfo::Download(info)) => info,
                Ok(PersistInfo::Upload(_)) => {
                    warn!(%id, "upload snapshot in download store, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(%id, error = %e, "unreadable job snapshot, skipping");
                    continue;
                }
            };
            let job = Arc::new(DownloadJob::from_persist_info(
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
        info!(restored, "restored download jobs from storage");
        Ok(restored)
    }
}
