//! Download jobs.
//!
//! A [`DownloadJob`] moves one remote object into a local file. Bytes
//! land in a `.download` staging file first and are renamed into place
//! only after the size check passes, so an interrupted transfer never
//! leaves a truncated file under the final name. The staging path is
//! chosen once per job and persisted, which is what makes byte-range
//! resumption across restarts possible.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use duffel_storage::{
    BackendMode, BoxFuture, GetParams, ObjectClient, ProgressFn, RemoteObject, StorageError,
};

use crate::job::{EventSender, JobCore, Progress, TransferJob, UiData};
use crate::persist::{DownloadPersistInfo, LocalDestination, PersistInfo, restored_status};
use crate::status::Status;
use crate::TransferError;

const TEMP_SUFFIX: &str = ".download";

/// Static parameters of one download, fixed at creation.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub region: String,
    pub from: RemoteObject,
    pub to: LocalDestination,
    /// Clobber an existing local file instead of picking a numbered
    /// sibling name.
    pub overwrite: bool,
    pub backend_mode: BackendMode,
    pub multipart_size: u64,
    pub speed_limit: Option<u64>,
    /// When false, every attempt restarts from byte zero and staged
    /// bytes are never reused across runs.
    pub resumable: bool,
    pub max_retries: u32,
}

pub struct DownloadJob {
    core: Arc<JobCore>,
    client: Arc<dyn ObjectClient>,
    opts: DownloadOptions,
    /// Staging path, chosen on the first run and kept for resumption.
    /// Empty until then.
    temp_path: RwLock<PathBuf>,
}

impl DownloadJob {
    pub fn new(
        id: Option<String>,
        client: Arc<dyn ObjectClient>,
        opts: DownloadOptions,
        events: EventSender,
    ) -> Self {
        let progress = Progress {
            loaded: 0,
            total: opts.from.size,
            resumable: opts.resumable,
        };
        Self {
            core: Arc::new(JobCore::new(
                id,
                progress,
                opts.speed_limit,
                opts.max_retries,
                events,
            )),
            client,
            opts,
            temp_path: RwLock::new(PathBuf::new()),
        }
    }

    /// Rebuilds a job from a persisted snapshot. If the staging file
    /// vanished since the snapshot was taken, recorded progress is
    /// discarded and the job starts over.
    pub fn from_persist_info(
        id: String,
        info: DownloadPersistInfo,
        client: Arc<dyn ObjectClient>,
        events: EventSender,
        speed_limit: Option<u64>,
        max_retries: u32,
    ) -> Self {
        let opts = DownloadOptions {
            region: info.region,
            from: info.from,
            to: info.to,
            overwrite: info.overwrite,
            backend_mode: info.backend_mode,
            multipart_size: info.multipart_size,
            speed_limit,
            resumable: info.progress.resumable,
            max_retries,
        };
        let job = Self::new(Some(id), client, opts, events);
        let mut progress = info.progress;
        if progress.loaded > 0 && !info.temp_file_path.exists() {
            debug!(
                id = %job.core.id(),
                temp = %info.temp_file_path.display(),
                "staging file missing, restarting download from zero"
            );
            progress.loaded = 0;
        } else {
            *job.temp_path.write().unwrap() = info.temp_file_path;
        }
        job.core.restore_progress(progress);
        job.core.restore_status(restored_status(info.status));
        job.core.restore_message(info.message);
        job
    }

    async fn transfer(&self) -> Result<(), TransferError> {
        if let Some(parent) = self.opts.to.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.staging_path();
        let token = self.core.token();
        loop {
            let resume_offset = if self.opts.resumable {
                self.core.progress().loaded
            } else {
                0
            };
            match self.get_once(&temp, resume_offset).await {
                Ok(()) => break,
                Err(e) if e.is_cancelled() => return Err(e.into()),
                Err(e) => {
                    let Some(delay) = self.core.backoff() else {
                        return Err(e.into());
                    };
                    warn!(
                        id = %self.core.id(),
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        attempt = self.core.retried(),
                        "download attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(StorageError::Cancelled.into()),
                    }
                }
            }
        }

        self.core.transition(Status::Verifying);
        self.finalize(&temp).await
    }

    async fn get_once(&self, temp: &Path, resume_offset: u64) -> Result<(), StorageError> {
        let progress_core = Arc::clone(&self.core);
        let on_progress: ProgressFn = Arc::new(move |loaded, _total| {
            progress_core.set_loaded(loaded);
        });
        let params = GetParams {
            resume_offset,
            part_size: self.opts.multipart_size,
            speed_limit: self.opts.speed_limit,
            cancel: self.core.token(),
            on_progress,
        };
        self.client
            .get_file(&self.opts.region, &self.opts.from, temp, params)
            .await
    }

    /// Size check on the staging file, then rename into place.
    async fn finalize(&self, temp: &Path) -> Result<(), TransferError> {
        let meta = tokio::fs::metadata(temp).await?;
        if meta.len() != self.opts.from.size {
            return Err(TransferError::Verify(format!(
                "staged size {} does not match remote size {}",
                meta.len(),
                self.opts.from.size
            )));
        }
        tokio::fs::rename(temp, final_path(temp)).await?;
        Ok(())
    }

    /// Staging path for this run. Reuses the persisted one when it is
    /// still resumable, otherwise picks a fresh one and resets the
    /// byte counter.
    fn staging_path(&self) -> PathBuf {
        let progress = self.core.progress();
        {
            let temp = self.temp_path.read().unwrap();
            if self.opts.resumable
                && progress.loaded > 0
                && !temp.as_os_str().is_empty()
                && temp.exists()
            {
                return temp.clone();
            }
        }
        let temp = temp_file_path(&self.opts.to.path, self.opts.overwrite);
        *self.temp_path.write().unwrap() = temp.clone();
        self.core.restore_progress(Progress {
            loaded: 0,
            total: progress.total,
            resumable: progress.resumable,
        });
        temp
    }
}

impl TransferJob for DownloadJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn run<'a>(&'a self, _forced: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.transfer().await {
                Ok(()) => {
                    self.core.transition(Status::Finished);
                    self.core.done();
                }
                Err(e) if e.is_cancelled() => {
                    // stop()/wait() already parked the job; its status
                    // stands and no Done fires for this run.
                    debug!(id = %self.core.id(), "download cancelled");
                }
                Err(e) => {
                    self.core.fail(e.to_string());
                    self.core.done();
                }
            }
        })
    }

    fn ui_data(&self) -> UiData {
        self.core.ui_snapshot(
            self.opts.from.to_string(),
            self.opts.to.path.display().to_string(),
        )
    }

    fn persist_info(&self) -> PersistInfo {
        PersistInfo::Download(DownloadPersistInfo {
            from: self.opts.from.clone(),
            to: self.opts.to.clone(),
            region: self.opts.region.clone(),
            backend_mode: self.opts.backend_mode,
            overwrite: self.opts.overwrite,
            temp_file_path: self.temp_path.read().unwrap().clone(),
            progress: self.core.progress(),
            status: self.core.status(),
            message: self.core.message(),
            multipart_size: self.opts.multipart_size,
        })
    }

    /// Removes the staging file of a partial download. Finished jobs
    /// have already renamed it away; Waiting jobs keep theirs so a
    /// resumable session survives.
    fn cleanup(&self) {
        if matches!(self.core.status(), Status::Finished | Status::Waiting) {
            return;
        }
        let temp = self.temp_path.read().unwrap().clone();
        if !temp.as_os_str().is_empty() {
            let _ = std::fs::remove_file(&temp);
        }
    }
}

/// Picks the staging path for a download destined for `path`.
///
/// With `overwrite` the staging path is always `path` plus the
/// `.download` suffix. Without it, the first candidate whose final
/// name AND staging name are both free wins; collisions get a numeric
/// infix before the extension (`b.txt` becomes `b.1.txt`, `b.2.txt`,
/// ...), so concurrent downloads of same-named objects land in
/// distinct files.
pub fn temp_file_path(path: &Path, overwrite: bool) -> PathBuf {
    if overwrite {
        return append_suffix(path);
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let (stem, ext) = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (file_name.clone(), None),
    };
    let mut counter = 0u32;
    loop {
        let candidate = if counter == 0 {
            path.to_path_buf()
        } else {
            let name = match &ext {
                Some(ext) => format!("{stem}.{counter}.{ext}"),
                None => format!("{stem}.{counter}"),
            };
            parent.join(name)
        };
        let temp = append_suffix(&candidate);
        if !candidate.exists() && !temp.exists() {
            return temp;
        }
        counter += 1;
    }
}

/// Final destination for a staging path (the path minus the suffix).
pub fn final_path(temp: &Path) -> PathBuf {
    let s = temp.to_string_lossy();
    match s.strip_suffix(TEMP_SUFFIX) {
        Some(stripped) => PathBuf::from(stripped),
        None => temp.to_path_buf(),
    }
}

fn append_suffix(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(TEMP_SUFFIX);
    PathBuf::from(os)
}
