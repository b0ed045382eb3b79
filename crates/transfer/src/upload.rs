//! Upload jobs.
//!
//! An [`UploadJob`] moves one local file to one remote object. The job
//! owns the retry loop and the duplicate short-circuit; the actual
//! bytes-on-the-wire work is delegated to the [`ObjectClient`]
//! adapter, which reports back through the progress/part/session
//! hooks. Multipart session state is mirrored here so a crash can
//! resume from the last completed part.

use std::io::Read;
use std::path::Path;
use std::sync::{Arc, RwLock};

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use duffel_storage::{
    BackendMode, BoxFuture, ObjectClient, ObjectRef, PartFn, ProgressFn, PutParams,
    RecoveredSession, SessionFn, StorageClass, StorageError, UploadedPart,
};

use crate::job::{EventSender, JobCore, Progress, TransferJob, UiData};
use crate::persist::{LocalFileRef, PersistInfo, UploadPersistInfo, restored_status};
use crate::status::Status;
use crate::TransferError;

/// Static parameters of one upload, fixed at creation.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    pub region: String,
    pub from: LocalFileRef,
    pub to: ObjectRef,
    /// Skip the pre-flight existence probe and clobber the remote key.
    pub overwrite: bool,
    pub storage_class: StorageClass,
    pub backend_mode: BackendMode,
    pub multipart_size: u64,
    pub multipart_threshold: u64,
    pub speed_limit: Option<u64>,
    /// Whether a partial multipart session survives stop/restart.
    pub resumable: bool,
    pub max_retries: u32,
}

#[derive(Debug, Default, Clone)]
struct MultipartState {
    uploaded_id: String,
    parts: Vec<UploadedPart>,
}

enum UploadOutcome {
    Completed,
    Duplicated,
}

pub struct UploadJob {
    core: Arc<JobCore>,
    client: Arc<dyn ObjectClient>,
    opts: UploadOptions,
    session: Arc<RwLock<MultipartState>>,
}

impl UploadJob {
    pub fn new(
        id: Option<String>,
        client: Arc<dyn ObjectClient>,
        opts: UploadOptions,
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
            session: Arc::new(RwLock::new(MultipartState::default())),
        }
    }

    /// Rebuilds a job from a persisted snapshot. Running/Verifying
    /// come back as Waiting; an in-flight call cannot be resurrected.
    pub fn from_persist_info(
        id: String,
        info: UploadPersistInfo,
        client: Arc<dyn ObjectClient>,
        events: EventSender,
        speed_limit: Option<u64>,
        max_retries: u32,
    ) -> Self {
        let opts = UploadOptions {
            region: info.region,
            from: info.from,
            to: info.to,
            overwrite: info.overwrite,
            storage_class: info.storage_class,
            backend_mode: info.backend_mode,
            multipart_size: info.multipart_size,
            multipart_threshold: info.multipart_threshold,
            speed_limit,
            resumable: info.progress.resumable,
            max_retries,
        };
        let job = Self::new(Some(id), client, opts, events);
        job.core.restore_progress(info.progress);
        job.core.restore_status(restored_status(info.status));
        job.core.restore_message(info.message);
        *job.session.write().unwrap() = MultipartState {
            uploaded_id: info.uploaded_id,
            parts: info.uploaded_parts,
        };
        job
    }

    async fn transfer(&self, forced: bool) -> Result<UploadOutcome, TransferError> {
        if !forced && !self.opts.overwrite {
            let exists = self
                .client
                .is_exists(&self.opts.region, &self.opts.to)
                .await?;
            if exists {
                debug!(id = %self.core.id(), object = %self.opts.to, "remote object exists, skipping");
                return Ok(UploadOutcome::Duplicated);
            }
        }

        let checksum = self.file_checksum().await?;
        let token = self.core.token();
        loop {
            match self.put_once(&checksum).await {
                Ok(()) => return Ok(UploadOutcome::Completed),
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
                        "upload attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => return Err(StorageError::Cancelled.into()),
                    }
                }
            }
        }
    }

    async fn put_once(&self, checksum: &str) -> Result<(), StorageError> {
        let recovered = {
            let session = self.session.read().unwrap();
            if self.opts.resumable && !session.uploaded_id.is_empty() {
                Some(RecoveredSession {
                    upload_id: session.uploaded_id.clone(),
                    parts: session.parts.clone(),
                })
            } else {
                None
            }
        };

        let progress_core = Arc::clone(&self.core);
        let on_progress: ProgressFn = Arc::new(move |loaded, _total| {
            progress_core.set_loaded(loaded);
        });
        let part_core = Arc::clone(&self.core);
        let part_session = Arc::clone(&self.session);
        let on_part: PartFn = Arc::new(move |part| {
            part_session.write().unwrap().parts.push(part);
            part_core.part_completed();
        });
        let session_core = Arc::clone(&self.core);
        let session_state = Arc::clone(&self.session);
        let on_session: SessionFn = Arc::new(move |upload_id| {
            session_state.write().unwrap().uploaded_id = upload_id;
            // Persist the fresh session id right away so a crash can
            // resume into it.
            session_core.part_completed();
        });

        let params = PutParams {
            part_size: self.opts.multipart_size,
            multipart_threshold: self.opts.multipart_threshold,
            speed_limit: self.opts.speed_limit,
            storage_class: self.opts.storage_class,
            checksum: checksum.to_string(),
            recovered,
            cancel: self.core.token(),
            on_progress,
            on_part,
            on_session,
        };
        self.client
            .put_file(&self.opts.region, &self.opts.to, &self.opts.from.path, params)
            .await
    }

    /// Post-upload verification: the remote object must exist and
    /// match the local size.
    async fn verify(&self) -> Result<(), TransferError> {
        let head = self
            .client
            .head_object(&self.opts.region, &self.opts.to)
            .await?;
        match head {
            Some(head) if head.size == self.opts.from.size => Ok(()),
            Some(head) => Err(TransferError::Verify(format!(
                "remote size {} does not match local size {}",
                head.size, self.opts.from.size
            ))),
            None => Err(TransferError::Verify(
                "object missing after upload".to_string(),
            )),
        }
    }

    /// Whole-file SHA-256, computed off the async runtime.
    async fn file_checksum(&self) -> Result<String, TransferError> {
        let path = self.opts.from.path.clone();
        tokio::task::spawn_blocking(move || file_checksum_sync(&path))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }

    fn persist_snapshot(&self) -> UploadPersistInfo {
        let session = self.session.read().unwrap().clone();
        UploadPersistInfo {
            from: self.opts.from.clone(),
            to: self.opts.to.clone(),
            region: self.opts.region.clone(),
            storage_class: self.opts.storage_class,
            backend_mode: self.opts.backend_mode,
            overwrite: self.opts.overwrite,
            progress: self.core.progress(),
            status: self.core.status(),
            message: self.core.message(),
            multipart_threshold: self.opts.multipart_threshold,
            multipart_size: self.opts.multipart_size,
            uploaded_id: session.uploaded_id,
            uploaded_parts: session.parts,
        }
    }
}

fn file_checksum_sync(path: &Path) -> Result<String, TransferError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

impl TransferJob for UploadJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn run<'a>(&'a self, forced: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            match self.transfer(forced).await {
                Ok(UploadOutcome::Completed) => {
                    self.core.transition(Status::Verifying);
                    match self.verify().await {
                        Ok(()) => {
                            self.core.transition(Status::Finished);
                        }
                        Err(e) if e.is_cancelled() => return,
                        Err(e) => self.core.fail(e.to_string()),
                    }
                    self.core.done();
                }
                Ok(UploadOutcome::Duplicated) => {
                    self.core.transition(Status::Duplicated);
                    self.core.done();
                }
                Err(e) if e.is_cancelled() => {
                    // stop()/wait() already parked the job; its status
                    // stands and no Done fires for this run.
                    debug!(id = %self.core.id(), "upload cancelled");
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
            self.opts.from.path.display().to_string(),
            self.opts.to.to_string(),
        )
    }

    fn persist_info(&self) -> PersistInfo {
        PersistInfo::Upload(self.persist_snapshot())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

    use tokio::sync::mpsc;

    use duffel_storage::{GetParams, ObjectHead, ObjectPage, RemoteObject};

    use super::*;
    use crate::job::{EventReceiver, JobEvent};

    #[derive(Default)]
    struct MockClient {
        exists: AtomicBool,
        remote_size: AtomicU64,
        puts: AtomicUsize,
        /// Number of initial put attempts that fail with a 500.
        fail_first: AtomicUsize,
        /// When set, put_file parks until the token fires.
        block_until_cancelled: AtomicBool,
    }

    impl ObjectClient for MockClient {
        fn head_object<'a>(
            &'a self,
            _region: &'a str,
            _object: &'a ObjectRef,
        ) -> BoxFuture<'a, Result<Option<ObjectHead>, StorageError>> {
            Box::pin(async move {
                if self.exists.load(Ordering::SeqCst) {
                    Ok(Some(ObjectHead {
                        size: self.remote_size.load(Ordering::SeqCst),
                        mtime: chrono::Utc::now(),
                    }))
                } else {
                    Ok(None)
                }
            })
        }

        fn create_dir_marker<'a>(
            &'a self,
            _region: &'a str,
            _object: &'a ObjectRef,
        ) -> BoxFuture<'a, Result<(), StorageError>> {
            Box::pin(async move { Ok(()) })
        }

        fn put_file<'a>(
            &'a self,
            _region: &'a str,
            _object: &'a ObjectRef,
            local: &'a Path,
            params: PutParams,
        ) -> BoxFuture<'a, Result<(), StorageError>> {
            Box::pin(async move {
                self.puts.fetch_add(1, Ordering::SeqCst);
                if self.block_until_cancelled.load(Ordering::SeqCst) {
                    params.cancel.cancelled().await;
                    return Err(StorageError::Cancelled);
                }
                if self
                    .fail_first
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(StorageError::Api {
                        code: 500,
                        message: "transient".into(),
                    });
                }
                let len = std::fs::metadata(local)?.len();
                (params.on_session)("sess-mock".into());
                (params.on_part)(UploadedPart {
                    part_number: 1,
                    etag: "e1".into(),
                });
                (params.on_progress)(len, len);
                self.remote_size.store(len, Ordering::SeqCst);
                self.exists.store(true, Ordering::SeqCst);
                Ok(())
            })
        }

        fn get_file<'a>(
            &'a self,
            _region: &'a str,
            _object: &'a RemoteObject,
            _local: &'a Path,
            _params: GetParams,
        ) -> BoxFuture<'a, Result<(), StorageError>> {
            Box::pin(async move { unimplemented!("upload tests never download") })
        }

        fn list_page<'a>(
            &'a self,
            _region: &'a str,
            _bucket: &'a str,
            _prefix: &'a str,
            _token: Option<String>,
            _page_size: u32,
        ) -> BoxFuture<'a, Result<ObjectPage, StorageError>> {
            Box::pin(async move { unimplemented!("upload tests never list") })
        }
    }

    fn write_temp_file(content: &[u8]) -> (tempfile::TempDir, LocalFileRef) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.bin");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let from = LocalFileRef {
            path,
            name: "report.bin".into(),
            size: meta.len(),
            mtime: 1_700_000_000,
        };
        (dir, from)
    }

    fn options(from: LocalFileRef, max_retries: u32) -> UploadOptions {
        UploadOptions {
            region: "z0".into(),
            from,
            to: ObjectRef::new("bucket", "backups/report.bin"),
            overwrite: false,
            storage_class: StorageClass::Standard,
            backend_mode: BackendMode::S3,
            multipart_size: 8 << 20,
            multipart_threshold: 100 << 20,
            speed_limit: None,
            resumable: true,
            max_retries,
        }
    }

    fn job_with(
        client: Arc<MockClient>,
        max_retries: u32,
    ) -> (Arc<UploadJob>, EventReceiver, tempfile::TempDir) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (dir, from) = write_temp_file(b"0123456789");
        let job = Arc::new(UploadJob::new(None, client, options(from, max_retries), tx));
        (job, rx, dir)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn upload_completes_and_verifies() {
        let client = Arc::new(MockClient::default());
        let (job, mut rx, _dir) = job_with(Arc::clone(&client), 0);

        job.start(false).await;

        assert_eq!(job.status(), Status::Finished);
        let progress = job.core().progress();
        assert_eq!(progress.loaded, 10);
        assert_eq!(progress.total, 10);
        assert_eq!(client.puts.load(Ordering::SeqCst), 1);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Done { status: Status::Finished, .. }
        )));
        assert!(
            events
                .iter()
                .any(|e| matches!(e, JobEvent::PartCompleted { .. }))
        );
    }

    #[tokio::test]
    async fn existing_object_short_circuits_to_duplicated() {
        let client = Arc::new(MockClient::default());
        client.exists.store(true, Ordering::SeqCst);
        let (job, mut rx, _dir) = job_with(Arc::clone(&client), 0);

        job.start(false).await;

        assert_eq!(job.status(), Status::Duplicated);
        assert!(job.core().message().is_empty());
        assert_eq!(client.puts.load(Ordering::SeqCst), 0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Done { status: Status::Duplicated, .. }
        )));
    }

    #[tokio::test]
    async fn forced_start_bypasses_existence_probe() {
        let client = Arc::new(MockClient::default());
        client.exists.store(true, Ordering::SeqCst);
        let (job, _rx, _dir) = job_with(Arc::clone(&client), 0);

        job.start(true).await;

        assert_eq!(job.status(), Status::Finished);
        assert_eq!(client.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let client = Arc::new(MockClient::default());
        client.fail_first.store(2, Ordering::SeqCst);
        let (job, _rx, _dir) = job_with(Arc::clone(&client), 3);

        job.start(false).await;

        assert_eq!(job.status(), Status::Finished);
        assert_eq!(client.puts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_message() {
        let client = Arc::new(MockClient::default());
        client.fail_first.store(10, Ordering::SeqCst);
        let (job, mut rx, _dir) = job_with(Arc::clone(&client), 1);

        job.start(false).await;

        assert_eq!(job.status(), Status::Failed);
        assert!(job.core().message().contains("transient"));
        assert_eq!(client.puts.load(Ordering::SeqCst), 2);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            JobEvent::Done { status: Status::Failed, .. }
        )));
    }

    #[tokio::test]
    async fn stop_cancels_inflight_put_without_failing() {
        let client = Arc::new(MockClient::default());
        client.block_until_cancelled.store(true, Ordering::SeqCst);
        let (job, mut rx, _dir) = job_with(Arc::clone(&client), 0);

        let runner = tokio::spawn({
            let job = Arc::clone(&job);
            async move { job.start(false).await }
        });
        // Let the put park on the token before stopping.
        while client.puts.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        job.stop();
        runner.await.unwrap();

        assert_eq!(job.status(), Status::Stopped);
        assert!(job.core().message().is_empty());
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(e, JobEvent::Done { .. })));
    }

    #[tokio::test]
    async fn persisted_snapshot_restores_session_and_status() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_dir, from) = write_temp_file(b"abcdef");
        let client: Arc<dyn ObjectClient> = Arc::new(MockClient::default());
        let job = UploadJob::new(None, Arc::clone(&client), options(from, 2), tx.clone());
        job.session.write().unwrap().uploaded_id = "sess-9".into();
        job.session.write().unwrap().parts.push(UploadedPart {
            part_number: 1,
            etag: "e1".into(),
        });
        job.core.restore_progress(Progress {
            loaded: 3,
            total: 6,
            resumable: true,
        });
        job.core.restore_status(Status::Running);

        let PersistInfo::Upload(info) = job.persist_info() else {
            panic!("upload job must persist an upload snapshot");
        };
        let restored =
            UploadJob::from_persist_info(job.id().to_string(), info, client, tx, None, 2);

        assert_eq!(restored.id(), job.id());
        assert_eq!(restored.status(), Status::Waiting);
        assert_eq!(restored.core().progress().loaded, 3);
        let session = restored.session.read().unwrap();
        assert_eq!(session.uploaded_id, "sess-9");
        assert_eq!(session.parts.len(), 1);
    }
}
