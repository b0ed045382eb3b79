//! Job table and scheduler shared by the upload and download managers.
//!
//! The [`ManagerCore`] owns every job exclusively and is the only
//! external lifecycle mutator. Scheduling is greedy and
//! order-preserving: whenever a slot frees up, the earliest Waiting
//! job in insertion order is admitted, up to the configured
//! concurrency ceiling. Jobs report back over an event channel; a
//! single event loop task per manager drives persistence and
//! rescheduling off those events.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use duffel_storage::{BackendMode, JobStore, StorageClass};

use crate::job::{EventReceiver, EventSender, JobEvent, TransferJob, UiData};
use crate::status::Status;
use crate::TransferError;
use crate::{DEFAULT_MULTIPART_SIZE, DEFAULT_MULTIPART_THRESHOLD};

/// Manager-wide transfer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    /// Scheduler admission ceiling.
    pub max_concurrency: u32,
    pub multipart_size: u64,
    pub multipart_threshold: u64,
    /// Per-job throttle in bytes/sec, `None` for unlimited.
    pub speed_limit: Option<u64>,
    pub max_retries: u32,
    /// Default overwrite policy applied to newly added jobs.
    pub overwrite: bool,
    /// Whether new upload jobs keep resumable multipart sessions.
    pub resumable: bool,
    pub storage_class: StorageClass,
    pub backend_mode: BackendMode,
    /// Verbose per-event logging.
    pub is_debug: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            multipart_size: DEFAULT_MULTIPART_SIZE,
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            speed_limit: None,
            max_retries: 3,
            overwrite: false,
            resumable: true,
            storage_class: StorageClass::Standard,
            backend_mode: BackendMode::S3,
            is_debug: false,
        }
    }
}

/// Partial config update applied to a live manager. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigUpdate {
    pub max_concurrency: Option<u32>,
    /// `Some(None)` lifts an existing throttle.
    pub speed_limit: Option<Option<u64>>,
    pub is_debug: Option<bool>,
}

/// Observer hooks a host application can install on a manager.
#[derive(Clone, Default)]
pub struct ManagerHooks {
    pub on_error: Option<Arc<dyn Fn(&TransferError) + Send + Sync>>,
    /// Fires once per terminal run outcome (Finished, Failed,
    /// Duplicated), after the slot was released.
    pub on_job_done: Option<Arc<dyn Fn(&str, Status) + Send + Sync>>,
}

/// Per-status job tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub total: usize,
    pub waiting: usize,
    pub running: usize,
    pub stopped: usize,
    pub finished: usize,
    pub failed: usize,
    pub duplicated: usize,
}

impl JobCounters {
    fn tally(&mut self, status: Status) {
        self.total += 1;
        match status {
            Status::Waiting => self.waiting += 1,
            Status::Running | Status::Verifying => self.running += 1,
            Status::Stopped => self.stopped += 1,
            Status::Finished => self.finished += 1,
            Status::Failed => self.failed += 1,
            Status::Duplicated => self.duplicated += 1,
        }
    }
}

/// Filter applied when listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobQuery {
    pub status: Option<Status>,
    /// Case-sensitive substring match against either endpoint label.
    pub name: Option<String>,
}

impl JobQuery {
    fn matches(&self, data: &UiData) -> bool {
        if let Some(status) = self.status {
            let hit = match status {
                // Verifying is presented as part of Running.
                Status::Running => matches!(data.status, Status::Running | Status::Verifying),
                other => data.status == other,
            };
            if !hit {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if !data.from.contains(name.as_str()) && !data.to.contains(name.as_str()) {
                return false;
            }
        }
        true
    }
}

/// One page of job snapshots plus the whole-table tally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPage {
    pub list: Vec<UiData>,
    /// Number of jobs matching the query across all pages.
    pub matched: usize,
    pub counters: JobCounters,
}

struct JobTable {
    jobs: HashMap<String, Arc<dyn TransferJob>>,
    /// Insertion order, drives scheduling priority.
    order: Vec<String>,
    /// Occupied scheduler slots. Tracked separately from job statuses
    /// so direct starts can overshoot the ceiling deliberately.
    running: i64,
}

/// Shared manager engine. Construct via [`ManagerCore::new`], which
/// also spawns the event loop task; the task holds only a weak
/// reference and exits when the manager is dropped.
pub struct ManagerCore {
    table: Mutex<JobTable>,
    config: RwLock<TransferConfig>,
    store: Arc<dyn JobStore>,
    hooks: ManagerHooks,
    events: EventSender,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagerCore {
    pub fn new(
        store: Arc<dyn JobStore>,
        config: TransferConfig,
        hooks: ManagerHooks,
    ) -> Arc<Self> {
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        let core = Arc::new(Self {
            table: Mutex::new(JobTable {
                jobs: HashMap::new(),
                order: Vec::new(),
                running: 0,
            }),
            config: RwLock::new(config),
            store,
            hooks,
            events,
            event_task: Mutex::new(None),
        });
        let task = tokio::spawn(Self::event_loop(Arc::downgrade(&core), rx));
        *core.event_task.lock().unwrap() = Some(task);
        core
    }

    /// Sender handed to every job built for this manager.
    pub fn event_sender(&self) -> EventSender {
        self.events.clone()
    }

    pub fn config(&self) -> TransferConfig {
        self.config.read().unwrap().clone()
    }

    /// Applies a partial update to the live manager: a new speed limit
    /// reaches every existing job immediately, and a raised ceiling
    /// admits more Waiting jobs right away.
    pub fn update_config(&self, update: ConfigUpdate) {
        let mut reschedule = false;
        // Config lock is released before taking the table lock; the
        // scheduler acquires them in table-then-config order.
        {
            let mut config = self.config.write().unwrap();
            if let Some(ceiling) = update.max_concurrency {
                reschedule = ceiling > config.max_concurrency;
                config.max_concurrency = ceiling;
            }
            if let Some(limit) = update.speed_limit {
                config.speed_limit = limit;
            }
            if let Some(is_debug) = update.is_debug {
                config.is_debug = is_debug;
            }
        }
        if let Some(limit) = update.speed_limit {
            let table = self.table.lock().unwrap();
            for job in table.jobs.values() {
                job.core().set_speed_limit(limit);
            }
        }
        if reschedule {
            self.schedule_jobs();
        }
    }

    /// Inserts a job at the back of the scheduling order. Rejects a
    /// duplicate id and returns `false`.
    pub fn add_job(&self, job: Arc<dyn TransferJob>) -> bool {
        let mut table = self.table.lock().unwrap();
        let id = job.id().to_string();
        if table.jobs.contains_key(&id) {
            warn!(%id, "job id already present, skipping add");
            return false;
        }
        table.order.push(id.clone());
        table.jobs.insert(id, job);
        true
    }

    pub fn contains_job(&self, id: &str) -> bool {
        self.table.lock().unwrap().jobs.contains_key(id)
    }

    pub fn job_ids(&self) -> Vec<String> {
        self.table.lock().unwrap().order.clone()
    }

    fn get(&self, id: &str) -> Result<Arc<dyn TransferJob>, TransferError> {
        self.table
            .lock()
            .unwrap()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| TransferError::UnknownJob(id.to_string()))
    }

    /// Greedy admission pass: walks jobs in insertion order and moves
    /// Waiting ones into Running until the ceiling is reached.
    /// Claiming happens synchronously under the table lock, so
    /// concurrent passes never admit the same job twice.
    pub fn schedule_jobs(&self) {
        let admitted = {
            let mut table = self.table.lock().unwrap();
            if table.running < 0 {
                table.running = 0;
            }
            let ceiling = self.config.read().unwrap().max_concurrency as i64;
            let order = table.order.clone();
            let mut admitted = Vec::new();
            for id in order {
                if table.running >= ceiling {
                    break;
                }
                let Some(job) = table.jobs.get(&id).cloned() else {
                    continue;
                };
                if job.status() != Status::Waiting {
                    continue;
                }
                if job.core().try_begin_run().is_none() {
                    continue;
                }
                table.running += 1;
                admitted.push(job);
            }
            admitted
        };
        for job in admitted {
            debug!(id = %job.id(), "admitting job");
            tokio::spawn(async move { job.run(false).await });
        }
    }

    /// Direct start, bypassing the queue. The slot count still goes up
    /// so scheduled jobs make room, which deliberately lets an
    /// explicit user start overshoot the ceiling. A start that is a
    /// no-op (job already Running or Finished) claims no slot.
    pub fn start_job(&self, id: &str, forced: bool) -> Result<(), TransferError> {
        let job = self.get(id)?;
        if job.core().try_begin_run().is_none() {
            return Ok(());
        }
        self.table.lock().unwrap().running += 1;
        tokio::spawn(async move { job.run(forced).await });
        Ok(())
    }

    /// Cancels the job's in-flight work and parks it in Stopped,
    /// releasing its slot for the next Waiting job.
    pub fn stop_job(&self, id: &str) -> Result<(), TransferError> {
        let job = self.get(id)?;
        self.release_if_running(&job);
        job.stop();
        self.schedule_jobs();
        Ok(())
    }

    /// Cancels the job's in-flight work and re-queues it as Waiting.
    pub fn wait_job(&self, id: &str) -> Result<(), TransferError> {
        let job = self.get(id)?;
        self.release_if_running(&job);
        job.wait();
        self.schedule_jobs();
        Ok(())
    }

    /// Stops, cleans up and drops one job, then persists the shrunken
    /// table.
    pub fn remove_job(&self, id: &str) -> Result<(), TransferError> {
        let job = {
            let mut table = self.table.lock().unwrap();
            table.order.retain(|j| j != id);
            table
                .jobs
                .remove(id)
                .ok_or_else(|| TransferError::UnknownJob(id.to_string()))?
        };
        self.release_if_running(&job);
        job.stop();
        job.cleanup();
        if let Err(e) = self.persist_jobs() {
            self.report(e);
        }
        self.schedule_jobs();
        Ok(())
    }

    /// Re-queues every Stopped or Failed job and runs an admission
    /// pass.
    pub fn start_all_jobs(&self) {
        let jobs: Vec<_> = {
            let table = self.table.lock().unwrap();
            table.order.iter().filter_map(|id| table.jobs.get(id).cloned()).collect()
        };
        for job in jobs {
            if matches!(job.status(), Status::Stopped | Status::Failed) {
                job.wait();
            }
        }
        self.schedule_jobs();
    }

    /// Stops every job whose status is in `matching` (Waiting and
    /// Running by default).
    pub fn stop_all_jobs(&self, matching: Option<&[Status]>) {
        let matching = matching.unwrap_or(&[Status::Waiting, Status::Running, Status::Verifying]);
        let jobs: Vec<_> = {
            let table = self.table.lock().unwrap();
            table.order.iter().filter_map(|id| table.jobs.get(id).cloned()).collect()
        };
        for job in jobs {
            if matching.contains(&job.status()) {
                self.release_if_running(&job);
                job.stop();
            }
        }
        if let Err(e) = self.persist_jobs() {
            self.report(e);
        }
    }

    /// Stops and drops every job, then compacts the now-empty store.
    pub fn remove_all_jobs(&self) {
        let jobs: Vec<_> = {
            let mut table = self.table.lock().unwrap();
            table.order.clear();
            table.running = 0;
            table.jobs.drain().map(|(_, job)| job).collect()
        };
        for job in jobs {
            job.stop();
            job.cleanup();
        }
        if let Err(e) = self.persist_jobs() {
            self.report(e);
        }
        if let Err(e) = self.store.compact(true) {
            self.report(e.into());
        }
    }

    /// Drops Finished jobs from the table.
    pub fn cleanup_finished_jobs(&self) {
        {
            let mut table = self.table.lock().unwrap();
            let finished: Vec<String> = table
                .order
                .iter()
                .filter(|id| {
                    table
                        .jobs
                        .get(id.as_str())
                        .is_some_and(|job| job.status() == Status::Finished)
                })
                .cloned()
                .collect();
            for id in &finished {
                table.jobs.remove(id);
            }
            table.order.retain(|id| !finished.contains(id));
        }
        if let Err(e) = self.persist_jobs() {
            self.report(e);
        }
    }

    pub fn counters(&self) -> JobCounters {
        let table = self.table.lock().unwrap();
        let mut counters = JobCounters::default();
        for job in table.jobs.values() {
            counters.tally(job.status());
        }
        counters
    }

    /// Snapshot of one page of jobs, insertion-ordered, after applying
    /// `query`. `page` is zero-based.
    pub fn ui_page(&self, page: usize, per_page: usize, query: &JobQuery) -> JobPage {
        let snapshots: Vec<UiData> = {
            let table = self.table.lock().unwrap();
            table
                .order
                .iter()
                .filter_map(|id| table.jobs.get(id))
                .map(|job| job.ui_data())
                .collect()
        };
        let mut counters = JobCounters::default();
        for data in &snapshots {
            counters.tally(data.status);
        }
        let matched: Vec<UiData> = snapshots.into_iter().filter(|d| query.matches(d)).collect();
        let total = matched.len();
        let start = page.saturating_mul(per_page).min(total);
        let end = start.saturating_add(per_page).min(total);
        JobPage {
            list: matched[start..end].to_vec(),
            matched: total,
            counters,
        }
    }

    /// Rewrites the store with a snapshot of every non-Finished job.
    pub fn persist_jobs(&self) -> Result<(), TransferError> {
        let snapshots: Vec<(String, serde_json::Value)> = {
            let table = self.table.lock().unwrap();
            let mut snapshots = Vec::with_capacity(table.order.len());
            for id in &table.order {
                let Some(job) = table.jobs.get(id) else {
                    continue;
                };
                if job.status() == Status::Finished {
                    continue;
                }
                snapshots.push((id.clone(), job.persist_info().to_value()?));
            }
            snapshots
        };
        self.store.clear()?;
        for (id, snapshot) in snapshots {
            self.store.set(&id, snapshot)?;
        }
        self.store.compact(false)?;
        Ok(())
    }

    pub(crate) fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub(crate) fn report(&self, error: TransferError) {
        warn!(%error, "transfer manager error");
        if let Some(on_error) = &self.hooks.on_error {
            on_error(&error);
        }
    }

    /// Flushes the store and stops the event loop. The manager is
    /// inert afterwards.
    pub fn close(&self) {
        if let Err(e) = self.persist_jobs() {
            self.report(e);
        }
        if let Err(e) = self.store.close() {
            self.report(e.into());
        }
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
    }

    fn release_if_running(&self, job: &Arc<dyn TransferJob>) {
        if matches!(job.status(), Status::Running | Status::Verifying) {
            let mut table = self.table.lock().unwrap();
            table.running -= 1;
            if table.running < 0 {
                table.running = 0;
            }
        }
    }

    fn after_job_done(&self, id: &str, status: Status) {
        {
            let mut table = self.table.lock().unwrap();
            table.running -= 1;
            if table.running < 0 {
                table.running = 0;
            }
        }
        if let Err(e) = self.persist_jobs() {
            self.report(e);
        }
        self.schedule_jobs();
        if let Some(on_job_done) = &self.hooks.on_job_done {
            on_job_done(id, status);
        }
    }

    async fn event_loop(core: Weak<ManagerCore>, mut rx: EventReceiver) {
        while let Some(event) = rx.recv().await {
            let Some(core) = core.upgrade() else {
                break;
            };
            if core.config.read().unwrap().is_debug {
                debug!(?event, "job event");
            }
            match event {
                JobEvent::Done { id, status } => core.after_job_done(&id, status),
                JobEvent::PartCompleted { .. } => {
                    if let Err(e) = core.persist_jobs() {
                        core.report(e);
                    }
                }
                JobEvent::StatusChanged { .. } | JobEvent::Progress { .. } => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::Notify;

    use duffel_storage::{BoxFuture, MemoryJobStore, ObjectRef};

    use super::*;
    use crate::job::{JobCore, Progress};
    use crate::persist::{LocalFileRef, PersistInfo, UploadPersistInfo};

    struct StubJob {
        core: JobCore,
        label: String,
        release: Notify,
        outcome: Status,
    }

    impl StubJob {
        fn new(label: &str, events: EventSender) -> Arc<Self> {
            Arc::new(Self {
                core: JobCore::new(None, Progress::default(), None, 0, events),
                label: label.to_string(),
                release: Notify::new(),
                outcome: Status::Finished,
            })
        }

        fn finish(&self) {
            self.release.notify_one();
        }
    }

    impl TransferJob for StubJob {
        fn core(&self) -> &JobCore {
            &self.core
        }

        fn run<'a>(&'a self, _forced: bool) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                let token = self.core.token();
                tokio::select! {
                    _ = self.release.notified() => {
                        self.core.transition(self.outcome);
                        self.core.done();
                    }
                    _ = token.cancelled() => {}
                }
            })
        }

        fn ui_data(&self) -> UiData {
            self.core
                .ui_snapshot(format!("/src/{}", self.label), format!("dst/{}", self.label))
        }

        fn persist_info(&self) -> PersistInfo {
            PersistInfo::Upload(UploadPersistInfo {
                from: LocalFileRef {
                    path: format!("/src/{}", self.label).into(),
                    name: self.label.clone(),
                    size: 1,
                    mtime: 0,
                },
                to: ObjectRef::new("bucket", &self.label),
                region: "z0".into(),
                storage_class: StorageClass::Standard,
                backend_mode: BackendMode::S3,
                overwrite: false,
                progress: self.core.progress(),
                status: self.core.status(),
                message: self.core.message(),
                multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
                multipart_size: DEFAULT_MULTIPART_SIZE,
                uploaded_id: String::new(),
                uploaded_parts: Vec::new(),
            })
        }
    }

    fn manager(max_concurrency: u32) -> Arc<ManagerCore> {
        let config = TransferConfig {
            max_concurrency,
            ..TransferConfig::default()
        };
        ManagerCore::new(Arc::new(MemoryJobStore::new()), config, ManagerHooks::default())
    }

    async fn wait_until(check: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn scheduler_admits_in_order_up_to_the_ceiling() {
        let mgr = manager(2);
        let jobs: Vec<_> = (0..5)
            .map(|i| StubJob::new(&format!("file-{i}"), mgr.event_sender()))
            .collect();
        for job in &jobs {
            assert!(mgr.add_job(Arc::clone(job) as Arc<dyn TransferJob>));
        }

        mgr.schedule_jobs();

        assert_eq!(jobs[0].status(), Status::Running);
        assert_eq!(jobs[1].status(), Status::Running);
        assert_eq!(jobs[2].status(), Status::Waiting);
        assert_eq!(mgr.counters().running, 2);

        jobs[0].finish();
        wait_until(|| jobs[2].status() == Status::Running).await;
        assert_eq!(jobs[0].status(), Status::Finished);
        assert_eq!(jobs[3].status(), Status::Waiting);

        for job in &jobs[1..] {
            job.finish();
        }
        wait_until(|| mgr.counters().finished == 5).await;
    }

    #[tokio::test]
    async fn noop_start_claims_no_slot() {
        let mgr = manager(1);
        let a = StubJob::new("a", mgr.event_sender());
        let b = StubJob::new("b", mgr.event_sender());
        mgr.add_job(Arc::clone(&a) as Arc<dyn TransferJob>);
        mgr.add_job(Arc::clone(&b) as Arc<dyn TransferJob>);

        mgr.schedule_jobs();
        assert_eq!(a.status(), Status::Running);
        assert_eq!(b.status(), Status::Waiting);

        // Already Running, so this start is a no-op and must not
        // occupy a second slot.
        mgr.start_job(a.id(), false).unwrap();

        a.finish();
        wait_until(|| b.status() == Status::Running).await;
        b.finish();
        wait_until(|| mgr.counters().finished == 2).await;
    }

    #[tokio::test]
    async fn stopping_a_running_job_frees_its_slot() {
        let mgr = manager(1);
        let first = StubJob::new("first", mgr.event_sender());
        let second = StubJob::new("second", mgr.event_sender());
        mgr.add_job(Arc::clone(&first) as Arc<dyn TransferJob>);
        mgr.add_job(Arc::clone(&second) as Arc<dyn TransferJob>);

        mgr.schedule_jobs();
        assert_eq!(first.status(), Status::Running);
        assert_eq!(second.status(), Status::Waiting);

        mgr.stop_job(first.id()).unwrap();
        assert_eq!(first.status(), Status::Stopped);
        assert_eq!(second.status(), Status::Running);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let mgr = manager(1);
        let job = StubJob::new("dup", mgr.event_sender());
        assert!(mgr.add_job(Arc::clone(&job) as Arc<dyn TransferJob>));
        assert!(!mgr.add_job(job as Arc<dyn TransferJob>));
    }

    #[tokio::test]
    async fn unknown_ids_error() {
        let mgr = manager(1);
        assert!(matches!(
            mgr.start_job("nope", false),
            Err(TransferError::UnknownJob(_))
        ));
        assert!(matches!(
            mgr.remove_job("nope"),
            Err(TransferError::UnknownJob(_))
        ));
    }

    #[tokio::test]
    async fn removed_jobs_leave_the_store() {
        let store = Arc::new(MemoryJobStore::new());
        let mgr = ManagerCore::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            TransferConfig::default(),
            ManagerHooks::default(),
        );
        let job = StubJob::new("victim", mgr.event_sender());
        let id = job.id().to_string();
        mgr.add_job(job as Arc<dyn TransferJob>);
        mgr.persist_jobs().unwrap();
        assert_eq!(store.iterate().unwrap().len(), 1);

        mgr.remove_job(&id).unwrap();
        assert!(store.iterate().unwrap().is_empty());
        assert!(!mgr.contains_job(&id));
    }

    #[tokio::test]
    async fn finished_jobs_are_not_persisted() {
        let store = Arc::new(MemoryJobStore::new());
        let mgr = ManagerCore::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            TransferConfig::default(),
            ManagerHooks::default(),
        );
        let done = StubJob::new("done", mgr.event_sender());
        let pending = StubJob::new("pending", mgr.event_sender());
        done.core.restore_status(Status::Finished);
        mgr.add_job(Arc::clone(&done) as Arc<dyn TransferJob>);
        mgr.add_job(Arc::clone(&pending) as Arc<dyn TransferJob>);

        mgr.persist_jobs().unwrap();
        let persisted = store.iterate().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].0, pending.id());
    }

    #[tokio::test]
    async fn done_hook_fires_after_the_slot_is_released() {
        let fired = Arc::new(AtomicUsize::new(0));
        let hook_fired = Arc::clone(&fired);
        let hooks = ManagerHooks {
            on_job_done: Some(Arc::new(move |_id, status| {
                assert_eq!(status, Status::Finished);
                hook_fired.fetch_add(1, Ordering::SeqCst);
            })),
            ..ManagerHooks::default()
        };
        let mgr = ManagerCore::new(
            Arc::new(MemoryJobStore::new()),
            TransferConfig::default(),
            hooks,
        );
        let job = StubJob::new("hooked", mgr.event_sender());
        mgr.add_job(Arc::clone(&job) as Arc<dyn TransferJob>);
        mgr.schedule_jobs();
        job.finish();

        wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
    }

    #[tokio::test]
    async fn raising_the_ceiling_admits_more_jobs() {
        let mgr = manager(1);
        let jobs: Vec<_> = (0..3)
            .map(|i| StubJob::new(&format!("f{i}"), mgr.event_sender()))
            .collect();
        for job in &jobs {
            mgr.add_job(Arc::clone(job) as Arc<dyn TransferJob>);
        }
        mgr.schedule_jobs();
        assert_eq!(mgr.counters().running, 1);

        mgr.update_config(ConfigUpdate {
            max_concurrency: Some(3),
            ..ConfigUpdate::default()
        });
        assert_eq!(mgr.counters().running, 3);
    }

    #[tokio::test]
    async fn speed_limit_update_reaches_existing_jobs() {
        let mgr = manager(1);
        let job = StubJob::new("limited", mgr.event_sender());
        mgr.add_job(Arc::clone(&job) as Arc<dyn TransferJob>);

        mgr.update_config(ConfigUpdate {
            speed_limit: Some(Some(1024)),
            ..ConfigUpdate::default()
        });
        assert_eq!(mgr.config().speed_limit, Some(1024));
        // The limit lands in the job's speed counter; sampling clamps
        // to it from the next window on.
    }

    #[tokio::test]
    async fn pages_are_filtered_and_sliced_in_insertion_order() {
        let mgr = manager(0);
        for i in 0..7 {
            let job = StubJob::new(&format!("doc-{i}.txt"), mgr.event_sender());
            if i % 2 == 1 {
                job.core.restore_status(Status::Failed);
            }
            mgr.add_job(job as Arc<dyn TransferJob>);
        }

        let all = mgr.ui_page(0, 10, &JobQuery::default());
        assert_eq!(all.list.len(), 7);
        assert_eq!(all.counters.total, 7);
        assert_eq!(all.counters.failed, 3);
        assert!(all.list[0].from.contains("doc-0"));

        let failed = mgr.ui_page(
            0,
            2,
            &JobQuery {
                status: Some(Status::Failed),
                name: None,
            },
        );
        assert_eq!(failed.matched, 3);
        assert_eq!(failed.list.len(), 2);
        assert!(failed.list.iter().all(|d| d.status == Status::Failed));

        let second_page = mgr.ui_page(
            1,
            2,
            &JobQuery {
                status: Some(Status::Failed),
                name: None,
            },
        );
        assert_eq!(second_page.list.len(), 1);

        let named = mgr.ui_page(
            0,
            10,
            &JobQuery {
                status: None,
                name: Some("doc-4".into()),
            },
        );
        assert_eq!(named.matched, 1);
    }

    #[tokio::test]
    async fn start_all_requeues_stopped_and_failed_jobs() {
        let mgr = manager(10);
        let stopped = StubJob::new("stopped", mgr.event_sender());
        let failed = StubJob::new("failed", mgr.event_sender());
        let finished = StubJob::new("finished", mgr.event_sender());
        stopped.core.restore_status(Status::Stopped);
        failed.core.restore_status(Status::Failed);
        finished.core.restore_status(Status::Finished);
        for job in [&stopped, &failed, &finished] {
            mgr.add_job(Arc::clone(job) as Arc<dyn TransferJob>);
        }

        mgr.start_all_jobs();

        assert_eq!(stopped.status(), Status::Running);
        assert_eq!(failed.status(), Status::Running);
        assert_eq!(finished.status(), Status::Finished);
    }

    #[tokio::test]
    async fn stop_all_defaults_to_active_jobs() {
        let mgr = manager(1);
        let running = StubJob::new("running", mgr.event_sender());
        let waiting = StubJob::new("waiting", mgr.event_sender());
        let failed = StubJob::new("failed", mgr.event_sender());
        failed.core.restore_status(Status::Failed);
        for job in [&running, &waiting, &failed] {
            mgr.add_job(Arc::clone(job) as Arc<dyn TransferJob>);
        }
        mgr.schedule_jobs();
        assert_eq!(running.status(), Status::Running);

        mgr.stop_all_jobs(None);

        assert_eq!(running.status(), Status::Stopped);
        assert_eq!(waiting.status(), Status::Stopped);
        assert_eq!(failed.status(), Status::Failed);
    }

    #[tokio::test]
    async fn remove_all_clears_table_and_store() {
        let store = Arc::new(MemoryJobStore::new());
        let mgr = ManagerCore::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            TransferConfig::default(),
            ManagerHooks::default(),
        );
        for i in 0..3 {
            mgr.add_job(StubJob::new(&format!("j{i}"), mgr.event_sender()) as Arc<dyn TransferJob>);
        }
        mgr.persist_jobs().unwrap();
        assert_eq!(store.iterate().unwrap().len(), 3);

        mgr.remove_all_jobs();

        assert!(mgr.job_ids().is_empty());
        assert!(store.iterate().unwrap().is_empty());
        assert_eq!(mgr.counters().total, 0);
    }

    #[tokio::test]
    async fn cleanup_drops_only_finished_jobs() {
        let mgr = manager(0);
        let finished = StubJob::new("finished", mgr.event_sender());
        let waiting = StubJob::new("waiting", mgr.event_sender());
        finished.core.restore_status(Status::Finished);
        mgr.add_job(Arc::clone(&finished) as Arc<dyn TransferJob>);
        mgr.add_job(Arc::clone(&waiting) as Arc<dyn TransferJob>);

        mgr.cleanup_finished_jobs();

        assert!(!mgr.contains_job(finished.id()));
        assert!(mgr.contains_job(waiting.id()));
    }
}