//! Shared job core and the `TransferJob` contract.
//!
//! Upload and download jobs embed a [`JobCore`] (composition, not
//! inheritance): the core owns status, progress, message, retry
//! bookkeeping, the speed counter, and the cancellation token for the
//! in-flight adapter call. Status is mutated only through the core's
//! transition methods, which carry the side effects (speed reset,
//! observer notification) with them.

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use duffel_storage::BoxFuture;

use crate::persist::PersistInfo;
use crate::speed::SpeedCounter;
use crate::status::Status;
use crate::{BACKOFF_BASE, BACKOFF_CAP};

/// Byte progress of one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub loaded: u64,
    pub total: u64,
    pub resumable: bool,
}

/// Presentation snapshot of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiData {
    pub id: String,
    pub from: String,
    pub to: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub progress: Progress,
    /// Bytes per second, 0 unless Running.
    pub speed: u64,
    /// Estimated completion as epoch milliseconds, 0 when speed is 0.
    pub estimated_at: i64,
    /// Estimated remaining duration in milliseconds, 0 when speed is 0.
    pub estimated_duration_ms: u64,
}

/// Events a job delivers to its owning manager, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    StatusChanged { id: String, status: Status },
    Progress { id: String, loaded: u64, total: u64 },
    /// A multipart piece finished; the manager persists on this.
    PartCompleted { id: String },
    /// The job reached a terminal outcome of a run (Finished, Failed
    /// or Duplicated) and its scheduling slot is free.
    Done { id: String, status: Status },
}

pub type EventSender = mpsc::UnboundedSender<JobEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<JobEvent>;

struct CoreInner {
    status: Status,
    progress: Progress,
    message: String,
    retried: u32,
}

/// State machine shared by all job variants.
pub struct JobCore {
    id: String,
    inner: RwLock<CoreInner>,
    speed: SpeedCounter,
    cancel: Mutex<CancellationToken>,
    events: EventSender,
    max_retries: u32,
}

impl JobCore {
    /// Creates a core in the Waiting state. A fresh id is generated
    /// when `id` is `None`.
    pub fn new(
        id: Option<String>,
        progress: Progress,
        speed_limit: Option<u64>,
        max_retries: u32,
        events: EventSender,
    ) -> Self {
        Self {
            id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            inner: RwLock::new(CoreInner {
                status: Status::Waiting,
                progress,
                message: String::new(),
                retried: 0,
            }),
            speed: SpeedCounter::new(speed_limit),
            cancel: Mutex::new(CancellationToken::new()),
            events,
            max_retries,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> Status {
        self.inner.read().unwrap().status
    }

    pub fn message(&self) -> String {
        self.inner.read().unwrap().message.clone()
    }

    pub fn progress(&self) -> Progress {
        self.inner.read().unwrap().progress
    }

    pub fn speed(&self) -> u64 {
        self.speed.current()
    }

    pub fn set_speed_limit(&self, limit: Option<u64>) {
        self.speed.set_limit(limit);
    }

    /// Restores progress wholesale (recovery path only).
    pub fn restore_progress(&self, progress: Progress) {
        self.inner.write().unwrap().progress = progress;
    }

    /// Restores a persisted status without emitting events.
    pub fn restore_status(&self, status: Status) {
        self.inner.write().unwrap().status = status;
    }

    /// Restores a persisted failure message without emitting events.
    pub fn restore_message(&self, message: String) {
        self.inner.write().unwrap().message = message;
    }

    pub fn set_total(&self, total: u64) {
        self.inner.write().unwrap().progress.total = total;
    }

    /// Advances `loaded`. Monotonic and clamped to `total` while the
    /// job is running; ignored in any other state.
    pub fn set_loaded(&self, loaded: u64) {
        let (loaded, total) = {
            let mut inner = self.inner.write().unwrap();
            if !matches!(inner.status, Status::Running | Status::Verifying) {
                return;
            }
            let p = &mut inner.progress;
            let mut l = loaded;
            if p.total > 0 {
                l = l.min(p.total);
            }
            if l < p.loaded {
                return;
            }
            p.loaded = l;
            (l, p.total)
        };
        self.speed.sample(loaded);
        self.emit(JobEvent::Progress {
            id: self.id.clone(),
            loaded,
            total,
        });
    }

    /// Atomically enters Running if permitted, returning the fresh
    /// cancellation token for the run. `None` means the job is already
    /// Running or Finished (start is a no-op then).
    ///
    /// Side effects: clears the message, resets retry bookkeeping and
    /// restarts the speed counter.
    pub fn try_begin_run(&self) -> Option<CancellationToken> {
        let loaded = {
            let mut inner = self.inner.write().unwrap();
            if matches!(inner.status, Status::Running | Status::Finished) {
                return None;
            }
            inner.status = Status::Running;
            inner.message.clear();
            inner.retried = 0;
            inner.progress.loaded
        };
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap() = token.clone();
        self.speed.start(loaded);
        self.emit(JobEvent::StatusChanged {
            id: self.id.clone(),
            status: Status::Running,
        });
        Some(token)
    }

    /// Moves to `status`, firing side effects. Same-state transitions
    /// are no-ops (no duplicate notifications).
    pub fn transition(&self, status: Status) -> bool {
        {
            let mut inner = self.inner.write().unwrap();
            if inner.status == status {
                return false;
            }
            inner.status = status;
        }
        if status.halts_speed() {
            self.speed.reset();
        }
        self.emit(JobEvent::StatusChanged {
            id: self.id.clone(),
            status,
        });
        true
    }

    /// Records an error message and transitions to Failed.
    pub fn fail(&self, message: impl Into<String>) {
        self.inner.write().unwrap().message = message.into();
        self.transition(Status::Failed);
    }

    /// Cancels the in-flight adapter operation, if any. Cooperative:
    /// the adapter observes the token at its own suspension points.
    pub fn cancel_inflight(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Clone of the current run's cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    pub fn retried(&self) -> u32 {
        self.inner.read().unwrap().retried
    }

    /// Next retry delay (`base << retried`, capped), or `None` once
    /// the retry budget is exhausted.
    pub fn backoff(&self) -> Option<Duration> {
        let mut inner = self.inner.write().unwrap();
        if inner.retried >= self.max_retries {
            return None;
        }
        let shift = inner.retried.min(16);
        inner.retried += 1;
        Some((BACKOFF_BASE * 2u32.pow(shift)).min(BACKOFF_CAP))
    }

    /// Signals the manager that this run reached a terminal outcome.
    pub fn done(&self) {
        let status = self.status();
        self.emit(JobEvent::Done {
            id: self.id.clone(),
            status,
        });
    }

    pub fn part_completed(&self) {
        self.emit(JobEvent::PartCompleted {
            id: self.id.clone(),
        });
    }

    /// Builds the presentation snapshot around variant-provided
    /// endpoint labels.
    pub fn ui_snapshot(&self, from: String, to: String) -> UiData {
        let (status, message, progress) = {
            let inner = self.inner.read().unwrap();
            (inner.status, inner.message.clone(), inner.progress)
        };
        let speed = self.speed.current();
        let (estimated_at, estimated_duration_ms) =
            match self.speed.eta(progress.loaded, progress.total) {
                Some(eta) if speed > 0 => (
                    Utc::now().timestamp_millis() + eta.as_millis() as i64,
                    eta.as_millis() as u64,
                ),
                _ => (0, 0),
            };
        UiData {
            id: self.id.clone(),
            from,
            to,
            status,
            message,
            progress,
            speed,
            estimated_at,
            estimated_duration_ms,
        }
    }

    fn emit(&self, event: JobEvent) {
        trace!(id = %self.id, ?event, "job event");
        // The receiver outlives jobs in normal operation; a closed
        // channel just drops the notification.
        let _ = self.events.send(event);
    }
}

/// Contract every job variant fulfils. Managers own jobs exclusively
/// through this trait; they are the only external lifecycle mutators.
pub trait TransferJob: Send + Sync {
    fn core(&self) -> &JobCore;

    /// Runs the transfer to completion. The core has already entered
    /// Running via [`JobCore::try_begin_run`]; implementations convert
    /// every failure into job status + message and emit `Done` for
    /// terminal outcomes. Cancellation is swallowed: the status set by
    /// `stop`/`wait` stands.
    fn run<'a>(&'a self, forced: bool) -> BoxFuture<'a, ()>;

    /// Presentation snapshot.
    fn ui_data(&self) -> UiData;

    /// Serializable snapshot for crash recovery.
    fn persist_info(&self) -> PersistInfo;

    /// Best-effort removal cleanup (temp files etc.).
    fn cleanup(&self) {}

    fn id(&self) -> &str {
        self.core().id()
    }

    fn status(&self) -> Status {
        self.core().status()
    }

    /// Entry point for a direct (non-scheduler) start. No-op if the
    /// job is already Running or Finished.
    fn start<'a>(&'a self, forced: bool) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if self.core().try_begin_run().is_none() {
                return;
            }
            self.run(forced).await;
        })
    }

    /// Cancels any in-flight operation and parks the job in Stopped.
    /// No-op if already Stopped.
    fn stop(&self) {
        let core = self.core();
        if core.status() == Status::Stopped {
            return;
        }
        core.cancel_inflight();
        core.transition(Status::Stopped);
    }

    /// Cancels any in-flight operation and re-queues the job as
    /// Waiting (not a user cancellation). No-op if already Waiting.
    fn wait(&self) {
        let core = self.core();
        if core.status() == Status::Waiting {
            return;
        }
        core.cancel_inflight();
        core.transition(Status::Waiting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core_with_events() -> (JobCore, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = JobCore::new(None, Progress::default(), None, 3, tx);
        (core, rx)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<JobEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    struct StubJob {
        core: JobCore,
    }

    impl TransferJob for StubJob {
        fn core(&self) -> &JobCore {
            &self.core
        }
        fn run<'a>(&'a self, _forced: bool) -> BoxFuture<'a, ()> {
            Box::pin(async move {
                self.core.transition(Status::Finished);
                self.core.done();
            })
        }
        fn ui_data(&self) -> UiData {
            self.core.ui_snapshot("a".into(), "b".into())
        }
        fn persist_info(&self) -> PersistInfo {
            unimplemented!("stub")
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = JobCore::new(None, Progress::default(), None, 0, tx.clone());
        let b = JobCore::new(None, Progress::default(), None, 0, tx);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn begin_run_clears_message_and_emits() {
        let (core, mut rx) = core_with_events();
        core.fail("boom");
        assert_eq!(core.message(), "boom");

        let token = core.try_begin_run();
        assert!(token.is_some());
        assert_eq!(core.status(), Status::Running);
        assert!(core.message().is_empty());

        let events = drain(&mut rx);
        assert!(events.contains(&JobEvent::StatusChanged {
            id: core.id().into(),
            status: Status::Running
        }));
    }

    #[test]
    fn begin_run_rejected_while_running_or_finished() {
        let (core, _rx) = core_with_events();
        assert!(core.try_begin_run().is_some());
        assert!(core.try_begin_run().is_none());

        core.transition(Status::Finished);
        assert!(core.try_begin_run().is_none());
    }

    #[test]
    fn loaded_is_monotonic_and_clamped_while_running() {
        let (core, _rx) = core_with_events();
        core.set_total(100);
        core.try_begin_run();

        core.set_loaded(40);
        core.set_loaded(20); // regression ignored
        assert_eq!(core.progress().loaded, 40);

        core.set_loaded(500); // clamped to total
        assert_eq!(core.progress().loaded, 100);
    }

    #[test]
    fn loaded_ignored_when_not_running() {
        let (core, _rx) = core_with_events();
        core.set_total(100);
        core.set_loaded(50);
        assert_eq!(core.progress().loaded, 0);
    }

    #[test]
    fn same_state_transition_is_silent() {
        let (core, mut rx) = core_with_events();
        core.transition(Status::Stopped);
        drain(&mut rx);

        assert!(!core.transition(Status::Stopped));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn stop_and_wait_are_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = StubJob {
            core: JobCore::new(None, Progress::default(), None, 0, tx),
        };

        job.stop();
        drain(&mut rx);
        job.stop();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(job.status(), Status::Stopped);

        job.wait();
        drain(&mut rx);
        job.wait();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(job.status(), Status::Waiting);
    }

    #[test]
    fn stop_cancels_inflight_token() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let job = StubJob {
            core: JobCore::new(None, Progress::default(), None, 0, tx),
        };
        let token = job.core().try_begin_run().unwrap();
        assert!(!token.is_cancelled());

        job.stop();
        assert!(token.is_cancelled());
        assert_eq!(job.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn start_is_noop_when_finished() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let job = StubJob {
            core: JobCore::new(None, Progress::default(), None, 0, tx),
        };
        job.start(false).await;
        assert_eq!(job.status(), Status::Finished);
        drain(&mut rx);

        // Finished jobs never restart.
        job.start(false).await;
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn backoff_grows_and_exhausts() {
        let (core, _rx) = core_with_events();
        assert_eq!(core.backoff(), Some(BACKOFF_BASE));
        assert_eq!(core.backoff(), Some(BACKOFF_BASE * 2));
        assert_eq!(core.backoff(), Some(BACKOFF_BASE * 4));
        assert_eq!(core.backoff(), None);
        assert_eq!(core.retried(), 3);
    }

    #[test]
    fn backoff_is_capped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let core = JobCore::new(None, Progress::default(), None, 32, tx);
        let mut last = Duration::ZERO;
        for _ in 0..32 {
            last = core.backoff().unwrap();
        }
        assert_eq!(last, BACKOFF_CAP);
    }

    #[test]
    fn ui_snapshot_zero_eta_without_speed() {
        let (core, _rx) = core_with_events();
        let ui = core.ui_snapshot("src".into(), "dst".into());
        assert_eq!(ui.speed, 0);
        assert_eq!(ui.estimated_at, 0);
        assert_eq!(ui.estimated_duration_ms, 0);
        assert_eq!(ui.status, Status::Waiting);
    }

    #[test]
    fn speed_resets_on_terminal_states() {
        let (core, _rx) = core_with_events();
        core.set_total(1_000_000);
        core.try_begin_run();
        // Drive a sample through the counter directly.
        core.speed.start(0);
        core.set_loaded(1000);

        core.transition(Status::Failed);
        assert_eq!(core.speed(), 0);
    }
}
