use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transfer job.
///
/// Reachable edges:
///
/// ```text
/// Waiting    -> Running                (start)
/// Running    -> Verifying -> Finished  (transfer ok, post-processing ok)
/// Running    -> Failed                 (adapter error, not user-cancel)
/// Running    -> Stopped                (stop)
/// Running    -> Waiting                (wait)
/// Running    -> Duplicated             (upload: object exists, no overwrite)
/// Stopped    -> Waiting                (wait)
/// Waiting    -> Stopped                (stop)
/// Failed     -> Waiting                (wait, i.e. retry)
/// Duplicated -> Running                (start with forced overwrite)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Waiting,
    Running,
    Stopped,
    Finished,
    Failed,
    Duplicated,
    Verifying,
}

impl Status {
    /// States on whose entry the speed counter is reset to zero.
    pub fn halts_speed(&self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Stopped | Status::Finished | Status::Duplicated
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Finished => "finished",
            Status::Failed => "failed",
            Status::Duplicated => "duplicated",
            Status::Verifying => "verifying",
        };
        f.write_str(s)
    }
}
