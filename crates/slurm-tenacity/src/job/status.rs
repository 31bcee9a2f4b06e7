use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse status of a Slurm job, telling the caller what to do next.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SimplifiedStatus {
    /// Queued or running.
    Waiting,
    Success,
    /// Unrecoverable failure.
    Failed,
    /// Worth resubmitting unchanged (preemption, node failure, external cancellation).
    FailedRetry,
    /// Ran out of memory.
    FailedMem,
    /// Exceeded the requested walltime.
    FailedTime,
    /// A Slurm state that is not known to the mapping table, kept verbatim.
    Unknown(String),
}

impl SimplifiedStatus {
    /// Maps a raw `sacct` state onto the simplified status.
    ///
    /// Unknown states are passed through unchanged; if such a state is spelled like one of the
    /// canonical names, it is that status.
    pub fn from_slurm_state(state: &str) -> Self {
        match state {
            "PENDING" | "RUNNING" | "REQUEUED" | "RESIZING" | "" => Self::Waiting,
            "COMPLETED" => Self::Success,
            "BOOT_FAIL" | "DEADLINE" | "FAILED" | "REVOKED" | "SUSPENDED" => Self::Failed,
            "CANCELLED" | "NODE_FAIL" | "PREEMPTED" => Self::FailedRetry,
            "OUT_OF_MEMORY" => Self::FailedMem,
            "TIMEOUT" => Self::FailedTime,
            other => Self::from_canonical_name(other),
        }
    }

    fn from_canonical_name(name: &str) -> Self {
        match name {
            "waiting" => Self::Waiting,
            "success" => Self::Success,
            "failed" => Self::Failed,
            "failed-retry" => Self::FailedRetry,
            "failed-mem" => Self::FailedMem,
            "failed-time" => Self::FailedTime,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Waiting => "waiting",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::FailedRetry => "failed-retry",
            Self::FailedMem => "failed-mem",
            Self::FailedTime => "failed-time",
            Self::Unknown(state) => state,
        }
    }

    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_waiting()
    }
}

impl fmt::Display for SimplifiedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
