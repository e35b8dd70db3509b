//! Job state machine types.

use serde::{Deserialize, Serialize};

use crate::transport::ByteStream;

/// Where a [`JobPoller`](super::JobPoller) is in the start, poll, download cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    Starting,
    Polling,
    Downloading,
    Complete,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobState {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Complete | JobState::Failed | JobState::TimedOut | JobState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::NotStarted => "not_started",
            JobState::Starting => "starting",
            JobState::Polling => "polling",
            JobState::Downloading => "downloading",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
            JobState::TimedOut => "timed_out",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job status as reported by the remote system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    #[serde(alias = "queued")]
    Pending,
    InProgress,
    Complete,
    Failed,
}

/// One poll response.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub status: JobStatus,
    /// 0 to 100
    pub percent_complete: f64,
    /// Present once the job is complete
    pub result_handle: Option<String>,
}

impl JobProgress {
    /// A still-running job at `percent`.
    pub fn in_progress(percent: f64) -> Self {
        Self {
            status: JobStatus::InProgress,
            percent_complete: percent,
            result_handle: None,
        }
    }

    /// A finished job whose artifact is `handle`.
    pub fn complete(handle: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Complete,
            percent_complete: 100.0,
            result_handle: Some(handle.into()),
        }
    }

    /// A job the remote side gave up on.
    pub fn failed() -> Self {
        Self {
            status: JobStatus::Failed,
            percent_complete: 0.0,
            result_handle: None,
        }
    }
}

/// Mutable bookkeeping for one job, owned by its poller.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JobRecord {
    pub job_id: Option<String>,
    pub status: JobStatus,
    pub percent_complete: f64,
    pub result_handle: Option<String>,
    pub attempt_count: u32,
}

impl Default for JobRecord {
    fn default() -> Self {
        Self {
            job_id: None,
            status: JobStatus::Pending,
            percent_complete: 0.0,
            result_handle: None,
            attempt_count: 0,
        }
    }
}

/// Observable progress of a poller.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The poller changed state
    Transition { from: JobState, to: JobState },
    /// A poll response arrived while in [`JobState::Polling`]
    Progress {
        attempt: u32,
        status: JobStatus,
        percent_complete: f64,
    },
}

/// The result of a completed job: an open stream over the artifact.
pub struct JobArtifact {
    pub job_id: String,
    pub result_handle: String,
    /// Number of status checks it took
    pub polls: u32,
    pub stream: ByteStream,
}

impl std::fmt::Debug for JobArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobArtifact")
            .field("job_id", &self.job_id)
            .field("result_handle", &self.result_handle)
            .field("polls", &self.polls)
            .finish_non_exhaustive()
    }
}
