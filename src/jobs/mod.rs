//! Asynchronous jobs: the remote operations and the poller driving them.

mod api;
mod poller;
mod state;

pub use api::{ExportFormat, ExportRequest, HttpJobApi, JobApi};
pub use poller::{JobPoller, PollerConfig};
pub use state::{JobArtifact, JobEvent, JobProgress, JobState, JobStatus};
