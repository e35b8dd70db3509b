//! Start, poll and download state machine for one asynchronous job.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::api::{ExportRequest, JobApi};
use super::state::{JobArtifact, JobEvent, JobRecord, JobState, JobStatus};
use crate::dispatch::CallDispatcher;
use crate::error::{CourierError, Result};
use crate::ratelimit::rules::{DOWNLOAD_JOB, POLL_JOB, START_JOB};

/// Poll cadence and the admission categories each phase runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Base wait between status checks; the n-th wait is `poll_interval * n`
    pub poll_interval: Duration,
    /// Status checks before giving up with [`CourierError::PollingTimedOut`]
    pub max_poll_attempts: u32,
    pub start_category: String,
    pub poll_category: String,
    pub download_category: String,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_poll_attempts: 60,
            start_category: START_JOB.to_string(),
            poll_category: POLL_JOB.to_string(),
            download_category: DOWNLOAD_JOB.to_string(),
        }
    }
}

impl PollerConfig {
    /// Wait after the `attempt`-th status check (0-based).
    fn wait_after(&self, attempt: u32) -> Duration {
        self.poll_interval.saturating_mul(attempt.saturating_add(1))
    }
}

/// Drives one job from start to an open artifact stream.
///
/// A poller is single use: [`JobPoller::run`] consumes it, and the job
/// record it keeps is dropped with it.
pub struct JobPoller {
    dispatcher: Arc<CallDispatcher>,
    api: Arc<dyn JobApi>,
    config: PollerConfig,
    state: JobState,
    record: JobRecord,
    events: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl JobPoller {
    pub fn new(dispatcher: Arc<CallDispatcher>, api: Arc<dyn JobApi>, config: PollerConfig) -> Self {
        Self {
            dispatcher,
            api,
            config,
            state: JobState::NotStarted,
            record: JobRecord::default(),
            events: None,
        }
    }

    /// Subscribe to state transitions and poll progress.
    ///
    /// Only the most recent subscriber receives events. The channel closes
    /// when the poller is consumed.
    pub fn events(&mut self) -> mpsc::UnboundedReceiver<JobEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    /// Run the job to a terminal state.
    ///
    /// Returns the open artifact stream on success. Failures map onto the
    /// terminal states: cancellation ends in [`JobState::Cancelled`], an
    /// exhausted poll budget in [`JobState::TimedOut`], anything else in
    /// [`JobState::Failed`].
    pub async fn run(mut self, request: &ExportRequest, cancel: &CancellationToken) -> Result<JobArtifact> {
        let span = info_span!("job", survey = %request.survey_id);
        let result = self.drive(request, cancel).instrument(span.clone()).await;

        let _enter = span.enter();
        match result {
            Ok(artifact) => {
                self.transition(JobState::Complete);
                info!(job_id = %artifact.job_id, polls = artifact.polls, "Job complete");
                Ok(artifact)
            }
            Err(err) => {
                let terminal = if err.is_cancelled() {
                    JobState::Cancelled
                } else if matches!(err, CourierError::PollingTimedOut { .. }) {
                    JobState::TimedOut
                } else {
                    JobState::Failed
                };
                self.transition(terminal);
                warn!(
                    job_id = ?self.record.job_id,
                    state = %terminal,
                    last_status = ?self.record.status,
                    percent = self.record.percent_complete,
                    error = %err,
                    "Job did not complete"
                );
                Err(err)
            }
        }
    }

    async fn drive(&mut self, request: &ExportRequest, cancel: &CancellationToken) -> Result<JobArtifact> {
        let dispatcher = self.dispatcher.clone();
        let api = self.api.clone();
        let api = &*api;

        self.transition(JobState::Starting);
        ensure_live(cancel)?;
        let job_id = dispatcher
            .dispatch(&self.config.start_category, cancel, move || api.start(request))
            .await?;
        info!(job_id = %job_id, "Job started");
        self.record.job_id = Some(job_id.clone());

        self.transition(JobState::Polling);
        let handle = self.poll_until_done(&dispatcher, api, request, &job_id, cancel).await?;

        self.transition(JobState::Downloading);
        ensure_live(cancel)?;
        let handle_ref = handle.as_str();
        let stream = dispatcher
            .dispatch(&self.config.download_category, cancel, move || {
                api.fetch(request, handle_ref)
            })
            .await?;

        Ok(JobArtifact {
            job_id,
            result_handle: self.record.result_handle.take().unwrap_or(handle),
            polls: self.record.attempt_count,
            stream,
        })
    }

    /// Poll until the remote side reports a terminal status and return
    /// the result handle.
    async fn poll_until_done(
        &mut self,
        dispatcher: &CallDispatcher,
        api: &dyn JobApi,
        request: &ExportRequest,
        job_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let category = self.config.poll_category.clone();
        let max_attempts = self.config.max_poll_attempts;

        for attempt in 0..max_attempts {
            ensure_live(cancel)?;
            let progress = dispatcher
                .dispatch(&category, cancel, move || api.poll(request, job_id))
                .await?;

            self.record.attempt_count = attempt + 1;
            self.record.status = progress.status;
            self.record.percent_complete = progress.percent_complete;
            debug!(
                attempt = attempt + 1,
                status = ?progress.status,
                percent = progress.percent_complete,
                "Polled job"
            );
            self.emit(JobEvent::Progress {
                attempt: attempt + 1,
                status: progress.status,
                percent_complete: progress.percent_complete,
            });

            match progress.status {
                JobStatus::Complete => {
                    return match progress.result_handle {
                        Some(handle) => {
                            self.record.result_handle = Some(handle.clone());
                            Ok(handle)
                        }
                        None => Err(CourierError::Application {
                            status: None,
                            message: format!("job {job_id} completed without a result handle"),
                        }),
                    };
                }
                JobStatus::Failed => {
                    return Err(CourierError::JobFailed {
                        job_id: job_id.to_string(),
                    })
                }
                JobStatus::Pending | JobStatus::InProgress => {}
            }

            if attempt + 1 < max_attempts {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CourierError::Cancelled),
                    _ = tokio::time::sleep(self.config.wait_after(attempt)) => {}
                }
            }
        }

        Err(CourierError::PollingTimedOut {
            job_id: job_id.to_string(),
            attempts: max_attempts,
        })
    }

    fn transition(&mut self, to: JobState) {
        let from = self.state;
        if from == to || from.is_terminal() {
            return;
        }
        self.state = to;
        debug!(from = %from, to = %to, "Job state changed");
        self.emit(JobEvent::Transition { from, to });
    }

    fn emit(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            // A dropped receiver just means nobody is watching
            let _ = events.send(event);
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(CourierError::Cancelled)
    } else {
        Ok(())
    }
}
