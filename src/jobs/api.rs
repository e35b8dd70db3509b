//! The three remote operations a job needs: start, poll and fetch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::str::FromStr;
use std::sync::Arc;

use super::state::{JobProgress, JobStatus};
use crate::error::{CourierError, Result};
use crate::transport::{ApiRequest, ByteStream, Transport};

/// File format of the exported artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Tsv,
    Spss,
    Xml,
}

impl FromStr for ExportFormat {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "csv" => Ok(ExportFormat::Csv),
            "tsv" => Ok(ExportFormat::Tsv),
            "spss" => Ok(ExportFormat::Spss),
            "xml" => Ok(ExportFormat::Xml),
            other => Err(CourierError::Config(format!("unknown export format: {other}"))),
        }
    }
}

/// What to export: one survey's responses, optionally bounded by date.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub survey_id: String,
    pub format: ExportFormat,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub use_labels: bool,
    pub compress: bool,
}

impl ExportRequest {
    /// Export every response of `survey_id` as JSON.
    pub fn new(survey_id: impl Into<String>) -> Self {
        Self {
            survey_id: survey_id.into(),
            format: ExportFormat::Json,
            start_date: None,
            end_date: None,
            use_labels: true,
            compress: false,
        }
    }

    pub fn format(mut self, format: ExportFormat) -> Self {
        self.format = format;
        self
    }

    /// Limit the export to responses recorded in `[start, end]`.
    pub fn between(mut self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Reject date ranges that end before they start.
    pub fn validate(&self) -> Result<()> {
        if self.survey_id.trim().is_empty() {
            return Err(CourierError::Config("survey id must not be empty".into()));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if end < start {
                return Err(CourierError::Config(format!(
                    "export range ends ({end}) before it starts ({start})"
                )));
            }
        }
        Ok(())
    }
}

/// Remote operations driving one asynchronous job.
///
/// Implementations return classified errors so the dispatcher can tell
/// throttling and transient failures from final ones.
#[async_trait]
pub trait JobApi: Send + Sync {
    /// Create the job and return its identifier.
    async fn start(&self, request: &ExportRequest) -> Result<String>;

    /// Check on a running job.
    async fn poll(&self, request: &ExportRequest, job_id: &str) -> Result<JobProgress>;

    /// Open a stream over the finished artifact.
    async fn fetch(&self, request: &ExportRequest, result_handle: &str) -> Result<ByteStream>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StartBody {
    format: ExportFormat,
    use_labels: bool,
    compress: bool,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "wire_date")]
    start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "wire_date")]
    end_date: Option<DateTime<Utc>>,
}

impl From<&ExportRequest> for StartBody {
    fn from(request: &ExportRequest) -> Self {
        Self {
            format: request.format,
            use_labels: request.use_labels,
            compress: request.compress,
            start_date: request.start_date,
            end_date: request.end_date,
        }
    }
}

fn wire_date<S: Serializer>(date: &Option<DateTime<Utc>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match date {
        Some(date) => serializer.serialize_str(&date.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        None => serializer.serialize_none(),
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartResult {
    progress_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProgressResult {
    status: JobStatus,
    #[serde(default)]
    percent_complete: f64,
    file_id: Option<String>,
}

/// [`JobApi`] for the survey response export endpoints.
#[derive(Clone)]
pub struct HttpJobApi {
    transport: Arc<dyn Transport>,
}

impl HttpJobApi {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    fn export_path(request: &ExportRequest) -> String {
        format!("surveys/{}/export-responses", request.survey_id)
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn start(&self, request: &ExportRequest) -> Result<String> {
        let call = ApiRequest::post_json(Self::export_path(request), &StartBody::from(request))?;
        let response = self.transport.send(call).await?.classify().await?;
        let envelope: Envelope<StartResult> = response.json().await?;
        Ok(envelope.result.progress_id)
    }

    async fn poll(&self, request: &ExportRequest, job_id: &str) -> Result<JobProgress> {
        let path = format!("{}/{}", Self::export_path(request), job_id);
        let response = self.transport.send(ApiRequest::get(path)).await?.classify().await?;
        let envelope: Envelope<ProgressResult> = response.json().await?;
        Ok(JobProgress {
            status: envelope.result.status,
            percent_complete: envelope.result.percent_complete.clamp(0.0, 100.0),
            result_handle: envelope.result.file_id,
        })
    }

    async fn fetch(&self, request: &ExportRequest, result_handle: &str) -> Result<ByteStream> {
        let path = format!("{}/{}/file", Self::export_path(request), result_handle);
        let response = self.transport.send(ApiRequest::get(path)).await?.classify().await?;
        Ok(response.into_stream())
    }
}
