//! Transport abstraction consumed by the dispatcher and the job API.
//!
//! A transport turns an [`ApiRequest`] into a status code and a body stream.
//! Bodies are never buffered unless the caller asks for it, because job
//! artifacts can be large.

mod http;

pub use http::HttpTransport;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use crate::error::{CourierError, Result};

/// Longest error body excerpt carried in an application error.
const ERROR_EXCERPT_LEN: usize = 512;

/// Longest `Retry-After` hint taken at face value.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(86400);

/// Streamed response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// A request relative to the transport's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// HTTP method
    pub method: HttpMethod,
    /// Path relative to the base URL
    pub path: String,
    /// Extra request headers
    pub headers: HashMap<String, String>,
    /// Request body
    pub body: Option<Bytes>,
}

impl ApiRequest {
    /// A `GET` on `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            path: path.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    /// A `POST` on `path` with a JSON body.
    pub fn post_json<T: Serialize>(path: impl Into<String>, body: &T) -> Result<Self> {
        let body = serde_json::to_vec(body)?;
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Ok(Self {
            method: HttpMethod::Post,
            path: path.into(),
            headers,
            body: Some(Bytes::from(body)),
        })
    }

    /// Add a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// A response whose body has not been read yet.
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers, names lowercased
    pub headers: HashMap<String, String>,
    /// Response body
    pub body: ByteStream,
}

impl std::fmt::Debug for ApiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl ApiResponse {
    /// Build a response from a fully buffered body.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers: HashMap::new(),
            body: Box::pin(futures::stream::once(async move { Ok::<_, CourierError>(body) })),
        }
    }

    /// Add a header.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The `Retry-After` header, when given in seconds, capped at one day.
    pub fn retry_after(&self) -> Option<Duration> {
        let secs = self
            .headers
            .get("retry-after")
            .and_then(|value| value.trim().parse::<f64>().ok())
            .filter(|secs| !secs.is_nan() && *secs >= 0.0)?;
        Some(
            Duration::try_from_secs_f64(secs)
                .unwrap_or(MAX_RETRY_AFTER)
                .min(MAX_RETRY_AFTER),
        )
    }

    /// Turn non-success statuses into classified errors.
    ///
    /// 429 is throttling, 408/502/503/504 are transient, anything else
    /// outside 2xx is an application error carrying a body excerpt.
    pub async fn classify(self) -> Result<Self> {
        match self.status {
            200..=299 => Ok(self),
            429 => Err(CourierError::Throttled {
                retry_after: self.retry_after(),
            }),
            408 | 502 | 503 | 504 => Err(CourierError::TransientTransport(format!(
                "HTTP {}",
                self.status
            ))),
            status => {
                let excerpt = self.excerpt(ERROR_EXCERPT_LEN).await;
                Err(CourierError::Application {
                    status: Some(status),
                    message: String::from_utf8_lossy(&excerpt).into_owned(),
                })
            }
        }
    }

    /// Read at most `limit` bytes of the body and drop the rest unread.
    async fn excerpt(mut self, limit: usize) -> Bytes {
        let mut buffer = BytesMut::new();
        while buffer.len() < limit {
            match self.body.next().await {
                Some(Ok(chunk)) => {
                    let take = chunk.len().min(limit - buffer.len());
                    buffer.extend_from_slice(&chunk[..take]);
                }
                _ => break,
            }
        }
        buffer.freeze()
    }

    /// Read the whole body into memory.
    pub async fn bytes(mut self) -> Result<Bytes> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }

    /// Read and decode a JSON body.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Take the body stream.
    pub fn into_stream(self) -> ByteStream {
        self.body
    }
}

/// Sends requests to the remote API.
///
/// Implementations must not buffer response bodies. Dropping the returned
/// future must abort the request.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and return the status, headers and body stream.
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse>;
}
