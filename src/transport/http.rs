//! Reqwest-based transport.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::time::Duration;
use tracing::trace;
use url::Url;

use super::{ApiRequest, ApiResponse, HttpMethod, Transport};
use crate::error::{CourierError, Result};

/// Transport backed by a pooled `reqwest` client.
///
/// Paths are joined onto `base_url`; the API token, if any, is sent in
/// `auth_header` on every request.
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    auth_header: String,
    token: Option<SecretString>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field("auth_header", &self.auth_header)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Create a transport for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| CourierError::Config(format!("invalid base URL {base_url}: {e}")))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CourierError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            auth_header: "X-API-TOKEN".to_string(),
            token: None,
        })
    }

    /// Send `token` in `header` on every request.
    pub fn with_token(mut self, header: impl Into<String>, token: SecretString) -> Self {
        self.auth_header = header.into();
        self.token = Some(token);
        self
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| CourierError::Config(format!("invalid request path {path}: {e}")))
    }

    fn headers_for(&self, request: &ApiRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            headers.insert(header_name(name)?, header_value(value)?);
        }
        if let Some(token) = &self.token {
            let mut value = header_value(token.expose_secret())?;
            value.set_sensitive(true);
            headers.insert(header_name(&self.auth_header)?, value);
        }
        Ok(headers)
    }
}

fn header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| CourierError::Config(format!("invalid header name {name}: {e}")))
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| CourierError::Config(format!("invalid header value: {e}")))
}

/// Sort reqwest failures into retryable and final.
fn classify_reqwest_error(err: reqwest::Error) -> CourierError {
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        CourierError::TransientTransport(err.to_string())
    } else {
        CourierError::Application {
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = self.url_for(&request.path)?;
        let headers = self.headers_for(&request)?;
        let method = match request.method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
        };
        trace!(method = %method, url = %url, "Sending request");

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify_reqwest_error)?;

        let status = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| value.to_str().ok().map(|v| (name.to_string(), v.to_string())))
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(classify_reqwest_error));

        Ok(ApiResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}
