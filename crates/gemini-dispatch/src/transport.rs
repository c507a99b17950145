//! Transport seam between the dispatcher and the network
//!
//! The dispatcher treats request execution as a black box behind the
//! `Transport` trait: hand over a prepared request, get back a status,
//! headers, and body (or a stream of events). Everything above this seam —
//! auth headers, rate limiting, retries — stays testable against scripted
//! transports; `HttpTransport` is the real reqwest-backed implementation.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Cost assumed for a request whose caller did not estimate one.
pub const DEFAULT_ESTIMATED_COST: f64 = 1_000.0;

/// Header carrying the resume cursor when a streaming call is re-opened.
pub const RESUME_CURSOR_HEADER: &str = "x-resume-from";

/// A prepared outbound request. The dispatcher treats it as a template:
/// auth headers are injected fresh on every attempt.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: reqwest::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    /// Token-budget estimate charged against the rate limiter on success
    pub estimated_cost: f64,
    /// Opaque cursor a re-opened stream resumes after
    pub resume_from: Option<String>,
}

impl ApiRequest {
    pub fn new(method: reqwest::Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            estimated_cost: DEFAULT_ESTIMATED_COST,
            resume_from: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(reqwest::Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(reqwest::Method::POST, url)
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_estimated_cost(mut self, cost: f64) -> Self {
        self.estimated_cost = cost;
        self
    }
}

/// A complete response with the body already read.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ApiResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Raw `Retry-After` header value, if the server sent one.
    pub fn retry_after(&self) -> Option<&str> {
        self.headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok())
    }
}

/// Network-level failures, already split the way classification needs them.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transport error: {0}")]
    Other(String),
}

/// One event from a streaming response. The event parser collaborator
/// assigns cursors; events without one cannot anchor a resume.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub data: String,
    pub cursor: Option<String>,
}

/// Stream of events from an open streaming response.
pub type EventStream =
    Pin<Box<dyn Stream<Item = std::result::Result<StreamEvent, TransportError>> + Send>>;

/// Outcome of opening a streaming request. A reachable server that answers
/// with an error status is a `Failed` with the body read, so the dispatcher
/// classifies it exactly like a unary response.
pub enum StreamStart {
    Open(EventStream),
    Failed(ApiResponse),
}

/// Abstraction over request execution.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    /// Execute a unary request and read the full response body.
    fn execute(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<ApiResponse, TransportError>> + Send + '_>>;

    /// Open a streaming request.
    fn open_stream(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<StreamStart, TransportError>> + Send + '_>>;
}

/// reqwest-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Option<Duration>,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout: None,
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Per-request timeout applied to every attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn build(&self, request: ApiRequest) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(cursor) = &request.resume_from {
            builder = builder.header(RESUME_CURSOR_HEADER, cursor);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}

async fn read_response(response: reqwest::Response) -> std::result::Result<ApiResponse, TransportError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let body = response.text().await.map_err(map_reqwest_error)?;
    Ok(ApiResponse {
        status,
        headers,
        body,
    })
}

impl Transport for HttpTransport {
    fn execute(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<ApiResponse, TransportError>> + Send + '_>>
    {
        let builder = self.build(request);
        Box::pin(async move {
            let response = builder.send().await.map_err(map_reqwest_error)?;
            read_response(response).await
        })
    }

    fn open_stream(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = std::result::Result<StreamStart, TransportError>> + Send + '_>>
    {
        let builder = self.build(request);
        Box::pin(async move {
            let response = builder.send().await.map_err(map_reqwest_error)?;
            if !response.status().is_success() {
                return Ok(StreamStart::Failed(read_response(response).await?));
            }

            // Each received chunk is surfaced as one event; the event
            // parser collaborator upstream assigns cursors
            let events = response.bytes_stream().map(|chunk| match chunk {
                Ok(bytes) => Ok(StreamEvent {
                    data: String::from_utf8_lossy(&bytes).into_owned(),
                    cursor: None,
                }),
                Err(e) => Err(map_reqwest_error(e)),
            });
            Ok(StreamStart::Open(Box::pin(events)))
        })
    }
}
