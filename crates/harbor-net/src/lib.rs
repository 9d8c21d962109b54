//! # Harbor Net
//!
//! Request/response model and the network seam used by the Harbor cache layer.
//!
//! ## Design Goals
//!
//! 1. **Owned, cloneable responses**: a response can be stored in a cache and
//!    returned to a caller at the same time
//! 2. **Pluggable network**: strategies talk to a [`Fetcher`], never to reqwest
//!    directly, so background tasks can own their fetch futures
//! 3. **URL patterns**: glob/prefix/suffix matching for route rules

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use harbor_common::HarborError;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use mime::Mime;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace};
use url::Url;

pub mod pattern;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use pattern::{PatternType, UrlPattern};

/// Errors that can occur while talking to the network.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Network offline")]
    Offline,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl NetError {
    /// Convert into the caller-facing "no network, no fallback" error.
    pub fn into_unavailable(self, url: &Url) -> HarborError {
        match self {
            NetError::Timeout(after) => HarborError::Timeout(after),
            other => HarborError::network_unavailable(url.as_str(), other.to_string()),
        }
    }
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What kind of resource a request is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestDestination {
    /// A top-level page.
    Document,
    Script,
    Style,
    Image,
    Font,
    Audio,
    Video,
    Manifest,
    Worker,
    /// `fetch()`/XHR style data requests.
    #[default]
    Empty,
}

impl RequestDestination {
    /// Infer the destination from the URL's file extension.
    pub fn guess_from_url(url: &Url) -> Self {
        let path = url.path();
        if path.ends_with('/') {
            return Self::Document;
        }
        if path.ends_with(".webmanifest") {
            return Self::Manifest;
        }
        let Some(mime) = mime_guess::from_path(path).first() else {
            return Self::Empty;
        };
        Self::from_mime(&mime)
    }

    fn from_mime(mime: &Mime) -> Self {
        match (mime.type_().as_str(), mime.subtype().as_str()) {
            ("text", "html") => Self::Document,
            ("text", "css") => Self::Style,
            ("text", "javascript") | ("application", "javascript") => Self::Script,
            ("image", _) => Self::Image,
            ("font", _) | ("application", "font-woff") => Self::Font,
            ("audio", _) => Self::Audio,
            ("video", _) => Self::Video,
            _ => Self::Empty,
        }
    }
}

/// Request mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level navigation.
    Navigate,
    #[default]
    Cors,
    NoCors,
    SameOrigin,
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: RequestDestination,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request, inferring the destination from the URL.
    pub fn get(url: Url) -> Self {
        let destination = RequestDestination::guess_from_url(&url);
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            destination,
            mode: RequestMode::Cors,
            timeout: None,
        }
    }

    /// Create a top-level navigation request.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: RequestDestination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            destination: RequestDestination::Empty,
            ..Self::get(url)
        }
    }

    /// Parse `url` and create a GET request.
    pub fn parse(url: &str) -> Result<Self, NetError> {
        Url::parse(url)
            .map(Self::get)
            .map_err(|e| NetError::InvalidUrl(format!("{url}: {e}")))
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Override the destination.
    pub fn with_destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a top-level navigation.
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Whether the request targets the same origin as `base`.
    pub fn is_same_origin(&self, base: &Url) -> bool {
        self.url.origin() == base.origin()
    }
}

/// A fully-buffered response.
#[derive(Debug, Clone)]
pub struct Response {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    body: Bytes,
}

impl Response {
    /// Create a response.
    pub fn new(url: Url, status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            url,
            status,
            headers,
            body,
        }
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Borrow the body.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Take the body.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Parsed `Content-Type` header.
    pub fn content_type(&self) -> Option<Mime> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<Mime>().ok())
    }
}

/// The network seam.
///
/// Returned futures are `'static` so they can be moved into spawned tasks
/// (background revalidation, late network-first writes).
pub trait Fetcher: Send + Sync {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>>;
}

/// HTTP fetcher configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// User agent string.
    pub user_agent: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Harbor/{}", env!("CARGO_PKG_VERSION")),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// reqwest-backed [`Fetcher`].
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!("HttpFetcher initialized");

        Ok(Self { client })
    }

    async fn send(client: Client, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, "Fetching resource");

        let mut builder = client.request(request.method.clone(), request.url.clone());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or_default())
            } else {
                NetError::Http(e)
            }
        })?;

        let status = response.status();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let body = response.bytes().await?;

        trace!(url = %url, status = %status, body_len = body.len(), "Response received");

        Ok(Response::new(url, status, headers, body))
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, request: Request) -> BoxFuture<'static, Result<Response, NetError>> {
        Box::pin(Self::send(self.client.clone(), request))
    }
}
