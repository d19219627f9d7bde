//! Request and response metadata types.
//!
//! [`Request`] is the value request processors transform on every attempt;
//! [`ResponseHead`] is the metadata validators see as soon as the transport
//! knows the status line and headers.

use crate::error::{Error, Result};
use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::time::Duration;
use url::Url;

/// Returns `true` for methods that are safe to repeat without duplicating
/// side effects: GET, HEAD, PUT, DELETE, OPTIONS, TRACE and QUERY.
pub fn is_idempotent_method(method: &Method) -> bool {
    const IDEMPOTENT: [Method; 6] = [
        Method::GET,
        Method::HEAD,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
        Method::TRACE,
    ];
    IDEMPOTENT.contains(method) || method.as_str() == "QUERY"
}

/// An outgoing HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Target URL.
    pub url: Url,
    /// Request headers.
    pub headers: HeaderMap,
    /// Optional request body.
    pub body: Option<Bytes>,
    /// Per-attempt timeout handed to the transport.
    pub timeout: Option<Duration>,
}

impl Request {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Parses `url` and creates a GET request.
    pub fn get(url: &str) -> Result<Self> {
        Self::builder(Method::GET, url).build()
    }

    /// Parses `url` and creates a POST request.
    pub fn post(url: &str) -> Result<Self> {
        Self::builder(Method::POST, url).build()
    }

    /// Starts building a request.
    pub fn builder(method: Method, url: &str) -> RequestBuilder {
        RequestBuilder {
            method,
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    /// Host component of the URL, used to key reachability and sibling events.
    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Whether the method may be retried without explicit opt-in.
    pub fn is_idempotent(&self) -> bool {
        is_idempotent_method(&self.method)
    }

    /// Sets a header, replacing any previous value.
    pub fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }
}

/// Builder for [`Request`]; URL and header parsing errors surface on `build`.
#[derive(Debug, Clone)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
    timeout: Option<Duration>,
}

impl RequestBuilder {
    /// Adds a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Builds the request.
    pub fn build(self) -> Result<Request> {
        let url = Url::parse(&self.url)
            .map_err(|e| Error::invalid_request(format!("Invalid URL '{}': {e}", self.url)))?;

        let mut headers = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::invalid_request(format!("Invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(&value)
                .map_err(|e| Error::invalid_request(format!("Invalid header value: {e}")))?;
            headers.append(name, value);
        }

        Ok(Request {
            method: self.method,
            url,
            headers,
            body: self.body,
            timeout: self.timeout,
        })
    }
}

/// Response metadata, available before the body.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Final URL after redirects.
    pub url: Url,
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Expected body length, when announced.
    pub content_length: Option<u64>,
}

impl ResponseHead {
    /// Creates response metadata with empty headers.
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
            content_length: None,
        }
    }

    /// Adds a header; invalid values are ignored.
    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Lower-cased media type of the `Content-Type` header, without parameters.
    pub fn media_type(&self) -> Option<String> {
        let value = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let essence = value.split(';').next()?.trim();
        if essence.is_empty() {
            None
        } else {
            Some(essence.to_ascii_lowercase())
        }
    }

    /// `Retry-After` in delta-seconds form. HTTP-date values are not parsed.
    pub fn retry_after(&self) -> Option<Duration> {
        let value = self.headers.get(RETRY_AFTER)?.to_str().ok()?;
        value.trim().parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Half-open range of acceptable status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusRange {
    /// First accepted status.
    pub start: u16,
    /// First status past the range.
    pub end: u16,
}

impl StatusRange {
    /// `200..400`: success and redirection.
    pub const SUCCESS: StatusRange = StatusRange::new(200, 400);

    /// Creates a range accepting `start..end`.
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Whether `status` lies in the range.
    pub fn contains(&self, status: u16) -> bool {
        (self.start..self.end).contains(&status)
    }
}

impl Default for StatusRange {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl From<Range<u16>> for StatusRange {
    fn from(range: Range<u16>) -> Self {
        Self::new(range.start, range.end)
    }
}

impl fmt::Display for StatusRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}
