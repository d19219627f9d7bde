//! Request processors: pre-flight transforms re-run on every attempt.

use crate::codec::Encoder;
use crate::error::{Error, Result};
use crate::request::Request;
use async_trait::async_trait;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName, HeaderValue};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Transforms the outgoing request before an attempt.
///
/// Processors run in declared order, each receiving the previous one's
/// output, and are re-run from the original request on every retry so
/// attempt-dependent state (signatures, timestamps, tokens) stays fresh.
#[async_trait]
pub trait RequestProcessor: Send + Sync {
    /// Returns the transformed request, or an error that aborts the attempt.
    async fn process(&self, request: Request) -> Result<Request>;
}

/// Shared handle to a request processor.
pub type SharedRequestProcessor = Arc<dyn RequestProcessor>;

/// Runs the chain, wrapping the first failure as [`Error::RequestProcessor`].
pub(crate) async fn run_request_processors(
    processors: &[SharedRequestProcessor],
    mut request: Request,
) -> Result<Request> {
    for (index, processor) in processors.iter().enumerate() {
        request = processor.process(request).await.map_err(|e| {
            debug!(index, error = %e, "Request processor failed");
            Error::RequestProcessor(Box::new(e))
        })?;
    }
    Ok(request)
}

/// Adapts a synchronous closure into a [`RequestProcessor`].
pub struct FnRequestProcessor<F>(F);

/// Creates a request processor from a synchronous closure.
pub fn request_processor_fn<F>(f: F) -> FnRequestProcessor<F>
where
    F: Fn(Request) -> Result<Request> + Send + Sync,
{
    FnRequestProcessor(f)
}

impl<F> fmt::Debug for FnRequestProcessor<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnRequestProcessor")
    }
}

#[async_trait]
impl<F> RequestProcessor for FnRequestProcessor<F>
where
    F: Fn(Request) -> Result<Request> + Send + Sync,
{
    async fn process(&self, request: Request) -> Result<Request> {
        (self.0)(request)
    }
}

/// Sets a header on every attempt.
#[derive(Debug, Clone)]
pub struct SetHeader {
    name: HeaderName,
    value: HeaderValue,
}

impl SetHeader {
    /// Validates the header and creates the processor.
    pub fn new(name: &str, value: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::invalid_request(format!("Invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::invalid_request(format!("Invalid header value: {e}")))?;
        Ok(Self { name, value })
    }
}

#[async_trait]
impl RequestProcessor for SetHeader {
    async fn process(&self, mut request: Request) -> Result<Request> {
        request.set_header(self.name.clone(), self.value.clone());
        Ok(request)
    }
}

/// Supplies bearer tokens, e.g. from a refreshing credential store.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a currently valid token.
    async fn token(&self) -> Result<String>;
}

/// Adds `Authorization: Bearer <token>`, fetching a fresh token per attempt.
pub struct BearerToken {
    source: Arc<dyn TokenSource>,
}

impl BearerToken {
    /// Creates the processor.
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self { source }
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken").finish_non_exhaustive()
    }
}

#[async_trait]
impl RequestProcessor for BearerToken {
    async fn process(&self, mut request: Request) -> Result<Request> {
        let token = self.source.token().await?;
        let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| Error::invalid_request(format!("Invalid bearer token: {e}")))?;
        value.set_sensitive(true);
        request.set_header(AUTHORIZATION, value);
        Ok(request)
    }
}

/// Encodes a value into the request body and sets `Content-Type`.
pub struct EncodeBody<T, E> {
    value: T,
    encoder: E,
}

impl<T, E> EncodeBody<T, E> {
    /// Creates the processor.
    pub fn new(value: T, encoder: E) -> Self {
        Self { value, encoder }
    }
}

impl<T, E> fmt::Debug for EncodeBody<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodeBody").finish_non_exhaustive()
    }
}

#[async_trait]
impl<T, E> RequestProcessor for EncodeBody<T, E>
where
    T: Send + Sync,
    E: Encoder<T>,
{
    async fn process(&self, mut request: Request) -> Result<Request> {
        let (body, media_type) = self.encoder.encode(&self.value).map_err(Error::Other)?;
        let content_type = HeaderValue::from_str(&media_type)
            .map_err(|e| Error::invalid_request(format!("Invalid media type '{media_type}': {e}")))?;
        request.set_header(CONTENT_TYPE, content_type);
        request.body = Some(body);
        Ok(request)
    }
}
