//! Result processor pipeline.
//!
//! A [`ResultProcessor`] turns the raw source of a finished attempt (the
//! body bytes, or the downloaded file path) plus the response metadata into
//! a typed value. Processors compose through [`ResultProcessorExt`]:
//!
//! ```rust
//! use bytes::Bytes;
//! use netop_core::processor::{Decode, Recover, ResultProcessorExt, StatusCheck};
//! # #[derive(serde::Deserialize)] struct User { name: String }
//! # #[derive(Debug, serde::Deserialize)] struct ApiError { code: String }
//! # impl std::fmt::Display for ApiError {
//! #     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.code) }
//! # }
//! # impl std::error::Error for ApiError {}
//!
//! let pipeline = StatusCheck::<Bytes>::default()
//!     .flat_map(Decode::<User>::json())
//!     .flat_map_error(Recover::<Bytes>::default().flat_map(Decode::<ApiError>::json()))
//!     .map(|user| user.name);
//! # let _ = pipeline;
//! ```

use crate::codec::{Decoder, JsonDecoder};
use crate::error::{BoxError, Error, Result, StatusCodeMismatch};
use crate::operation::OperationSource;
use crate::request::{ResponseHead, StatusRange};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::error::Error as StdError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;

/// Asynchronous transform from an attempt's source to a typed value.
#[async_trait]
pub trait ResultProcessor: Send + Sync + 'static {
    /// Input value.
    type Source: Send + 'static;
    /// Produced value.
    type Output: Send + 'static;

    /// Processes `source` received with `response`.
    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<Self::Output>;
}

/// Type-erased, shareable result processor.
pub type BoxResultProcessor<S, O> = Arc<dyn ResultProcessor<Source = S, Output = O>>;

#[async_trait]
impl<P> ResultProcessor for Arc<P>
where
    P: ResultProcessor + ?Sized,
{
    type Source = P::Source;
    type Output = P::Output;

    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<Self::Output> {
        (**self).process(source, response).await
    }
}

/// Combinators available on every result processor.
pub trait ResultProcessorExt: ResultProcessor + Sized {
    /// Transforms the output with an infallible function.
    fn map<U, F>(self, f: F) -> Map<Self, F>
    where
        F: Fn(Self::Output) -> U + Send + Sync + 'static,
        U: Send + 'static,
    {
        Map { inner: self, f }
    }

    /// Transforms the output with a fallible function.
    fn try_map<U, F>(self, f: F) -> TryMap<Self, F>
    where
        F: Fn(Self::Output) -> Result<U> + Send + Sync + 'static,
        U: Send + 'static,
    {
        TryMap { inner: self, f }
    }

    /// Feeds the output into `next`, with the same response.
    fn flat_map<N>(self, next: N) -> FlatMap<Self, N>
    where
        N: ResultProcessor<Source = Self::Output>,
    {
        FlatMap { inner: self, next }
    }

    /// On failure, re-runs `recovery` on the original source and response.
    ///
    /// A recovered value surfaces as [`Error::Api`] carrying the decoded
    /// value and the original failure. When the recovery itself fails the
    /// original failure is returned unchanged.
    fn flat_map_error<R>(self, recovery: R) -> FlatMapError<Self, R>
    where
        Self::Source: Clone,
        R: ResultProcessor<Source = Self::Source>,
        R::Output: StdError + Send + Sync,
    {
        FlatMapError {
            inner: self,
            recovery,
        }
    }

    /// Runs this processor on `context` instead of the caller's task.
    fn dispatched(self, context: ExecutionContext) -> Dispatched<Self> {
        Dispatched {
            inner: Arc::new(self),
            context,
        }
    }

    /// Erases the processor's type.
    fn boxed(self) -> BoxResultProcessor<Self::Source, Self::Output> {
        Arc::new(self)
    }
}

impl<P: ResultProcessor> ResultProcessorExt for P {}

/// Passes the source through unchanged.
pub struct Identity<S> {
    _marker: PhantomData<fn() -> S>,
}

impl<S> Identity<S> {
    /// Creates the identity processor.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<S> Default for Identity<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for Identity<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Identity")
    }
}

#[async_trait]
impl<S: Send + 'static> ResultProcessor for Identity<S> {
    type Source = S;
    type Output = S;

    async fn process(&self, source: S, _response: Arc<ResponseHead>) -> Result<S> {
        Ok(source)
    }
}

/// See [`ResultProcessorExt::map`].
#[derive(Debug)]
pub struct Map<P, F> {
    inner: P,
    f: F,
}

#[async_trait]
impl<P, F, U> ResultProcessor for Map<P, F>
where
    P: ResultProcessor,
    F: Fn(P::Output) -> U + Send + Sync + 'static,
    U: Send + 'static,
{
    type Source = P::Source;
    type Output = U;

    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<U> {
        let value = self.inner.process(source, response).await?;
        Ok((self.f)(value))
    }
}

/// See [`ResultProcessorExt::try_map`].
#[derive(Debug)]
pub struct TryMap<P, F> {
    inner: P,
    f: F,
}

#[async_trait]
impl<P, F, U> ResultProcessor for TryMap<P, F>
where
    P: ResultProcessor,
    F: Fn(P::Output) -> Result<U> + Send + Sync + 'static,
    U: Send + 'static,
{
    type Source = P::Source;
    type Output = U;

    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<U> {
        let value = self.inner.process(source, response).await?;
        (self.f)(value)
    }
}

/// See [`ResultProcessorExt::flat_map`].
#[derive(Debug)]
pub struct FlatMap<P, N> {
    inner: P,
    next: N,
}

#[async_trait]
impl<P, N> ResultProcessor for FlatMap<P, N>
where
    P: ResultProcessor,
    N: ResultProcessor<Source = P::Output>,
{
    type Source = P::Source;
    type Output = N::Output;

    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<N::Output> {
        let intermediate = self.inner.process(source, Arc::clone(&response)).await?;
        self.next.process(intermediate, response).await
    }
}

/// See [`ResultProcessorExt::flat_map_error`].
#[derive(Debug)]
pub struct FlatMapError<P, R> {
    inner: P,
    recovery: R,
}

#[async_trait]
impl<P, R> ResultProcessor for FlatMapError<P, R>
where
    P: ResultProcessor,
    P::Source: Clone,
    R: ResultProcessor<Source = P::Source>,
    R::Output: StdError + Send + Sync,
{
    type Source = P::Source;
    type Output = P::Output;

    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<P::Output> {
        let upstream = match self.inner.process(source.clone(), Arc::clone(&response)).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        match self.recovery.process(source, response).await {
            Ok(api_error) => Err(Error::api(api_error, upstream)),
            Err(recovery_error) => {
                debug!(error = %recovery_error, "Error recovery did not apply");
                Err(upstream)
            }
        }
    }
}

/// Where a [`Dispatched`] processor runs.
#[derive(Debug, Clone, Default)]
pub enum ExecutionContext {
    /// On the task driving the operation.
    #[default]
    Inline,
    /// As a task spawned on the given runtime.
    Runtime(Handle),
    /// On the blocking thread pool, for CPU-heavy decoding.
    Blocking,
}

/// See [`ResultProcessorExt::dispatched`].
#[derive(Debug)]
pub struct Dispatched<P> {
    inner: Arc<P>,
    context: ExecutionContext,
}

#[async_trait]
impl<P: ResultProcessor> ResultProcessor for Dispatched<P> {
    type Source = P::Source;
    type Output = P::Output;

    async fn process(&self, source: Self::Source, response: Arc<ResponseHead>) -> Result<P::Output> {
        let inner = Arc::clone(&self.inner);
        let joined = match &self.context {
            ExecutionContext::Inline => return inner.process(source, response).await,
            ExecutionContext::Runtime(handle) => {
                handle
                    .spawn(async move { inner.process(source, response).await })
                    .await
            }
            ExecutionContext::Blocking => {
                let handle = Handle::current();
                tokio::task::spawn_blocking(move || handle.block_on(inner.process(source, response)))
                    .await
            }
        };
        joined.map_err(|e| Error::other(e).context("dispatched result processor did not complete"))?
    }
}

/// The source of a response with a success status, returned by [`Recover`]
/// for a response that did not fail.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("status {status} is not a failure, nothing to recover")]
pub struct NothingToRecover {
    /// The response status.
    pub status: u16,
}

/// Fails when the status is outside the accepted range.
///
/// The resulting [`StatusCodeMismatch`] carries the body for in-memory sources
/// and the response's `Retry-After` hint.
pub struct StatusCheck<S> {
    accepted: StatusRange,
    _marker: PhantomData<fn() -> S>,
}

impl<S> StatusCheck<S> {
    /// Accepts statuses in `accepted`.
    pub fn new(accepted: impl Into<StatusRange>) -> Self {
        Self {
            accepted: accepted.into(),
            _marker: PhantomData,
        }
    }
}

impl<S> Default for StatusCheck<S> {
    fn default() -> Self {
        Self::new(StatusRange::SUCCESS)
    }
}

impl<S> fmt::Debug for StatusCheck<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusCheck")
            .field("accepted", &self.accepted)
            .finish()
    }
}

#[async_trait]
impl<S: OperationSource> ResultProcessor for StatusCheck<S> {
    type Source = S;
    type Output = S;

    async fn process(&self, source: S, response: Arc<ResponseHead>) -> Result<S> {
        let actual = response.status.as_u16();
        if self.accepted.contains(actual) {
            return Ok(source);
        }
        Err(Error::UnexpectedStatusCode(Box::new(StatusCodeMismatch {
            expected: self.accepted,
            actual,
            body: source.body_bytes(),
            retry_after: response.retry_after(),
        })))
    }
}

/// Passes the source through only when the status is a failure.
///
/// Meant as the head of a [`ResultProcessorExt::flat_map_error`] recovery
/// that decodes an error document.
pub struct Recover<S> {
    success: StatusRange,
    _marker: PhantomData<fn() -> S>,
}

impl<S> Recover<S> {
    /// Treats statuses outside `success` as recoverable failures.
    pub fn new(success: impl Into<StatusRange>) -> Self {
        Self {
            success: success.into(),
            _marker: PhantomData,
        }
    }
}

impl<S> Default for Recover<S> {
    fn default() -> Self {
        Self::new(StatusRange::SUCCESS)
    }
}

impl<S> fmt::Debug for Recover<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recover").field("success", &self.success).finish()
    }
}

#[async_trait]
impl<S: Send + 'static> ResultProcessor for Recover<S> {
    type Source = S;
    type Output = S;

    async fn process(&self, source: S, response: Arc<ResponseHead>) -> Result<S> {
        let status = response.status.as_u16();
        if self.success.contains(status) {
            Err(Error::other(NothingToRecover { status }))
        } else {
            Ok(source)
        }
    }
}

/// No configured decoder understands the response's media type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("no decoder for media type '{media_type}'")]
pub struct NoMatchingDecoder {
    /// The response media type, empty when the header was missing.
    pub media_type: String,
}

/// Decodes a body with the first decoder that accepts its media type.
///
/// A response without `Content-Type` is handed to the first decoder.
/// Decode failures keep the raw body in [`Error::DataConversionFailed`].
pub struct Decode<T> {
    decoders: Vec<Arc<dyn Decoder<T>>>,
}

impl<T: 'static> Decode<T> {
    /// Decodes with `decoder`.
    pub fn new(decoder: impl Decoder<T> + 'static) -> Self {
        Self {
            decoders: vec![Arc::new(decoder)],
        }
    }

    /// Adds a fallback decoder, consulted after the existing ones.
    #[must_use]
    pub fn or(mut self, decoder: impl Decoder<T> + 'static) -> Self {
        self.decoders.push(Arc::new(decoder));
        self
    }

    fn select(&self, media_type: Option<&str>) -> Option<&Arc<dyn Decoder<T>>> {
        match media_type {
            Some(media_type) => self.decoders.iter().find(|d| d.can_decode(media_type)),
            None => self.decoders.first(),
        }
    }
}

impl<T: DeserializeOwned + 'static> Decode<T> {
    /// Decodes JSON bodies.
    pub fn json() -> Self {
        Self::new(JsonDecoder::new())
    }
}

impl<T> fmt::Debug for Decode<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Decode")
            .field("decoders", &self.decoders.len())
            .finish()
    }
}

#[async_trait]
impl<T: Send + 'static> ResultProcessor for Decode<T> {
    type Source = Bytes;
    type Output = T;

    async fn process(&self, body: Bytes, response: Arc<ResponseHead>) -> Result<T> {
        let media_type = response.media_type();
        let Some(decoder) = self.select(media_type.as_deref()) else {
            let underlying: BoxError = Box::new(NoMatchingDecoder {
                media_type: media_type.unwrap_or_default(),
            });
            return Err(Error::data_conversion(body, underlying));
        };
        let media_type = media_type.unwrap_or_default();
        match decoder.decode(&body, &media_type) {
            Ok(value) => Ok(value),
            Err(e) => Err(Error::data_conversion(body, e)),
        }
    }
}
