//! `reqwest`-backed transport.

use crate::error::{Error, Result, TransportError};
use crate::request::{Request, ResponseHead};
use crate::transport::{AttemptEvents, AttemptHandle, BodyDisposition, Destination, Transport};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

/// Client settings for [`ReqwestTransport`].
#[derive(Debug, Clone)]
pub struct ReqwestConfig {
    /// Whole-request timeout, used when the request sets none.
    pub timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    /// Idle keep-alive connections kept per host.
    pub pool_max_idle_per_host: usize,
    /// How long idle connections stay pooled.
    pub pool_idle_timeout: Duration,
    /// `User-Agent` header value.
    pub user_agent: String,
}

impl Default for ReqwestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
            user_agent: format!("{}/{}", crate::NAME, crate::VERSION),
        }
    }
}

/// A [`Transport`] driving a shared `reqwest::Client`.
///
/// Each attempt runs as a task on the captured runtime. In-memory bodies are
/// streamed chunk by chunk into the attempt sink; file destinations are
/// written with `tokio::fs`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    runtime: Handle,
}

impl ReqwestTransport {
    /// Builds a client from `config` and captures the current runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a Tokio runtime or when the client cannot
    /// be built.
    pub fn new(config: &ReqwestConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .gzip(true)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| Error::from(TransportError::from(e)).context("Failed to build HTTP client"))?;
        let runtime = Handle::try_current()
            .map_err(|e| Error::other(e).context("ReqwestTransport requires a Tokio runtime"))?;
        Ok(Self { client, runtime })
    }

    /// Wraps an existing client; attempts run on `runtime`.
    pub fn with_client(client: reqwest::Client, runtime: Handle) -> Self {
        Self { client, runtime }
    }
}

struct CancelOnRequest(CancellationToken);

impl AttemptHandle for CancelOnRequest {
    fn cancel(&self) {
        self.0.cancel();
    }
}

impl Transport for ReqwestTransport {
    fn attempt(
        &self,
        request: Request,
        destination: Destination,
        events: AttemptEvents,
    ) -> Box<dyn AttemptHandle> {
        let token = CancellationToken::new();
        let child = token.clone();
        let client = self.client.clone();
        let span = info_span!(
            "reqwest_attempt",
            generation = events.generation(),
            method = %request.method,
            url = %request.url
        );

        self.runtime.spawn(
            async move {
                let mut events = events;
                let outcome = tokio::select! {
                    biased;
                    () = child.cancelled() => Err(TransportError::Cancelled),
                    result = exchange(&client, request, &destination, &mut events) => result,
                };
                match outcome {
                    Ok(location) => events.finish(location),
                    Err(e) => {
                        debug!(error = %e, "Attempt failed");
                        events.fail(e.into());
                    }
                }
            }
            .instrument(span),
        );

        Box::new(CancelOnRequest(token))
    }
}

async fn exchange(
    client: &reqwest::Client,
    request: Request,
    destination: &Destination,
    events: &mut AttemptEvents,
) -> std::result::Result<Option<PathBuf>, TransportError> {
    let mut builder = client
        .request(request.method, request.url)
        .headers(request.headers);
    if let Some(body) = request.body {
        builder = builder.body(body);
    }
    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }

    let response = builder.send().await?;
    let mut head = ResponseHead::new(response.url().clone(), response.status());
    head.headers = response.headers().clone();
    head.content_length = response.content_length();

    if events.response(head) == BodyDisposition::Skip {
        debug!(status = response.status().as_u16(), "Body skipped after rejection");
        return Ok(None);
    }

    let mut stream = response.bytes_stream();
    match destination {
        Destination::Memory => {
            while let Some(chunk) = stream.next().await {
                events.data(&chunk?);
            }
            Ok(None)
        }
        Destination::File(path) => {
            let local = |e: std::io::Error| TransportError::destination(path, e);
            let mut file = tokio::fs::File::create(path).await.map_err(local)?;
            let mut written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await.map_err(local)?;
                written = written.saturating_add(chunk.len() as u64);
            }
            file.flush().await.map_err(local)?;
            if written == 0 {
                warn!(path = %path.display(), "Downloaded an empty body");
            }
            Ok(Some(path.clone()))
        }
    }
}
