//! Operations: one logical request/response exchange across any number of
//! attempts.
//!
//! ```text
//! Created ──start──▶ RunningAttempt ──success──▶ Succeeded
//!                      │      ▲
//!              failure │      │ first helper fires
//!                      ▼      │
//!                    AwaitingRetry
//!                      │
//!        stop / no decision ──▶ Failed
//!
//! any state ──cancel──▶ Cancelled (unless already terminal)
//! ```
//!
//! The result slot is written exactly once; terminal states are absorbing.

mod builder;
mod inner;
mod source;

pub use builder::OperationBuilder;
pub use source::OperationSource;

use crate::error::{Error, Result};
use crate::request::{Request, ResponseHead};
use crate::transport::Transport;
use bytes::Bytes;
use inner::Inner;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique, monotonically increasing operation identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Allocates the next identity.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw value.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationState {
    /// Built but not started.
    Created,
    /// An attempt is being prepared, transported or processed.
    RunningAttempt,
    /// Waiting for a retry helper to fire.
    AwaitingRetry,
    /// Finished with a value.
    Succeeded,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl OperationState {
    /// Whether the state is absorbing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Cancelled
        )
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationState::Created => "created",
            OperationState::RunningAttempt => "running",
            OperationState::AwaitingRetry => "awaiting-retry",
            OperationState::Succeeded => "succeeded",
            OperationState::Failed => "failed",
            OperationState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Everything a successful operation produced.
#[derive(Debug)]
pub struct OperationOutcome<T> {
    /// The request as sent on the successful attempt.
    pub request: Request,
    /// Response metadata of the successful attempt.
    pub response: Arc<ResponseHead>,
    /// The result processor's output.
    pub value: T,
}

/// Shared, immutable view of an operation's result.
pub type OperationResult<T> = Arc<Result<OperationOutcome<T>>>;

/// A cancellable, retryable network operation.
///
/// `S` is what the transport delivers ([`Bytes`] for in-memory operations,
/// [`PathBuf`] for downloads) and `T` is the result processor's output.
/// Cloning yields another handle to the same operation. Once started, an
/// operation runs until it reaches a terminal state even if every handle is
/// dropped; use [`Operation::cancel`] to stop it.
pub struct Operation<S: OperationSource, T: Send + Sync + 'static> {
    inner: Arc<Inner<S, T>>,
}

impl<S: OperationSource, T: Send + Sync + 'static> Clone for Operation<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Operation<Bytes, Bytes> {
    /// Starts building an in-memory operation. The default result processor
    /// returns the raw body.
    pub fn builder(request: Request, transport: Arc<dyn Transport>) -> OperationBuilder<Bytes, Bytes> {
        OperationBuilder::new(request, transport)
    }
}

impl Operation<PathBuf, PathBuf> {
    /// Starts building an operation that downloads the body to `path`.
    pub fn download(
        request: Request,
        path: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
    ) -> OperationBuilder<PathBuf, PathBuf> {
        OperationBuilder::download(request, path.into(), transport)
    }
}

impl<S: OperationSource, T: Send + Sync + 'static> Operation<S, T> {
    pub(crate) fn from_inner(inner: Arc<Inner<S, T>>) -> Self {
        Self { inner }
    }

    /// The operation's identity.
    pub fn id(&self) -> OperationId {
        self.inner.id()
    }

    /// Starts the first attempt. Has no effect unless the operation is
    /// [`OperationState::Created`].
    pub fn start(&self) {
        self.inner.start();
    }

    /// Cancels the operation.
    ///
    /// Idempotent and non-blocking. Unless a result was already published
    /// the result becomes [`Error::Cancelled`], the in-flight attempt is
    /// cancelled and every armed retry helper is torn down.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Current lifecycle state.
    pub fn state(&self) -> OperationState {
        self.inner.state()
    }

    /// Whether the operation reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Attempts started so far.
    pub fn attempt_count(&self) -> u32 {
        self.inner.attempt_count()
    }

    /// The request the operation was built with.
    pub fn original_request(&self) -> &Request {
        self.inner.original_request()
    }

    /// The request as transformed for the latest attempt, once one was sent.
    pub fn current_request(&self) -> Option<Request> {
        self.inner.current_request()
    }

    /// The published result, or [`Error::NotFinished`] while running.
    pub fn result(&self) -> OperationResult<T> {
        self.inner
            .result()
            .unwrap_or_else(|| Arc::new(Err(Error::NotFinished)))
    }

    /// Waits until the operation finishes and returns its result.
    pub async fn wait(&self) -> OperationResult<T> {
        self.inner.wait_finished().await;
        self.result()
    }

    /// Registers a callback run once with the result.
    ///
    /// Runs immediately on the calling thread if the operation already
    /// finished, otherwise on whichever thread publishes the result.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(OperationResult<T>) + Send + 'static,
    {
        self.inner.on_complete(Box::new(callback));
    }
}

impl<S: OperationSource, T: Send + Sync + 'static> fmt::Debug for Operation<S, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("attempts", &self.attempt_count())
            .field("method", &self.original_request().method)
            .field("url", &self.original_request().url.as_str())
            .finish()
    }
}
