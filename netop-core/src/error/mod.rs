//! # Error Handling for netop
//!
//! Every failure an [`Operation`](crate::operation::Operation) can publish is an
//! [`Error`]. Failures are wrapped at the boundary of the stage that produced
//! them, so retry providers and callers can tell "failed while preparing the
//! request" from "failed while validating the response" from "failed while
//! transporting or decoding" without losing the original cause.
//!
//! ## Error Hierarchy
//!
//! ```text
//! Error
//! ├── NotFinished             - lifecycle sentinel, result slot not yet written
//! ├── Cancelled               - lifecycle sentinel, operation cancelled
//! ├── RequestProcessor        - wraps a request processor failure
//! ├── ResponseValidator       - wraps a response validator failure
//! ├── ResultProcessor         - wraps a result processor failure
//! ├── UnexpectedStatusCode    - protocol-level validation failure
//! ├── DataConversionFailed    - decode failure, keeps the raw body
//! ├── BrokenTransportContract - transport produced neither or both outcomes
//! ├── Transport               - network/transport errors (via TransportError)
//! ├── Api                     - decoded API error, keeps the upstream failure
//! ├── Config                  - invalid configuration
//! ├── InvalidRequest          - malformed request input
//! ├── Other                   - opaque error from user code
//! └── Context                 - error with additional context
//! ```
//!
//! ## Unwrapping Without Knowing the Depth
//!
//! ```rust
//! use netop_core::error::Error;
//! use netop_core::request::StatusRange;
//!
//! let err = Error::ResultProcessor(Box::new(
//!     Error::unexpected_status(StatusRange::SUCCESS, 404, None).context("decoding user"),
//! ));
//!
//! let status = err.as_unexpected_status().unwrap();
//! assert_eq!(status.actual, 404);
//! ```

mod config;
mod context;
mod convert;
mod transport;

use crate::request::StatusRange;
use bytes::Bytes;
use std::borrow::Cow;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

pub use config::{ConfigValidationError, ValidationResult};
pub use context::ContextExt;
pub use transport::TransportError;

/// Result type alias for all netop operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed, thread-safe error used for opaque causes.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// The pipeline stage whose boundary wrapped an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Preparing the outgoing request.
    RequestProcessing,
    /// Validating the received response metadata.
    ResponseValidation,
    /// Turning the received body into the typed result.
    ResultProcessing,
}

/// A response whose status code fell outside the accepted range.
#[derive(Error, Debug, Clone)]
#[error("status {actual} outside expected range {expected}")]
pub struct StatusCodeMismatch {
    /// The accepted range.
    pub expected: StatusRange,
    /// The status code actually received.
    pub actual: u16,
    /// Response body, when it was retrieved before validation failed.
    pub body: Option<Bytes>,
    /// Server-provided `Retry-After` hint, if any.
    pub retry_after: Option<Duration>,
}

/// A body that could not be converted into the requested type.
#[derive(Error, Debug)]
#[error("{} bytes could not be decoded", .body.len())]
pub struct DataConversionError {
    /// The original bytes, kept for diagnostics.
    pub body: Bytes,
    /// The decoder's error.
    #[source]
    pub underlying: BoxError,
}

/// The primary error type for netop.
///
/// Large variants are boxed to keep the enum small.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The operation has not reached a terminal state yet.
    #[error("Operation not finished")]
    NotFinished,

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// A request processor failed.
    #[error("Request processor failed")]
    RequestProcessor(#[source] Box<Error>),

    /// A response validator rejected the response.
    #[error("Response validation failed")]
    ResponseValidator(#[source] Box<Error>),

    /// The result processor pipeline failed.
    #[error("Result processing failed")]
    ResultProcessor(#[source] Box<Error>),

    /// The response status code was not acceptable.
    #[error("Unexpected status code: {0}")]
    UnexpectedStatusCode(Box<StatusCodeMismatch>),

    /// The response body could not be decoded.
    #[error("Data conversion failed")]
    DataConversionFailed(#[source] Box<DataConversionError>),

    /// The transport produced neither or both of a response and an error.
    #[error("Broken transport contract: {0}")]
    BrokenTransportContract(Cow<'static, str>),

    /// Network or transport level failure.
    #[error(transparent)]
    Transport(Box<TransportError>),

    /// A structured API error recovered from a failed response body.
    #[error("API error: {error}")]
    Api {
        /// The decoded API error.
        error: BoxError,
        /// The failure that triggered the recovery.
        #[source]
        upstream: Box<Error>,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),

    /// Malformed request input.
    #[error("Invalid request: {0}")]
    InvalidRequest(Cow<'static, str>),

    /// Opaque error raised by user-supplied code.
    #[error("{0}")]
    Other(#[source] BoxError),

    /// Error with additional context, preserving the error chain.
    #[error("{context}")]
    Context {
        /// Context message describing what failed
        context: String,
        /// The underlying error
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    // ==================== Constructor Methods ====================

    /// Creates the cancellation error.
    pub fn cancelled() -> Self {
        Self::Cancelled
    }

    /// Creates an unexpected status code error.
    pub fn unexpected_status(expected: StatusRange, actual: u16, body: Option<Bytes>) -> Self {
        Self::UnexpectedStatusCode(Box::new(StatusCodeMismatch {
            expected,
            actual,
            body,
            retry_after: None,
        }))
    }

    /// Creates a data conversion error keeping the original body.
    pub fn data_conversion(body: Bytes, underlying: impl Into<BoxError>) -> Self {
        Self::DataConversionFailed(Box::new(DataConversionError {
            body,
            underlying: underlying.into(),
        }))
    }

    /// Creates a broken transport contract error.
    pub fn broken_contract(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::BrokenTransportContract(msg.into())
    }

    /// Creates a connection-failed transport error from a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(Box::new(TransportError::ConnectionFailed(msg.into())))
    }

    /// Creates a transport timeout error.
    pub fn timeout() -> Self {
        Self::Transport(Box::new(TransportError::Timeout))
    }

    /// Creates an invalid request error.
    pub fn invalid_request(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Wraps an arbitrary error raised by user code.
    pub fn other(err: impl Into<BoxError>) -> Self {
        Self::Other(err.into())
    }

    /// Wraps a decoded API error together with the failure it was recovered from.
    pub fn api(error: impl Into<BoxError>, upstream: Error) -> Self {
        Self::Api {
            error: error.into(),
            upstream: Box::new(upstream),
        }
    }

    // ==================== Context Methods ====================

    /// Attaches context to an existing error.
    ///
    /// ```rust
    /// use netop_core::error::Error;
    ///
    /// let err = Error::transport("Connection refused").context("Failed to fetch user");
    /// assert!(err.as_transport().is_some());
    /// ```
    #[must_use]
    pub fn context(self, context: impl Into<String>) -> Self {
        Self::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    // ==================== Chain Traversal Methods ====================

    /// Iterates the chain, penetrating context layers and stage wrappers.
    fn iter_chain(&self) -> impl Iterator<Item = &Error> {
        std::iter::successors(Some(self), |err| match err {
            Error::Context { source, .. }
            | Error::RequestProcessor(source)
            | Error::ResponseValidator(source)
            | Error::ResultProcessor(source) => Some(source.as_ref()),
            _ => None,
        })
    }

    /// Returns the innermost error, skipping context layers and stage wrappers.
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        self.iter_chain().last().unwrap_or(self)
    }

    /// Finds a specific error variant in the chain.
    pub fn find_variant<F>(&self, matcher: F) -> Option<&Error>
    where
        F: Fn(&Error) -> bool,
    {
        self.iter_chain().find(|e| matcher(e))
    }

    /// Returns the outermost stage that wrapped this error.
    #[must_use]
    pub fn stage(&self) -> Option<Stage> {
        self.iter_chain().find_map(|err| match err {
            Error::RequestProcessor(_) => Some(Stage::RequestProcessing),
            Error::ResponseValidator(_) => Some(Stage::ResponseValidation),
            Error::ResultProcessor(_) => Some(Stage::ResultProcessing),
            _ => None,
        })
    }

    /// Generates a report with the full `source()` chain.
    #[must_use]
    pub fn report(&self) -> String {
        use std::fmt::Write;
        let mut report = self.to_string();

        let mut current: Option<&(dyn StdError + 'static)> = self.source();
        while let Some(err) = current {
            let _ = write!(report, "\nCaused by: {err}");
            current = err.source();
        }
        report
    }

    // ==================== Helper Methods (Wrapper Penetrating) ====================

    /// Checks whether this is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.iter_chain().any(|e| matches!(e, Error::Cancelled))
    }

    /// Checks whether this is the "not finished" sentinel.
    #[must_use]
    pub fn is_not_finished(&self) -> bool {
        matches!(self.root_cause(), Error::NotFinished)
    }

    /// Checks whether the transport broke its completion contract.
    #[must_use]
    pub fn is_broken_contract(&self) -> bool {
        self.iter_chain()
            .any(|e| matches!(e, Error::BrokenTransportContract(_)))
    }

    /// Returns the transport error, if any.
    #[must_use]
    pub fn as_transport(&self) -> Option<&TransportError> {
        self.iter_chain().find_map(|e| match e {
            Error::Transport(te) => Some(te.as_ref()),
            _ => None,
        })
    }

    /// Checks whether this is a network-class transport failure.
    #[must_use]
    pub fn is_network(&self) -> bool {
        self.as_transport().is_some_and(TransportError::is_network)
    }

    /// Checks whether this is a transport timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self.as_transport(), Some(TransportError::Timeout))
    }

    /// Returns the status code mismatch, if any.
    #[must_use]
    pub fn as_unexpected_status(&self) -> Option<&StatusCodeMismatch> {
        self.iter_chain().find_map(|e| match e {
            Error::UnexpectedStatusCode(mismatch) => Some(mismatch.as_ref()),
            Error::Api { upstream, .. } => upstream.as_unexpected_status(),
            _ => None,
        })
    }

    /// Returns the data conversion failure, if any.
    #[must_use]
    pub fn as_data_conversion(&self) -> Option<&DataConversionError> {
        self.iter_chain().find_map(|e| match e {
            Error::DataConversionFailed(details) => Some(details.as_ref()),
            _ => None,
        })
    }

    /// Returns the decoded API error if it is of type `E`.
    #[must_use]
    pub fn api_error<E: StdError + 'static>(&self) -> Option<&E> {
        self.iter_chain().find_map(|e| match e {
            Error::Api { error, .. } => error.downcast_ref::<E>(),
            _ => None,
        })
    }

    /// Returns the failure an API error was recovered from.
    #[must_use]
    pub fn upstream(&self) -> Option<&Error> {
        self.iter_chain().find_map(|e| match e {
            Error::Api { upstream, .. } => Some(upstream.as_ref()),
            _ => None,
        })
    }

    /// Returns the server's `Retry-After` hint, if the failure carried one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        self.as_unexpected_status().and_then(|m| m.retry_after)
    }

    /// Attempts to downcast an opaque user error to a specific type.
    #[must_use]
    pub fn downcast_other<T: StdError + 'static>(&self) -> Option<&T> {
        self.iter_chain().find_map(|e| match e {
            Error::Other(inner) => inner.downcast_ref::<T>(),
            _ => None,
        })
    }
}
