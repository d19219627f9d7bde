//! Transport-level error types.

use std::error::Error as StdError;
use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a transport for a single attempt.
///
/// Third-party client errors are folded into these variants so the public
/// API does not expose the underlying HTTP library.
///
/// # Network-class errors
///
/// Everything except [`TransportError::Cancelled`] and
/// [`TransportError::Destination`] is considered a network-class failure and
/// is eligible for the backoff retry policy.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    /// The attempt timed out.
    #[error("Request timeout")]
    Timeout,

    /// Connection could not be established or was dropped.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// DNS resolution failed.
    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),

    /// TLS handshake or certificate failure.
    #[error("TLS error: {0}")]
    Tls(String),

    /// The transport aborted the attempt because it was cancelled.
    #[error("Attempt cancelled")]
    Cancelled,

    /// I/O failure on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The download destination could not be written. Local, so never
    /// retried by the network policy.
    #[error("Cannot write download to {}", .path.display())]
    Destination {
        /// The destination file.
        path: PathBuf,
        /// The file system error.
        #[source]
        source: std::io::Error,
    },

    /// Opaque transport failure.
    #[error("Transport failure")]
    Other(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

impl TransportError {
    /// Returns `true` for failures the network retry policy may retry.
    #[must_use]
    pub fn is_network(&self) -> bool {
        !matches!(
            self,
            TransportError::Cancelled | TransportError::Destination { .. }
        )
    }

    /// Wraps a file system error raised while writing `path`.
    pub fn destination(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransportError::Destination {
            path: path.into(),
            source,
        }
    }
}
