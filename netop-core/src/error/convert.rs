//! From implementations for converting between error types.

use crate::error::{Error, TransportError};

/// Maximum length for error messages taken from third-party errors.
pub(crate) const MAX_ERROR_MESSAGE_LEN: usize = 1024;

/// Truncates a message to [`MAX_ERROR_MESSAGE_LEN`], marking the cut.
pub(crate) fn truncate_message(mut msg: String) -> String {
    if msg.len() > MAX_ERROR_MESSAGE_LEN {
        let mut cut = MAX_ERROR_MESSAGE_LEN;
        while !msg.is_char_boundary(cut) {
            cut -= 1;
        }
        msg.truncate(cut);
        msg.push_str("... (truncated)");
    }
    msg
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Cancelled => Error::Cancelled,
            other => Error::Transport(Box::new(other)),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::from(TransportError::Io(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Other(Box::new(e))
    }
}

#[cfg(feature = "reqwest")]
impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        use std::error::Error as _;

        if e.is_timeout() {
            return TransportError::Timeout;
        }
        if e.is_connect() {
            let message = truncate_message(e.to_string());
            let mut source = e.source();
            while let Some(inner) = source {
                let text = inner.to_string().to_lowercase();
                if text.contains("dns") || text.contains("resolve") {
                    return TransportError::DnsResolution(message);
                }
                if text.contains("certificate") || text.contains("tls") {
                    return TransportError::Tls(message);
                }
                source = inner.source();
            }
            return TransportError::ConnectionFailed(message);
        }
        TransportError::Other(Box::new(e))
    }
}
