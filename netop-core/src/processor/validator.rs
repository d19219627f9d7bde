//! Response validators: synchronous checks over response metadata.

use crate::codec::Decoder;
use crate::error::{Error, Result, StatusCodeMismatch};
use crate::request::{ResponseHead, StatusRange};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Checks response metadata as soon as the status line and headers arrive.
///
/// Validators run in declared order and the first failure short-circuits.
/// A rejection lets the transport skip the body download.
pub trait ResponseValidator: Send + Sync {
    /// Returns an error to reject the response.
    fn validate(&self, response: &ResponseHead) -> Result<()>;
}

/// Shared handle to a response validator.
pub type SharedResponseValidator = Arc<dyn ResponseValidator>;

/// Runs the chain, wrapping the first failure as [`Error::ResponseValidator`].
pub(crate) fn run_response_validators(
    validators: &[SharedResponseValidator],
    response: &ResponseHead,
) -> Result<()> {
    for (index, validator) in validators.iter().enumerate() {
        if let Err(e) = validator.validate(response) {
            debug!(index, status = response.status.as_u16(), error = %e, "Response rejected");
            return Err(Error::ResponseValidator(Box::new(e)));
        }
    }
    Ok(())
}

/// Adapts a closure into a [`ResponseValidator`].
pub struct FnResponseValidator<F>(F);

/// Creates a response validator from a closure.
pub fn response_validator_fn<F>(f: F) -> FnResponseValidator<F>
where
    F: Fn(&ResponseHead) -> Result<()> + Send + Sync,
{
    FnResponseValidator(f)
}

impl<F> fmt::Debug for FnResponseValidator<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnResponseValidator")
    }
}

impl<F> ResponseValidator for FnResponseValidator<F>
where
    F: Fn(&ResponseHead) -> Result<()> + Send + Sync,
{
    fn validate(&self, response: &ResponseHead) -> Result<()> {
        (self.0)(response)
    }
}

/// Rejects responses whose status falls outside an accepted range.
///
/// The body is not available at this point, so the resulting
/// [`StatusCodeMismatch`] carries none. `Retry-After` is captured when present.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusCodeValidator {
    accepted: StatusRange,
}

impl StatusCodeValidator {
    /// Accepts statuses in `accepted`.
    pub fn new(accepted: impl Into<StatusRange>) -> Self {
        Self {
            accepted: accepted.into(),
        }
    }
}

impl ResponseValidator for StatusCodeValidator {
    fn validate(&self, response: &ResponseHead) -> Result<()> {
        let actual = response.status.as_u16();
        if self.accepted.contains(actual) {
            return Ok(());
        }
        Err(Error::UnexpectedStatusCode(Box::new(StatusCodeMismatch {
            expected: self.accepted,
            actual,
            body: None,
            retry_after: response.retry_after(),
        })))
    }
}

/// A response media type no configured decoder understands.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unsupported media type: {}", .media_type.as_deref().unwrap_or("<missing>"))]
pub struct UnsupportedMediaType {
    /// The received media type, if the header was present.
    pub media_type: Option<String>,
}

type MediaTypePredicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// Rejects responses whose `Content-Type` cannot be decoded.
pub struct ContentTypeValidator {
    accepts: MediaTypePredicate,
    allow_missing: bool,
}

impl ContentTypeValidator {
    /// Accepts exactly the listed media types (compared case-insensitively).
    pub fn accepting<I, S>(media_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let accepted: Vec<String> = media_types
            .into_iter()
            .map(|m| m.into().to_ascii_lowercase())
            .collect();
        Self {
            accepts: Box::new(move |media_type| accepted.iter().any(|m| m == media_type)),
            allow_missing: false,
        }
    }

    /// Accepts whatever `decoder` reports it can decode.
    pub fn for_decoder<T, D>(decoder: D) -> Self
    where
        T: 'static,
        D: Decoder<T> + 'static,
    {
        Self {
            accepts: Box::new(move |media_type| decoder.can_decode(media_type)),
            allow_missing: false,
        }
    }

    /// Lets responses without a `Content-Type` header through.
    #[must_use]
    pub fn allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }
}

impl fmt::Debug for ContentTypeValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentTypeValidator")
            .field("allow_missing", &self.allow_missing)
            .finish_non_exhaustive()
    }
}

impl ResponseValidator for ContentTypeValidator {
    fn validate(&self, response: &ResponseHead) -> Result<()> {
        match response.media_type() {
            Some(media_type) if (self.accepts)(&media_type) => Ok(()),
            None if self.allow_missing => Ok(()),
            media_type => Err(Error::other(UnsupportedMediaType { media_type })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonDecoder;
    use http::StatusCode;
    use http::header::{CONTENT_TYPE, RETRY_AFTER};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use url::Url;

    fn head(status: StatusCode) -> ResponseHead {
        ResponseHead::new(Url::parse("https://example.com/a").unwrap(), status)
    }

    #[test]
    fn test_status_validator_accepts_range() {
        let validator = StatusCodeValidator::default();
        assert!(validator.validate(&head(StatusCode::OK)).is_ok());
        assert!(validator.validate(&head(StatusCode::FOUND)).is_ok());

        let err = validator.validate(&head(StatusCode::NOT_FOUND)).unwrap_err();
        let mismatch = err.as_unexpected_status().unwrap();
        assert_eq!(mismatch.actual, 404);
        assert_eq!(mismatch.expected, StatusRange::SUCCESS);
        assert!(mismatch.body.is_none());
    }

    #[test]
    fn test_status_validator_captures_retry_after() {
        let response = head(StatusCode::SERVICE_UNAVAILABLE).with_header(RETRY_AFTER, "7");
        let err = StatusCodeValidator::new(200..300).validate(&response).unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_chain_short_circuits_on_first_failure() {
        let later = Arc::new(AtomicU32::new(0));
        let later_clone = Arc::clone(&later);
        let validators: Vec<SharedResponseValidator> = vec![
            Arc::new(StatusCodeValidator::new(200..300)),
            Arc::new(response_validator_fn(move |_| {
                later_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })),
        ];

        let err = run_response_validators(&validators, &head(StatusCode::BAD_GATEWAY)).unwrap_err();
        assert!(matches!(err, Error::ResponseValidator(_)));
        assert_eq!(err.as_unexpected_status().unwrap().actual, 502);
        assert_eq!(later.load(Ordering::SeqCst), 0);

        run_response_validators(&validators, &head(StatusCode::OK)).unwrap();
        assert_eq!(later.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_content_type_for_decoder() {
        let validator = ContentTypeValidator::for_decoder(JsonDecoder::<serde_json::Value>::new());

        let json = head(StatusCode::OK).with_header(CONTENT_TYPE, "application/json; charset=utf-8");
        assert!(validator.validate(&json).is_ok());

        let html = head(StatusCode::OK).with_header(CONTENT_TYPE, "text/html");
        let err = validator.validate(&html).unwrap_err();
        assert_eq!(
            err.downcast_other::<UnsupportedMediaType>().unwrap().media_type.as_deref(),
            Some("text/html")
        );
    }

    #[test]
    fn test_content_type_missing_header() {
        let strict = ContentTypeValidator::accepting(["Text/Plain"]);
        assert!(strict.validate(&head(StatusCode::OK)).is_err());

        let lenient = ContentTypeValidator::accepting(["text/plain"]).allow_missing(true);
        assert!(lenient.validate(&head(StatusCode::OK)).is_ok());

        let text = head(StatusCode::OK).with_header(CONTENT_TYPE, "text/plain");
        assert!(strict.validate(&text).is_ok());
    }
}
