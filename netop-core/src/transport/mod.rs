//! The transport contract.
//!
//! A [`Transport`] performs exactly one network exchange per call to
//! [`Transport::attempt`] and reports what happened through the owned
//! [`AttemptEvents`] sink it receives. The sink enforces the completion
//! contract: an attempt ends with either a response (plus body or file
//! location) or an error. Reporting neither, both, or dropping the sink
//! without completing yields [`Error::BrokenTransportContract`].
//!
//! Validators run inside [`AttemptEvents::response`] as soon as the head is
//! known, so the transport can skip downloading the body of a rejected
//! response.

#[cfg(feature = "reqwest")]
mod reqwest;

#[cfg(feature = "reqwest")]
pub use self::reqwest::{ReqwestConfig, ReqwestTransport};

use crate::error::{Error, Result};
use crate::processor::{SharedResponseValidator, run_response_validators};
use crate::request::{Request, ResponseHead};
use bytes::{Bytes, BytesMut};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, trace};

/// Where the transport should put the response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Stream chunks into the sink with [`AttemptEvents::data`].
    Memory,
    /// Write the body to this path and report it on completion.
    File(PathBuf),
}

/// Whether the transport should keep retrieving the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyDisposition {
    /// Retrieve the body.
    Continue,
    /// A validator rejected the response; the body is not needed.
    Skip,
}

/// Everything a transport reports at once, for clients that only produce a
/// complete outcome.
#[derive(Debug, Default)]
pub struct Completion {
    /// Response metadata.
    pub response: Option<ResponseHead>,
    /// In-memory body.
    pub body: Option<Bytes>,
    /// File the body was written to.
    pub location: Option<PathBuf>,
    /// Transport failure.
    pub error: Option<Error>,
}

/// Cancels an in-flight attempt.
pub trait AttemptHandle: Send + Sync {
    /// Requests cancellation. The transport may still report afterwards; the
    /// operation ignores it.
    fn cancel(&self);
}

/// A client able to perform single network attempts.
pub trait Transport: Send + Sync {
    /// Starts one attempt and returns immediately.
    fn attempt(
        &self,
        request: Request,
        destination: Destination,
        events: AttemptEvents,
    ) -> Box<dyn AttemptHandle>;
}

/// Data of a successful attempt.
#[derive(Debug, Clone)]
pub(crate) struct AttemptOutput {
    pub(crate) response: Arc<ResponseHead>,
    pub(crate) body: Bytes,
    pub(crate) location: Option<PathBuf>,
}

pub(crate) type AttemptSink = Box<dyn FnOnce(Result<AttemptOutput>) + Send + 'static>;

/// Owned per-attempt event sink handed to the transport.
///
/// Tagged with the attempt generation it belongs to; once the operation has
/// moved on, anything reported through an older sink is ignored.
pub struct AttemptEvents {
    generation: u64,
    validators: Arc<[SharedResponseValidator]>,
    max_presized_body: usize,
    response: Option<Arc<ResponseHead>>,
    validation_error: Option<Error>,
    body: BytesMut,
    sink: Option<AttemptSink>,
}

impl AttemptEvents {
    pub(crate) fn new(
        generation: u64,
        validators: Arc<[SharedResponseValidator]>,
        max_presized_body: usize,
        sink: AttemptSink,
    ) -> Self {
        Self {
            generation,
            validators,
            max_presized_body,
            response: None,
            validation_error: None,
            body: BytesMut::new(),
            sink: Some(sink),
        }
    }

    /// The attempt generation this sink reports for.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytes received so far through [`AttemptEvents::data`].
    pub fn received_bytes(&self) -> usize {
        self.body.len()
    }

    /// Reports the response head and runs the validators.
    ///
    /// Pre-sizes the body buffer when the announced length fits under the
    /// configured cap.
    pub fn response(&mut self, head: ResponseHead) -> BodyDisposition {
        if self.response.is_some() {
            debug!(generation = self.generation, "Transport reported a second response head");
            // A broken contract outranks any earlier validator rejection.
            self.validation_error = Some(Error::broken_contract(
                "transport reported more than one response",
            ));
            return BodyDisposition::Skip;
        }

        let verdict = run_response_validators(&self.validators, &head);
        if let Some(len) = head.content_length
            && let Ok(len) = usize::try_from(len)
            && len <= self.max_presized_body
            && verdict.is_ok()
        {
            self.body.reserve(len);
        }
        self.response = Some(Arc::new(head));

        match verdict {
            Ok(()) => BodyDisposition::Continue,
            Err(e) => {
                self.validation_error = Some(e);
                BodyDisposition::Skip
            }
        }
    }

    /// Appends a body chunk. Ignored after a validator rejected the response.
    pub fn data(&mut self, chunk: &[u8]) {
        if self.validation_error.is_none() {
            self.body.extend_from_slice(chunk);
        }
    }

    /// Completes the attempt successfully; `location` names the downloaded
    /// file for [`Destination::File`].
    pub fn finish(mut self, location: Option<PathBuf>) {
        let outcome = match self.response.take() {
            Some(response) => Ok(AttemptOutput {
                response,
                body: std::mem::take(&mut self.body).freeze(),
                location,
            }),
            None => Err(Error::broken_contract(
                "transport finished without reporting a response",
            )),
        };
        self.deliver(outcome);
    }

    /// Completes the attempt with a transport failure.
    pub fn fail(mut self, error: Error) {
        self.deliver(Err(error));
    }

    /// Completes the attempt from a single combined report.
    ///
    /// Exactly one of a response (with body or location) and an error must be
    /// present. The contract is checked before any validator sees the head.
    pub fn complete(mut self, completion: Completion) {
        let Completion {
            response,
            body,
            location,
            error,
        } = completion;

        let has_response = response.is_some() || self.response.is_some();
        let outcome = match (has_response, error) {
            (true, Some(_)) => Error::broken_contract(
                "transport reported both a response and an error",
            ),
            (false, None) => Error::broken_contract(
                "transport reported neither a response nor an error",
            ),
            (false, Some(error)) => error,
            (true, None) => {
                if let Some(head) = response {
                    self.response(head);
                }
                if let Some(body) = body {
                    self.data(&body);
                }
                self.finish(location);
                return;
            }
        };
        self.validation_error = None;
        self.deliver(Err(outcome));
    }

    fn deliver(&mut self, outcome: Result<AttemptOutput>) {
        let Some(sink) = self.sink.take() else {
            return;
        };
        // A validator rejection decides the attempt whatever the transport says next.
        let outcome = match self.validation_error.take() {
            Some(rejection) => Err(rejection),
            None => outcome,
        };
        trace!(generation = self.generation, ok = outcome.is_ok(), "Attempt completed");
        sink(outcome);
    }
}

impl Drop for AttemptEvents {
    fn drop(&mut self) {
        if self.sink.is_some() {
            debug!(generation = self.generation, "Transport dropped an attempt without completing it");
            self.validation_error = None;
            self.deliver(Err(Error::broken_contract(
                "transport dropped the attempt without completing it",
            )));
        }
    }
}

impl fmt::Debug for AttemptEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttemptEvents")
            .field("generation", &self.generation)
            .field("response", &self.response.as_ref().map(|r| r.status))
            .field("received_bytes", &self.body.len())
            .field("rejected", &self.validation_error.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::StatusCodeValidator;
    use http::StatusCode;
    use std::sync::Mutex;
    use url::Url;

    type Captured = Arc<Mutex<Option<Result<AttemptOutput>>>>;

    fn events(validators: Vec<SharedResponseValidator>) -> (AttemptEvents, Captured) {
        let captured: Captured = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&captured);
        let events = AttemptEvents::new(
            1,
            validators.into(),
            1024,
            Box::new(move |outcome| {
                *slot.lock().unwrap() = Some(outcome);
            }),
        );
        (events, captured)
    }

    fn head(status: StatusCode) -> ResponseHead {
        ResponseHead::new(Url::parse("https://example.com").unwrap(), status)
    }

    fn take(captured: &Captured) -> Result<AttemptOutput> {
        captured.lock().unwrap().take().expect("attempt was not reported")
    }

    #[test]
    fn test_streamed_success() {
        let (mut events, captured) = events(Vec::new());
        let mut response = head(StatusCode::OK);
        response.content_length = Some(6);
        assert_eq!(events.response(response), BodyDisposition::Continue);
        assert!(events.body.capacity() >= 6);
        events.data(b"hel");
        events.data(b"lo!");
        events.finish(None);

        let output = take(&captured).unwrap();
        assert_eq!(&output.body[..], b"hello!");
        assert_eq!(output.response.status, StatusCode::OK);
    }

    #[test]
    fn test_oversized_length_is_not_presized() {
        let (mut events, _captured) = events(Vec::new());
        let mut response = head(StatusCode::OK);
        response.content_length = Some(1_000_000);
        events.response(response);
        assert!(events.body.capacity() < 1_000_000);
        events.fail(Error::timeout());
    }

    #[test]
    fn test_validator_rejection_skips_body_and_wins() {
        let (mut events, captured) = events(vec![Arc::new(StatusCodeValidator::new(200..300))]);
        assert_eq!(events.response(head(StatusCode::NOT_FOUND)), BodyDisposition::Skip);
        events.data(b"ignored");
        events.fail(Error::timeout());

        let err = take(&captured).unwrap_err();
        assert!(matches!(err, Error::ResponseValidator(_)));
        assert_eq!(err.as_unexpected_status().unwrap().actual, 404);
    }

    #[test]
    fn test_complete_with_neither_is_broken() {
        let (events, captured) = events(Vec::new());
        events.complete(Completion::default());
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }

    #[test]
    fn test_complete_with_both_is_broken() {
        let (events, captured) = events(Vec::new());
        events.complete(Completion {
            response: Some(head(StatusCode::OK)),
            body: Some(Bytes::from_static(b"{}")),
            error: Some(Error::timeout()),
            ..Default::default()
        });
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }

    #[test]
    fn test_complete_with_both_outranks_validator_rejection() {
        let (events, captured) = events(vec![Arc::new(StatusCodeValidator::default())]);
        events.complete(Completion {
            response: Some(head(StatusCode::NOT_FOUND)),
            body: Some(Bytes::from_static(b"missing")),
            error: Some(Error::timeout()),
            ..Default::default()
        });

        let err = take(&captured).unwrap_err();
        assert!(err.is_broken_contract(), "unexpected error: {err}");
        assert!(err.as_unexpected_status().is_none());
    }

    #[test]
    fn test_complete_after_streamed_head_with_error_is_broken() {
        let (mut events, captured) = events(vec![Arc::new(StatusCodeValidator::default())]);
        assert_eq!(events.response(head(StatusCode::NOT_FOUND)), BodyDisposition::Skip);
        events.complete(Completion {
            error: Some(Error::timeout()),
            ..Default::default()
        });
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }

    #[test]
    fn test_complete_with_rejected_response() {
        let (events, captured) = events(vec![Arc::new(StatusCodeValidator::default())]);
        events.complete(Completion {
            response: Some(head(StatusCode::NOT_FOUND)),
            body: Some(Bytes::from_static(b"missing")),
            ..Default::default()
        });
        let err = take(&captured).unwrap_err();
        assert_eq!(err.as_unexpected_status().unwrap().actual, 404);
    }

    #[test]
    fn test_complete_with_response() {
        let (events, captured) = events(Vec::new());
        events.complete(Completion {
            response: Some(head(StatusCode::OK)),
            body: Some(Bytes::from_static(b"{}")),
            ..Default::default()
        });
        assert_eq!(&take(&captured).unwrap().body[..], b"{}");
    }

    #[test]
    fn test_finish_without_response_is_broken() {
        let (events, captured) = events(Vec::new());
        events.finish(None);
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }

    #[test]
    fn test_drop_without_completion_is_broken() {
        let (events, captured) = events(Vec::new());
        drop(events);
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }

    #[test]
    fn test_second_head_outranks_validator_rejection() {
        let (mut events, captured) = events(vec![Arc::new(StatusCodeValidator::default())]);
        assert_eq!(events.response(head(StatusCode::NOT_FOUND)), BodyDisposition::Skip);
        assert_eq!(events.response(head(StatusCode::OK)), BodyDisposition::Skip);
        events.finish(None);
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }

    #[test]
    fn test_second_head_is_broken() {
        let (mut events, captured) = events(Vec::new());
        events.response(head(StatusCode::OK));
        assert_eq!(events.response(head(StatusCode::OK)), BodyDisposition::Skip);
        events.finish(None);
        assert!(take(&captured).unwrap_err().is_broken_contract());
    }
}
