//! Retry providers: the chain consulted after every failed attempt.

use crate::error::Error;
use crate::operation::OperationId;
use crate::request::Request;
use crate::retry::helper::RetryHelper;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A provider's answer for one failure.
pub enum RetryDecision {
    /// No opinion; ask the next provider.
    Defer,
    /// Do not retry. Authoritative: later providers are not consulted.
    Stop,
    /// Retry once any of these helpers fires.
    Retry(Vec<Box<dyn RetryHelper>>),
}

impl RetryDecision {
    /// Whether this is [`RetryDecision::Retry`].
    pub fn is_retry(&self) -> bool {
        matches!(self, RetryDecision::Retry(_))
    }

    /// Whether this is [`RetryDecision::Stop`].
    pub fn is_stop(&self) -> bool {
        matches!(self, RetryDecision::Stop)
    }
}

impl fmt::Debug for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDecision::Defer => f.write_str("Defer"),
            RetryDecision::Stop => f.write_str("Stop"),
            RetryDecision::Retry(helpers) => f
                .debug_tuple("Retry")
                .field(&helpers.iter().map(|h| h.name()).collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// What a provider may know about the operation asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationContext {
    /// The operation's identity; key per-operation state by it.
    pub id: OperationId,
    /// Attempts made so far, including the failed one.
    pub attempts: u32,
    /// Whether the operation has been cancelled.
    pub cancelled: bool,
}

/// Decides whether a failed attempt is retried.
pub trait RetryProvider: Send + Sync {
    /// Returns the decision for `error`, raised by an attempt of `request`.
    fn decide(&self, request: &Request, error: &Error, operation: &OperationContext) -> RetryDecision;

    /// Called once when the operation reaches a terminal state.
    fn operation_finished(&self, _id: OperationId) {}
}

/// Shared handle to a retry provider.
pub type SharedRetryProvider = Arc<dyn RetryProvider>;

/// Consults providers in order. The first non-deferring answer wins; an
/// exhausted chain is a stop.
pub(crate) fn run_retry_providers(
    providers: &[SharedRetryProvider],
    request: &Request,
    error: &Error,
    operation: &OperationContext,
) -> RetryDecision {
    for (index, provider) in providers.iter().enumerate() {
        match provider.decide(request, error, operation) {
            RetryDecision::Defer => {}
            decision => {
                debug!(operation_id = %operation.id, index, decision = ?decision, "Retry provider decided");
                return decision;
            }
        }
    }
    RetryDecision::Stop
}

/// Vetoes retries of cancelled operations and cancellation errors.
#[derive(Debug, Default, Clone, Copy)]
pub struct CancellationRetryProvider;

impl RetryProvider for CancellationRetryProvider {
    fn decide(&self, _request: &Request, error: &Error, operation: &OperationContext) -> RetryDecision {
        if operation.cancelled || error.is_cancelled() {
            RetryDecision::Stop
        } else {
            RetryDecision::Defer
        }
    }
}

#[derive(Debug, Clone)]
enum StatusRule {
    StopOn(HashSet<u16>),
    RetryOnly(HashSet<u16>),
}

/// Stops on failures carrying particular status codes.
///
/// Failures without a status code are deferred.
#[derive(Debug, Clone)]
pub struct StatusCodeRetryProvider {
    rule: StatusRule,
}

impl StatusCodeRetryProvider {
    /// Stops when the status is one of `codes`.
    pub fn stop_on(codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            rule: StatusRule::StopOn(codes.into_iter().collect()),
        }
    }

    /// Stops when the status is anything but one of `codes`.
    pub fn retry_only(codes: impl IntoIterator<Item = u16>) -> Self {
        Self {
            rule: StatusRule::RetryOnly(codes.into_iter().collect()),
        }
    }
}

impl RetryProvider for StatusCodeRetryProvider {
    fn decide(&self, _request: &Request, error: &Error, _operation: &OperationContext) -> RetryDecision {
        let Some(mismatch) = error.as_unexpected_status() else {
            return RetryDecision::Defer;
        };
        let stop = match &self.rule {
            StatusRule::StopOn(codes) => codes.contains(&mismatch.actual),
            StatusRule::RetryOnly(codes) => !codes.contains(&mismatch.actual),
        };
        if stop {
            RetryDecision::Stop
        } else {
            RetryDecision::Defer
        }
    }
}

type ErrorPredicate = Box<dyn Fn(&Error) -> bool + Send + Sync>;

/// Stops on failures matching a predicate.
pub struct ErrorFilterRetryProvider {
    name: &'static str,
    predicate: ErrorPredicate,
}

impl ErrorFilterRetryProvider {
    /// Stops whenever `predicate` returns `true`.
    pub fn new<F>(name: &'static str, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        Self {
            name,
            predicate: Box::new(predicate),
        }
    }

    /// Stops on decode failures: the same bytes would fail again.
    pub fn unretryable_decode() -> Self {
        Self::new("unretryable-decode", |error| error.as_data_conversion().is_some())
    }

    /// Stops on transport contract violations.
    pub fn broken_contract() -> Self {
        Self::new("broken-contract", Error::is_broken_contract)
    }
}

impl fmt::Debug for ErrorFilterRetryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorFilterRetryProvider")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RetryProvider for ErrorFilterRetryProvider {
    fn decide(&self, _request: &Request, error: &Error, _operation: &OperationContext) -> RetryDecision {
        if (self.predicate)(error) {
            RetryDecision::Stop
        } else {
            RetryDecision::Defer
        }
    }
}
