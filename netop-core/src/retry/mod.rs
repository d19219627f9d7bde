//! Retry orchestration.
//!
//! After a failed attempt the operation consults its [`RetryProvider`] chain.
//! The first provider that does not defer decides: [`RetryDecision::Stop`]
//! ends the operation, [`RetryDecision::Retry`] hands over the
//! [`RetryHelper`]s whose first firing starts the next attempt.

mod backoff;
mod helper;
mod provider;

pub use backoff::{BackoffRetryProvider, DEFAULT_BACKOFF_TABLE_MS, MAX_RETRIES_LIMIT, RetryConfig};
pub use helper::{
    ReachabilityRetryHelper, RetryHelper, RetryTarget, RetryTrigger, SiblingSuccessRetryHelper,
    TimerRetryHelper,
};
pub use provider::{
    CancellationRetryProvider, ErrorFilterRetryProvider, OperationContext, RetryDecision,
    RetryProvider, SharedRetryProvider, StatusCodeRetryProvider,
};

pub(crate) use provider::run_retry_providers;
