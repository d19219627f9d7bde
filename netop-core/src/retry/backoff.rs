//! The standard network retry policy.
//!
//! [`BackoffRetryProvider`] retries transient failures of idempotent requests
//! with full-jitter backoff: the delay before retry `n` (0-based) is drawn
//! uniformly from `[0, cap(n))`, where `cap` reads the backoff table and
//! clamps to its last entry.
//!
//! | retry | cap   |
//! |-------|-------|
//! | 0     | 1s    |
//! | 1     | 3s    |
//! | 2     | 15s   |
//! | 3     | 27s   |
//! | 4     | 42s   |
//! | 5     | 60s   |
//! | 6     | 1h    |
//! | 7+    | 6h    |

use crate::error::{ConfigValidationError, Error, ValidationResult};
use crate::events::{HostEventBus, ReachabilityMonitor};
use crate::operation::OperationId;
use crate::request::Request;
use crate::retry::helper::{
    ReachabilityRetryHelper, RetryHelper, SiblingSuccessRetryHelper, TimerRetryHelper,
};
use crate::retry::provider::{OperationContext, RetryDecision, RetryProvider};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default backoff caps in milliseconds.
pub const DEFAULT_BACKOFF_TABLE_MS: [u64; 8] = [
    1_000, 3_000, 15_000, 27_000, 42_000, 60_000, 3_600_000, 21_600_000,
];

/// Upper bound accepted by [`RetryConfig::validate`] for `max_retries`.
pub const MAX_RETRIES_LIMIT: u32 = 20;

/// Configuration of the standard retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries granted per operation before the policy gives up.
    pub max_retries: u32,
    /// Backoff caps in milliseconds, indexed by retry number.
    pub backoff_table_ms: Vec<u64>,
    /// Whether non-idempotent methods (POST, PATCH, ...) may be retried.
    pub allow_non_idempotent: bool,
    /// Whether to retry connection, DNS, TLS and I/O failures.
    pub retry_on_network_error: bool,
    /// Whether to retry timeouts (transport timeouts and HTTP 408).
    pub retry_on_timeout: bool,
    /// Whether to retry 5xx responses.
    pub retry_on_server_error: bool,
    /// Whether to retry 429 responses.
    pub retry_on_rate_limit: bool,
    /// Draw the delay from `[0, cap)` instead of waiting the full cap.
    pub jitter: bool,
    /// Arm a helper that retries as soon as the host becomes reachable.
    pub retry_on_reachability: bool,
    /// Arm a helper that retries as soon as a sibling request to the host succeeds.
    pub retry_on_sibling_success: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 7,
            backoff_table_ms: DEFAULT_BACKOFF_TABLE_MS.to_vec(),
            allow_non_idempotent: false,
            retry_on_network_error: true,
            retry_on_timeout: true,
            retry_on_server_error: true,
            retry_on_rate_limit: true,
            jitter: true,
            retry_on_reachability: true,
            retry_on_sibling_success: true,
        }
    }
}

impl RetryConfig {
    /// Few retries with short waits; transport failures only.
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            backoff_table_ms: vec![1_000, 3_000],
            retry_on_server_error: false,
            retry_on_timeout: false,
            ..Self::default()
        }
    }

    /// More retries; also retries non-idempotent requests.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 10,
            allow_non_idempotent: true,
            ..Self::default()
        }
    }

    /// Disables the policy entirely.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Validates the retry configuration.
    ///
    /// # Validation Rules
    ///
    /// - `max_retries` must be <= 20
    /// - `backoff_table_ms` must be non-empty and non-decreasing
    ///
    /// ```rust
    /// use netop_core::retry::RetryConfig;
    ///
    /// assert!(RetryConfig::default().validate().is_ok());
    ///
    /// let invalid = RetryConfig {
    ///     backoff_table_ms: vec![5_000, 1_000],
    ///     ..Default::default()
    /// };
    /// assert!(invalid.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<ValidationResult, ConfigValidationError> {
        let mut result = ValidationResult::new();

        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(ConfigValidationError::too_high(
                "max_retries",
                self.max_retries,
                MAX_RETRIES_LIMIT,
            ));
        }
        if self.backoff_table_ms.is_empty() {
            return Err(ConfigValidationError::invalid(
                "backoff_table_ms",
                "table must not be empty",
            ));
        }
        if self.backoff_table_ms.windows(2).any(|w| w[1] < w[0]) {
            return Err(ConfigValidationError::invalid(
                "backoff_table_ms",
                "entries must be non-decreasing",
            ));
        }
        if self.backoff_table_ms.first() == Some(&0) {
            result.add_warning("backoff_table_ms starts at 0, first retry is immediate");
        }
        if self.allow_non_idempotent {
            result.add_warning("non-idempotent requests may be sent more than once");
        }
        Ok(result)
    }

    /// Backoff cap for retry `index` (0-based), clamped to the last entry.
    pub fn backoff_cap(&self, index: u32) -> Duration {
        let table = &self.backoff_table_ms;
        let slot = usize::try_from(index)
            .unwrap_or(usize::MAX)
            .min(table.len().saturating_sub(1));
        Duration::from_millis(table.get(slot).copied().unwrap_or(0))
    }

    /// Realized delay for retry `index`, with `retry_after` as a floor.
    pub fn delay_for(&self, index: u32, retry_after: Option<Duration>) -> Duration {
        let cap = self.backoff_cap(index);
        let delay = if self.jitter {
            jitter_below(cap)
        } else {
            cap
        };
        match retry_after {
            Some(floor) => delay.max(floor),
            None => delay,
        }
    }

    /// Whether `error` is a transient failure this configuration retries.
    pub fn is_retryable(&self, error: &Error) -> bool {
        if error.is_cancelled() {
            return false;
        }
        if error.is_timeout() {
            return self.retry_on_timeout;
        }
        if error.is_network() {
            return self.retry_on_network_error;
        }
        match error.as_unexpected_status().map(|m| m.actual) {
            Some(429) => self.retry_on_rate_limit,
            Some(408) => self.retry_on_timeout,
            Some(status) if (500..600).contains(&status) => self.retry_on_server_error,
            _ => false,
        }
    }
}

/// Uniform draw from `[0, cap)`; zero for a zero cap.
fn jitter_below(cap: Duration) -> Duration {
    let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
    if cap_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::rngs::ThreadRng::default();
    Duration::from_millis(rng.random_range(0..cap_ms))
}

/// The standard network retry policy.
///
/// Per-operation retry counters are keyed by [`OperationId`] and released
/// when the operation finishes.
pub struct BackoffRetryProvider {
    config: RetryConfig,
    counters: DashMap<OperationId, u32>,
    reachability: Option<Arc<dyn ReachabilityMonitor>>,
    success_bus: Option<Arc<HostEventBus>>,
}

impl BackoffRetryProvider {
    /// Creates the provider with no event sources.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            counters: DashMap::new(),
            reachability: None,
            success_bus: None,
        }
    }

    /// Arms reachability helpers backed by `monitor`.
    #[must_use]
    pub fn with_reachability(mut self, monitor: Arc<dyn ReachabilityMonitor>) -> Self {
        self.reachability = Some(monitor);
        self
    }

    /// Arms sibling-success helpers listening on `bus`.
    #[must_use]
    pub fn with_success_bus(mut self, bus: Arc<HostEventBus>) -> Self {
        self.success_bus = Some(bus);
        self
    }

    /// The policy's configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries granted so far to operation `id`.
    pub fn retries_granted(&self, id: OperationId) -> u32 {
        self.counters.get(&id).map_or(0, |c| *c)
    }

    /// Claims the next retry index for `id`, or `None` when exhausted.
    fn claim_retry(&self, id: OperationId) -> Option<u32> {
        let mut counter = self.counters.entry(id).or_insert(0);
        if *counter >= self.config.max_retries {
            return None;
        }
        let index = *counter;
        *counter += 1;
        Some(index)
    }

    fn helpers_for(&self, request: &Request, delay: Duration) -> Vec<Box<dyn RetryHelper>> {
        let mut helpers: Vec<Box<dyn RetryHelper>> = vec![Box::new(TimerRetryHelper::new(delay))];
        let Some(host) = request.host() else {
            return helpers;
        };
        if self.config.retry_on_reachability
            && let Some(monitor) = &self.reachability
        {
            helpers.push(Box::new(ReachabilityRetryHelper::new(Arc::clone(monitor), host)));
        }
        if self.config.retry_on_sibling_success
            && let Some(bus) = &self.success_bus
        {
            helpers.push(Box::new(SiblingSuccessRetryHelper::new(Arc::clone(bus), host)));
        }
        helpers
    }
}

impl fmt::Debug for BackoffRetryProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffRetryProvider")
            .field("config", &self.config)
            .field("tracked_operations", &self.counters.len())
            .field("reachability", &self.reachability.is_some())
            .field("success_bus", &self.success_bus.is_some())
            .finish()
    }
}

impl RetryProvider for BackoffRetryProvider {
    fn decide(&self, request: &Request, error: &Error, operation: &OperationContext) -> RetryDecision {
        if operation.cancelled || !self.config.is_retryable(error) {
            return RetryDecision::Defer;
        }
        if !request.is_idempotent() && !self.config.allow_non_idempotent {
            debug!(
                operation_id = %operation.id,
                method = %request.method,
                "Not retrying non-idempotent request"
            );
            return RetryDecision::Defer;
        }
        let Some(index) = self.claim_retry(operation.id) else {
            debug!(
                operation_id = %operation.id,
                max_retries = self.config.max_retries,
                "Retry budget exhausted"
            );
            return RetryDecision::Defer;
        };

        let delay = self.config.delay_for(index, error.retry_after());
        warn!(
            operation_id = %operation.id,
            attempt = operation.attempts,
            retry = index + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            cause = %error.root_cause(),
            "Retrying after transient failure"
        );
        RetryDecision::Retry(self.helpers_for(request, delay))
    }

    fn operation_finished(&self, id: OperationId) {
        self.counters.remove(&id);
    }
}
