//! Engine configuration injected into every operation.

use crate::error::{ConfigValidationError, ValidationResult};
use crate::events::{HostEventBus, ReachabilityMonitor};
use crate::retry::{
    BackoffRetryProvider, CancellationRetryProvider, ErrorFilterRetryProvider, RetryConfig,
    SharedRetryProvider,
};
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;

/// Default cap for pre-sizing in-memory bodies from `Content-Length`.
pub const DEFAULT_MAX_PRESIZED_BODY: usize = 10 * 1024 * 1024;

/// Shared settings for operations.
///
/// Build one per client and clone it into every operation; the event bus and
/// reachability monitor are shared through `Arc`s so sibling operations see
/// each other.
#[derive(Clone)]
pub struct EngineConfig {
    /// Standard retry policy settings.
    pub retry: RetryConfig,
    /// Largest announced body length the engine pre-allocates for.
    pub max_presized_body: usize,
    /// Runtime operations spawn their work on. Defaults to the runtime
    /// current when the operation is built.
    pub runtime: Option<Handle>,
    /// Bus on which successful operations announce their host.
    pub success_bus: Option<Arc<HostEventBus>>,
    /// Network reachability source for early retries.
    pub reachability: Option<Arc<dyn ReachabilityMonitor>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            max_presized_body: DEFAULT_MAX_PRESIZED_BODY,
            runtime: None,
            success_bus: None,
            reachability: None,
        }
    }
}

impl EngineConfig {
    /// Replaces the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the runtime operations spawn on.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Shares a success bus between operations.
    pub fn with_success_bus(mut self, bus: Arc<HostEventBus>) -> Self {
        self.success_bus = Some(bus);
        self
    }

    /// Enables reachability-triggered retries.
    pub fn with_reachability(mut self, monitor: Arc<dyn ReachabilityMonitor>) -> Self {
        self.reachability = Some(monitor);
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<ValidationResult, ConfigValidationError> {
        let mut result = self.retry.validate()?;
        if self.max_presized_body == 0 {
            result.add_warning("max_presized_body is 0; bodies are never pre-sized");
        }
        if self.retry.retry_on_sibling_success && self.success_bus.is_none() {
            result.add_warning("retry_on_sibling_success has no effect without a success bus");
        }
        if self.retry.retry_on_reachability && self.reachability.is_none() {
            result.add_warning("retry_on_reachability has no effect without a reachability monitor");
        }
        Ok(result)
    }

    /// The standard retry chain: cancellation veto, unretryable decode veto,
    /// then the backoff policy.
    pub fn default_retry_providers(&self) -> Vec<SharedRetryProvider> {
        let mut backoff = BackoffRetryProvider::new(self.retry.clone());
        if let Some(monitor) = &self.reachability {
            backoff = backoff.with_reachability(Arc::clone(monitor));
        }
        if let Some(bus) = &self.success_bus {
            backoff = backoff.with_success_bus(Arc::clone(bus));
        }
        vec![
            Arc::new(CancellationRetryProvider),
            Arc::new(ErrorFilterRetryProvider::unretryable_decode()),
            Arc::new(backoff),
        ]
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("retry", &self.retry)
            .field("max_presized_body", &self.max_presized_body)
            .field("runtime", &self.runtime.is_some())
            .field("success_bus", &self.success_bus.is_some())
            .field("reachability", &self.reachability.is_some())
            .finish()
    }
}
