//! Retry helpers: triggerable wait conditions armed between attempts.
//!
//! Every helper of a retry decision is armed at once. The first one to fire
//! asks the operation to retry; the operation then tears down all of them
//! (including the one that fired) before the next attempt starts.

use crate::events::{HostEventBus, ReachabilityMonitor, SubscriptionHandle};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Receiver of retry requests, implemented by operations.
pub trait RetryTarget: Send + Sync {
    /// Requests the retry armed for `wait_id`. Stale ids are ignored.
    fn retry_now(&self, wait_id: u64);
}

/// Handle a helper uses to request the retry it was armed for.
///
/// Holds the operation weakly, so a pending helper never keeps a finished
/// or dropped operation alive. Firing more than once, or after the wait is
/// over, is harmless.
#[derive(Clone)]
pub struct RetryTrigger {
    target: Weak<dyn RetryTarget>,
    wait_id: u64,
}

impl RetryTrigger {
    /// Creates a trigger for the wait identified by `wait_id`.
    pub fn new(target: Weak<dyn RetryTarget>, wait_id: u64) -> Self {
        Self { target, wait_id }
    }

    /// Requests the retry. Returns `false` if the operation is gone.
    pub fn fire(&self) -> bool {
        match self.target.upgrade() {
            Some(target) => {
                target.retry_now(self.wait_id);
                true
            }
            None => false,
        }
    }

    /// The wait this trigger belongs to.
    pub fn wait_id(&self) -> u64 {
        self.wait_id
    }
}

impl fmt::Debug for RetryTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTrigger")
            .field("wait_id", &self.wait_id)
            .finish_non_exhaustive()
    }
}

/// An independent condition that can end a retry wait early.
///
/// `teardown` must be safe to call whether or not the helper fired, and
/// must stop any future firing.
pub trait RetryHelper: Send {
    /// Arms the helper. `runtime` runs any background work it needs.
    fn setup(&mut self, trigger: RetryTrigger, runtime: &Handle);

    /// Disarms the helper and releases its resources.
    fn teardown(&mut self);

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Fires once after a fixed delay.
#[derive(Debug)]
pub struct TimerRetryHelper {
    delay: Duration,
    cancel_token: Option<CancellationToken>,
}

impl TimerRetryHelper {
    /// Creates a timer firing after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            cancel_token: None,
        }
    }

    /// The configured delay.
    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl RetryHelper for TimerRetryHelper {
    fn setup(&mut self, trigger: RetryTrigger, runtime: &Handle) {
        let token = CancellationToken::new();
        let child = token.clone();
        let delay = self.delay;
        runtime.spawn(async move {
            tokio::select! {
                biased;
                () = child.cancelled() => {
                    trace!("Retry timer cancelled");
                }
                () = tokio::time::sleep(delay) => {
                    trigger.fire();
                }
            }
        });
        self.cancel_token = Some(token);
    }

    fn teardown(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
    }

    fn name(&self) -> &'static str {
        "timer"
    }
}

impl Drop for TimerRetryHelper {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Fires when the request's host becomes reachable again.
pub struct ReachabilityRetryHelper {
    monitor: Arc<dyn ReachabilityMonitor>,
    host: String,
    subscription: Option<SubscriptionHandle>,
}

impl ReachabilityRetryHelper {
    /// Creates a helper watching `host`.
    pub fn new(monitor: Arc<dyn ReachabilityMonitor>, host: impl Into<String>) -> Self {
        Self {
            monitor,
            host: host.into(),
            subscription: None,
        }
    }
}

impl fmt::Debug for ReachabilityRetryHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachabilityRetryHelper")
            .field("host", &self.host)
            .field("armed", &self.subscription.is_some())
            .finish()
    }
}

impl RetryHelper for ReachabilityRetryHelper {
    fn setup(&mut self, trigger: RetryTrigger, _runtime: &Handle) {
        let handle = self.monitor.subscribe(
            &self.host,
            Box::new(move || {
                trigger.fire();
            }),
        );
        self.subscription = Some(handle);
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.subscription.take() {
            self.monitor.unsubscribe(&handle);
        }
    }

    fn name(&self) -> &'static str {
        "reachability"
    }
}

/// Fires when another operation to the same host succeeds.
pub struct SiblingSuccessRetryHelper {
    bus: Arc<HostEventBus>,
    host: String,
    subscription: Option<SubscriptionHandle>,
}

impl SiblingSuccessRetryHelper {
    /// Creates a helper listening on `bus` for successes against `host`.
    pub fn new(bus: Arc<HostEventBus>, host: impl Into<String>) -> Self {
        Self {
            bus,
            host: host.into(),
            subscription: None,
        }
    }
}

impl fmt::Debug for SiblingSuccessRetryHelper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiblingSuccessRetryHelper")
            .field("host", &self.host)
            .field("armed", &self.subscription.is_some())
            .finish()
    }
}

impl RetryHelper for SiblingSuccessRetryHelper {
    fn setup(&mut self, trigger: RetryTrigger, _runtime: &Handle) {
        let handle = self.bus.subscribe(
            &self.host,
            Box::new(move || {
                trigger.fire();
            }),
        );
        self.subscription = Some(handle);
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.subscription.take() {
            self.bus.unsubscribe(&handle);
        }
    }

    fn name(&self) -> &'static str {
        "sibling-success"
    }
}
