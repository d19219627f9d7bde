//! Host-keyed one-shot event signalling.
//!
//! [`HostEventBus`] carries "something happened for host X" notifications:
//! a sibling operation succeeded, or the network became reachable again.
//! Callbacks are one-shot: `publish` removes every callback registered for
//! the host and invokes them outside the bus lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::trace;

/// One-shot callback invoked when an event is published for its host.
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// Identifies a subscription so it can be removed before it fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    host: String,
    id: u64,
}

impl SubscriptionHandle {
    /// The host this subscription listens to.
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Typed pub/sub keyed by host name.
#[derive(Default)]
pub struct HostEventBus {
    subscribers: Mutex<HashMap<String, HashMap<u64, EventCallback>>>,
    next_id: AtomicU64,
}

impl HostEventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` to run once on the next event for `host`.
    pub fn subscribe(&self, host: &str, callback: EventCallback) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers
            .entry(host.to_ascii_lowercase())
            .or_default()
            .insert(id, callback);
        trace!(host, id, "Subscribed to host events");
        SubscriptionHandle {
            host: host.to_ascii_lowercase(),
            id,
        }
    }

    /// Removes a subscription. Returns `false` if it already fired or was removed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let Some(callbacks) = subscribers.get_mut(&handle.host) else {
            return false;
        };
        let removed = callbacks.remove(&handle.id).is_some();
        if callbacks.is_empty() {
            subscribers.remove(&handle.host);
        }
        removed
    }

    /// Fires and removes every callback registered for `host`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn publish(&self, host: &str) -> usize {
        let callbacks = {
            let mut subscribers = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            subscribers.remove(&host.to_ascii_lowercase())
        };
        let Some(callbacks) = callbacks else {
            return 0;
        };
        let count = callbacks.len();
        trace!(host, count, "Publishing host event");
        for (_, callback) in callbacks {
            callback();
        }
        count
    }

    /// Number of pending callbacks for `host`.
    pub fn subscriber_count(&self, host: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&host.to_ascii_lowercase())
            .map_or(0, HashMap::len)
    }
}

impl fmt::Debug for HostEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hosts = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("HostEventBus").field("hosts", &hosts).finish()
    }
}

/// Source of "host became reachable" notifications.
///
/// Detection itself is platform specific and lives outside this crate; the
/// engine only consumes this subscribe/notify contract.
pub trait ReachabilityMonitor: Send + Sync {
    /// Whether `host` is currently believed to be reachable.
    fn is_reachable(&self, host: &str) -> bool;

    /// Registers a one-shot callback for the next time `host` becomes reachable.
    fn subscribe(&self, host: &str, callback: EventCallback) -> SubscriptionHandle;

    /// Removes a pending subscription.
    fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// A [`ReachabilityMonitor`] driven by explicit calls, e.g. from a platform
/// network-change hook or from tests.
#[derive(Debug, Default)]
pub struct ManualReachability {
    bus: HostEventBus,
    unreachable: Mutex<HashSet<String>>,
}

impl ManualReachability {
    /// Creates a monitor that considers every host reachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the reachability of `host`, notifying subscribers when it
    /// becomes reachable.
    pub fn set_reachable(&self, host: &str, reachable: bool) {
        let host = host.to_ascii_lowercase();
        let changed = {
            let mut unreachable = self
                .unreachable
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if reachable {
                unreachable.remove(&host)
            } else {
                unreachable.insert(host.clone());
                false
            }
        };
        if changed {
            self.bus.publish(&host);
        }
    }

    /// Number of callbacks waiting for `host` to become reachable.
    pub fn subscriber_count(&self, host: &str) -> usize {
        self.bus.subscriber_count(host)
    }
}

impl ReachabilityMonitor for ManualReachability {
    fn is_reachable(&self, host: &str) -> bool {
        !self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&host.to_ascii_lowercase())
    }

    fn subscribe(&self, host: &str, callback: EventCallback) -> SubscriptionHandle {
        self.bus.subscribe(host, callback)
    }

    fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.bus.unsubscribe(handle);
    }
}
