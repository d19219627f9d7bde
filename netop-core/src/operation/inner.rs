//! The operation state machine.
//!
//! All bookkeeping lives in one [`Core`] behind one mutex. Critical sections
//! only read and write fields; request processors, transports, result
//! processors, retry providers, helper setup/teardown and user callbacks all
//! run with the lock released.
//!
//! Attempts carry a generation number and retry waits a wait id. Anything
//! reported for an older generation or wait is ignored, which is what makes
//! late transport callbacks and concurrently firing helpers harmless.

use crate::error::{Error, Result};
use crate::events::HostEventBus;
use crate::operation::source::OperationSource;
use crate::operation::{OperationId, OperationOutcome, OperationResult, OperationState};
use crate::processor::{
    BoxResultProcessor, SharedRequestProcessor, SharedResponseValidator, run_request_processors,
};
use crate::request::Request;
use crate::retry::{
    OperationContext, RetryDecision, RetryHelper, RetryTarget, RetryTrigger, SharedRetryProvider,
    run_retry_providers,
};
use crate::transport::{AttemptEvents, AttemptHandle, AttemptOutput, Destination, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{Instrument, Span, debug, error, info, info_span, instrument, trace};

pub(crate) type CompletionCallback<T> = Box<dyn FnOnce(OperationResult<T>) + Send + 'static>;

/// Everything [`Inner`] is built from.
pub(crate) struct Parts<S, T> {
    pub(crate) request: Request,
    pub(crate) destination: Destination,
    pub(crate) request_processors: Vec<SharedRequestProcessor>,
    pub(crate) validators: Vec<SharedResponseValidator>,
    pub(crate) result_processor: BoxResultProcessor<S, T>,
    pub(crate) retry_providers: Vec<SharedRetryProvider>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) runtime: Handle,
    pub(crate) success_bus: Option<Arc<HostEventBus>>,
    pub(crate) max_presized_body: usize,
}

struct Core<T> {
    phase: OperationState,
    generation: u64,
    attempts: u32,
    /// The current attempt already delivered its outcome.
    reported: bool,
    current_request: Option<Request>,
    in_flight: Option<Box<dyn AttemptHandle>>,
    wait_id: u64,
    /// Helpers of the current wait are being set up outside the lock.
    arming: bool,
    /// A helper fired while arming.
    pending_retry: bool,
    helpers: Vec<Box<dyn RetryHelper>>,
    result: Option<OperationResult<T>>,
    callbacks: Vec<CompletionCallback<T>>,
}

pub(crate) struct Inner<S, T> {
    id: OperationId,
    original_request: Request,
    destination: Destination,
    request_processors: Vec<SharedRequestProcessor>,
    validators: Arc<[SharedResponseValidator]>,
    result_processor: BoxResultProcessor<S, T>,
    retry_providers: Vec<SharedRetryProvider>,
    transport: Arc<dyn Transport>,
    runtime: Handle,
    success_bus: Option<Arc<HostEventBus>>,
    max_presized_body: usize,
    cancelled: AtomicBool,
    finished: watch::Sender<bool>,
    weak_self: Weak<Inner<S, T>>,
    /// Held from `start` until `finish`: a started operation runs to its
    /// terminal result even after every handle is dropped.
    keep_alive: Mutex<Option<Arc<Inner<S, T>>>>,
    core: Mutex<Core<T>>,
}

impl<S: OperationSource, T: Send + Sync + 'static> Inner<S, T> {
    pub(crate) fn new(parts: Parts<S, T>) -> Arc<Self> {
        let (finished, _) = watch::channel(false);
        Arc::new_cyclic(|weak_self| Self {
            id: OperationId::next(),
            original_request: parts.request,
            destination: parts.destination,
            request_processors: parts.request_processors,
            validators: parts.validators.into(),
            result_processor: parts.result_processor,
            retry_providers: parts.retry_providers,
            transport: parts.transport,
            runtime: parts.runtime,
            success_bus: parts.success_bus,
            max_presized_body: parts.max_presized_body,
            cancelled: AtomicBool::new(false),
            finished,
            weak_self: weak_self.clone(),
            keep_alive: Mutex::new(None),
            core: Mutex::new(Core {
                phase: OperationState::Created,
                generation: 0,
                attempts: 0,
                reported: false,
                current_request: None,
                in_flight: None,
                wait_id: 0,
                arming: false,
                pending_retry: false,
                helpers: Vec::new(),
                result: None,
                callbacks: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Core<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn id(&self) -> OperationId {
        self.id
    }

    pub(crate) fn original_request(&self) -> &Request {
        &self.original_request
    }

    pub(crate) fn current_request(&self) -> Option<Request> {
        self.lock().current_request.clone()
    }

    pub(crate) fn state(&self) -> OperationState {
        self.lock().phase
    }

    pub(crate) fn attempt_count(&self) -> u32 {
        self.lock().attempts
    }

    pub(crate) fn result(&self) -> Option<OperationResult<T>> {
        self.lock().result.clone()
    }

    pub(crate) async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        // The sender lives as long as `self`, so this only returns once finished.
        let _ = finished.wait_for(|done| *done).await;
    }

    pub(crate) fn on_complete(&self, callback: CompletionCallback<T>) {
        let ready = {
            let mut core = self.lock();
            match &core.result {
                Some(result) => Some(Arc::clone(result)),
                None => {
                    core.callbacks.push(callback);
                    return;
                }
            }
        };
        if let Some(result) = ready {
            callback(result);
        }
    }

    // ==================== Lifecycle ====================

    pub(crate) fn start(&self) {
        {
            let mut core = self.lock();
            if core.phase != OperationState::Created {
                debug!(operation_id = %self.id, state = %core.phase, "Ignoring start");
                return;
            }
            core.phase = OperationState::RunningAttempt;
            *self.keep_alive.lock().unwrap_or_else(PoisonError::into_inner) =
                self.weak_self.upgrade();
        }
        debug!(
            operation_id = %self.id,
            method = %self.original_request.method,
            url = %self.original_request.url,
            "Operation started"
        );
        self.spawn_attempt();
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if !self.finish(Err(Error::Cancelled)) {
            trace!(operation_id = %self.id, "Cancel after result was published");
        }
    }

    fn spawn_attempt(&self) {
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        self.runtime.spawn(async move { this.run_attempt().await });
    }

    // ==================== Attempt ====================

    #[instrument(
        name = "operation_attempt",
        skip(self),
        fields(
            operation_id = %self.id,
            attempt = tracing::field::Empty,
            method = %self.original_request.method,
            url = %self.original_request.url
        )
    )]
    async fn run_attempt(self: Arc<Self>) {
        let generation = {
            let mut core = self.lock();
            if core.phase != OperationState::RunningAttempt || self.cancelled.load(Ordering::SeqCst) {
                return;
            }
            core.generation += 1;
            core.attempts += 1;
            core.reported = false;
            Span::current().record("attempt", core.attempts);
            core.generation
        };

        let request = match run_request_processors(
            &self.request_processors,
            self.original_request.clone(),
        )
        .await
        {
            Ok(request) => request,
            Err(e) => {
                self.attempt_failed(generation, e, None);
                return;
            }
        };

        {
            let mut core = self.lock();
            if !core.is_current(generation) {
                return;
            }
            core.current_request = Some(request.clone());
        }

        let weak = Weak::clone(&self.weak_self);
        let span = Span::current();
        let sink = Box::new(move |outcome: Result<AttemptOutput>| {
            if let Some(inner) = weak.upgrade() {
                span.in_scope(|| inner.attempt_reported(generation, outcome));
            }
        });
        let events = AttemptEvents::new(
            generation,
            Arc::clone(&self.validators),
            self.max_presized_body,
            sink,
        );

        debug!("Dispatching attempt to transport");
        let handle = self
            .transport
            .attempt(request, self.destination.clone(), events);

        let stale = {
            let mut core = self.lock();
            if core.is_current(generation) && !core.reported {
                core.in_flight = Some(handle);
                None
            } else {
                Some(handle)
            }
        };
        // Finished or cancelled while dispatching.
        if let Some(handle) = stale
            && self.cancelled.load(Ordering::SeqCst)
        {
            handle.cancel();
        }
    }

    /// Called through the attempt sink, on whatever thread the transport uses.
    fn attempt_reported(self: Arc<Self>, generation: u64, outcome: Result<AttemptOutput>) {
        let request = {
            let mut core = self.lock();
            if !core.is_current(generation) || core.reported {
                trace!(generation, "Ignoring stale attempt report");
                return;
            }
            core.reported = true;
            core.in_flight = None;
            core.current_request.clone()
        };

        let span = Span::current();
        let runtime = self.runtime.clone();
        runtime.spawn(
            async move { self.process_outcome(generation, request, outcome).await }.instrument(span),
        );
    }

    async fn process_outcome(
        self: Arc<Self>,
        generation: u64,
        request: Option<Request>,
        outcome: Result<AttemptOutput>,
    ) {
        let output = match outcome {
            Ok(output) => output,
            Err(e) => {
                self.attempt_failed(generation, e, request);
                return;
            }
        };
        let response = Arc::clone(&output.response);
        let source = match S::from_attempt(output.body, output.location) {
            Ok(source) => source,
            Err(e) => {
                self.attempt_failed(generation, e, request);
                return;
            }
        };

        match self
            .result_processor
            .process(source, Arc::clone(&response))
            .await
        {
            Ok(value) => {
                let request = request.unwrap_or_else(|| self.original_request.clone());
                if !self.lock().is_current(generation) {
                    return;
                }
                self.finish(Ok(OperationOutcome {
                    request,
                    response,
                    value,
                }));
            }
            Err(e) => {
                self.attempt_failed(generation, Error::ResultProcessor(Box::new(e)), request);
            }
        }
    }

    // ==================== Retry ====================

    fn attempt_failed(self: &Arc<Self>, generation: u64, error: Error, request: Option<Request>) {
        let context = {
            let core = self.lock();
            if !core.is_current(generation) {
                return;
            }
            OperationContext {
                id: self.id,
                attempts: core.attempts,
                cancelled: self.cancelled.load(Ordering::SeqCst),
            }
        };

        let request = request.unwrap_or_else(|| self.original_request.clone());
        match run_retry_providers(&self.retry_providers, &request, &error, &context) {
            RetryDecision::Retry(helpers) => self.await_retry(generation, helpers),
            RetryDecision::Stop | RetryDecision::Defer => {
                error!(
                    attempt = context.attempts,
                    error = %error,
                    cause = %error.root_cause(),
                    "Operation failed"
                );
                self.finish(Err(error));
            }
        }
    }

    fn await_retry(self: &Arc<Self>, generation: u64, mut helpers: Vec<Box<dyn RetryHelper>>) {
        let wait_id = {
            let mut core = self.lock();
            if !core.is_current(generation) {
                return;
            }
            core.phase = OperationState::AwaitingRetry;
            core.wait_id += 1;
            core.arming = true;
            core.pending_retry = false;
            core.wait_id
        };
        debug!(wait_id, helpers = helpers.len(), "Awaiting retry");

        let weak: Weak<Self> = Arc::downgrade(self);
        let target: Weak<dyn RetryTarget> = weak;
        for helper in &mut helpers {
            helper.setup(RetryTrigger::new(Weak::clone(&target), wait_id), &self.runtime);
        }

        let fire_now = {
            let mut core = self.lock();
            if core.phase != OperationState::AwaitingRetry || core.wait_id != wait_id {
                // Finished while arming.
                drop(core);
                teardown_all(helpers);
                return;
            }
            core.arming = false;
            let fire_now = core.pending_retry || helpers.is_empty();
            core.helpers = helpers;
            fire_now
        };
        if fire_now {
            self.retry_now(wait_id);
        }
    }

    // ==================== Completion ====================

    /// Publishes `result` unless a result already exists. Returns whether it won.
    fn finish(&self, result: Result<OperationOutcome<T>>) -> bool {
        let succeeded = result.is_ok();
        let (published, helpers, in_flight, callbacks, state) = {
            let mut core = self.lock();
            if core.result.is_some() {
                return false;
            }
            core.phase = match &result {
                Ok(_) => OperationState::Succeeded,
                Err(e) if e.is_cancelled() && self.cancelled.load(Ordering::SeqCst) => {
                    OperationState::Cancelled
                }
                Err(_) => OperationState::Failed,
            };
            let published = Arc::new(result);
            core.result = Some(Arc::clone(&published));
            (
                published,
                std::mem::take(&mut core.helpers),
                core.in_flight.take(),
                std::mem::take(&mut core.callbacks),
                core.phase,
            )
        };

        if let Some(handle) = in_flight {
            handle.cancel();
        }
        teardown_all(helpers);
        for provider in &self.retry_providers {
            provider.operation_finished(self.id);
        }
        if succeeded
            && let Some(bus) = &self.success_bus
            && let Some(host) = self.original_request.host()
        {
            bus.publish(host);
        }

        info!(operation_id = %self.id, state = %state, "Operation finished");
        self.finished.send_replace(true);
        for callback in callbacks {
            callback(Arc::clone(&published));
        }
        let released = self
            .keep_alive
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(released);
        true
    }
}

impl<S: OperationSource, T: Send + Sync + 'static> RetryTarget for Inner<S, T> {
    fn retry_now(&self, wait_id: u64) {
        let helpers = {
            let mut core = self.lock();
            if core.phase != OperationState::AwaitingRetry || core.wait_id != wait_id {
                return;
            }
            if core.arming {
                core.pending_retry = true;
                return;
            }
            core.phase = OperationState::RunningAttempt;
            std::mem::take(&mut core.helpers)
        };
        let span = info_span!("operation_retry", operation_id = %self.id, wait_id);
        span.in_scope(|| debug!(helpers = helpers.len(), "Retry triggered"));
        teardown_all(helpers);
        self.spawn_attempt();
    }
}

impl<T> Core<T> {
    /// Whether `generation` is the running attempt.
    fn is_current(&self, generation: u64) -> bool {
        self.phase == OperationState::RunningAttempt && self.generation == generation
    }
}

fn teardown_all(helpers: Vec<Box<dyn RetryHelper>>) {
    for mut helper in helpers {
        trace!(helper = helper.name(), "Tearing down retry helper");
        helper.teardown();
    }
}
