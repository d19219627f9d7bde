//! Test doubles for driving operations without a network.
//!
//! [`ScriptedTransport`] plays back one [`ScriptedAttempt`] per call to
//! [`Transport::attempt`], each on its own task, and records what it was
//! asked to send. [`ManualRetryProvider`] retries with helpers that only fire
//! when a test fires them.

use crate::error::{Error, TransportError};
use crate::request::{Request, ResponseHead};
use crate::retry::{OperationContext, RetryDecision, RetryHelper, RetryProvider, RetryTrigger};
use crate::transport::{
    AttemptEvents, AttemptHandle, BodyDisposition, Completion, Destination, Transport,
};
use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderName};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

/// Body chunk size used when streaming scripted bodies.
const CHUNK_SIZE: usize = 7;

enum Play {
    Respond {
        status: StatusCode,
        headers: Vec<(HeaderName, String)>,
        body: Bytes,
    },
    Fail(Error),
    Hang,
    Neither,
    Both,
    DropEvents,
}

/// One scripted transport attempt.
pub struct ScriptedAttempt {
    play: Play,
    delay: Duration,
}

impl ScriptedAttempt {
    fn new(play: Play) -> Self {
        Self {
            play,
            delay: Duration::ZERO,
        }
    }

    /// Responds with `status` and a JSON body.
    pub fn json(status: u16, body: &str) -> Self {
        Self::body(status, "application/json", body.to_owned())
    }

    /// Responds with `status` and an empty body.
    pub fn status(status: u16) -> Self {
        Self::new(Play::Respond {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: Vec::new(),
            body: Bytes::new(),
        })
    }

    /// Responds with `status`, a `Content-Type` and a body.
    pub fn body(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self::new(Play::Respond {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            headers: vec![(CONTENT_TYPE, content_type.to_owned())],
            body: body.into(),
        })
    }

    /// Fails with a connection error.
    pub fn connection_error() -> Self {
        Self::error(TransportError::ConnectionFailed("connection refused".to_owned()).into())
    }

    /// Fails with a timeout.
    pub fn timeout() -> Self {
        Self::error(Error::timeout())
    }

    /// Fails with `error`.
    pub fn error(error: Error) -> Self {
        Self::new(Play::Fail(error))
    }

    /// Never completes unless cancelled.
    pub fn hang() -> Self {
        Self::new(Play::Hang)
    }

    /// Completes with neither a response nor an error.
    pub fn neither() -> Self {
        Self::new(Play::Neither)
    }

    /// Completes with both a response and an error.
    pub fn both() -> Self {
        Self::new(Play::Both)
    }

    /// Drops the event sink without completing.
    pub fn drop_events() -> Self {
        Self::new(Play::DropEvents)
    }

    /// Adds a response header. Ignored for non-response attempts.
    pub fn header(mut self, name: HeaderName, value: &str) -> Self {
        if let Play::Respond { headers, .. } = &mut self.play {
            headers.push((name, value.to_owned()));
        }
        self
    }

    /// Waits `delay` before playing the attempt.
    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[derive(Default)]
struct Recorded {
    requests: Vec<Request>,
    destinations: Vec<Destination>,
}

/// A [`Transport`] that plays back scripted attempts in order.
///
/// Once the script is exhausted every attempt fails with a transport error.
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedAttempt>>,
    recorded: Mutex<Recorded>,
    cancellations: Arc<AtomicUsize>,
}

impl ScriptedTransport {
    /// Creates a transport playing `attempts`.
    pub fn new(attempts: impl IntoIterator<Item = ScriptedAttempt>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(attempts.into_iter().collect()),
            recorded: Mutex::new(Recorded::default()),
            cancellations: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Appends an attempt to the script.
    pub fn push(&self, attempt: ScriptedAttempt) {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(attempt);
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .len()
    }

    /// Requests received, in order.
    pub fn requests(&self) -> Vec<Request> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .requests
            .clone()
    }

    /// Destinations received, in order.
    pub fn destinations(&self) -> Vec<Destination> {
        self.recorded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .destinations
            .clone()
    }

    /// Cancellations requested through attempt handles.
    pub fn cancellations(&self) -> usize {
        self.cancellations.load(Ordering::SeqCst)
    }
}

struct ScriptedHandle {
    token: CancellationToken,
    cancellations: Arc<AtomicUsize>,
}

impl AttemptHandle for ScriptedHandle {
    fn cancel(&self) {
        if !self.token.is_cancelled() {
            self.cancellations.fetch_add(1, Ordering::SeqCst);
        }
        self.token.cancel();
    }
}

impl Transport for ScriptedTransport {
    fn attempt(
        &self,
        request: Request,
        destination: Destination,
        events: AttemptEvents,
    ) -> Box<dyn AttemptHandle> {
        {
            let mut recorded = self.recorded.lock().unwrap_or_else(PoisonError::into_inner);
            recorded.requests.push(request.clone());
            recorded.destinations.push(destination.clone());
        }
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or_else(|| {
                ScriptedAttempt::error(Error::transport("scripted transport has no attempts left"))
            });

        let token = CancellationToken::new();
        let child = token.clone();
        let hangs = matches!(next.play, Play::Hang);
        let delay = next.delay;
        Handle::current().spawn(async move {
            let wait = async {
                if hangs {
                    std::future::pending::<()>().await;
                } else if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            };
            tokio::select! {
                biased;
                () = child.cancelled() => events.fail(Error::Cancelled),
                () = wait => play(next.play, request, destination, events).await,
            }
        });

        Box::new(ScriptedHandle {
            token,
            cancellations: Arc::clone(&self.cancellations),
        })
    }
}

async fn play(play: Play, request: Request, destination: Destination, mut events: AttemptEvents) {
    match play {
        Play::Respond {
            status,
            headers,
            body,
        } => {
            let mut head = ResponseHead::new(request.url, status);
            for (name, value) in headers {
                head = head.with_header(name, &value);
            }
            head.content_length = Some(body.len() as u64);
            if events.response(head) == BodyDisposition::Skip {
                events.finish(None);
                return;
            }
            match destination {
                Destination::Memory => {
                    for chunk in body.chunks(CHUNK_SIZE) {
                        events.data(chunk);
                    }
                    events.finish(None);
                }
                Destination::File(path) => match tokio::fs::write(&path, &body).await {
                    Ok(()) => events.finish(Some(path)),
                    Err(e) => events.fail(TransportError::destination(path, e).into()),
                },
            }
        }
        Play::Fail(error) => events.fail(error),
        Play::Hang => events.fail(Error::Cancelled),
        Play::Neither => events.complete(Completion::default()),
        Play::Both => events.complete(Completion {
            response: Some(ResponseHead::new(request.url, StatusCode::OK)),
            body: Some(Bytes::from_static(b"{}")),
            error: Some(Error::timeout()),
            ..Default::default()
        }),
        Play::DropEvents => drop(events),
    }
}

#[derive(Default)]
struct ArmedState {
    armed: Vec<RetryTrigger>,
    setups: usize,
    teardowns: usize,
}

/// Shared view of the helpers handed out by a [`ManualRetryProvider`].
#[derive(Clone, Default)]
pub struct ManualTriggers {
    state: Arc<Mutex<ArmedState>>,
}

impl ManualTriggers {
    fn lock(&self) -> std::sync::MutexGuard<'_, ArmedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Triggers of helpers currently armed.
    pub fn armed(&self) -> Vec<RetryTrigger> {
        self.lock().armed.clone()
    }

    /// Helpers set up so far.
    pub fn setups(&self) -> usize {
        self.lock().setups
    }

    /// Helpers torn down so far.
    pub fn teardowns(&self) -> usize {
        self.lock().teardowns
    }
}

struct ManualRetryHelper {
    triggers: ManualTriggers,
    trigger: Option<RetryTrigger>,
}

impl RetryHelper for ManualRetryHelper {
    fn setup(&mut self, trigger: RetryTrigger, _runtime: &Handle) {
        let mut state = self.triggers.lock();
        state.setups += 1;
        state.armed.push(trigger.clone());
        self.trigger = Some(trigger);
    }

    fn teardown(&mut self) {
        let Some(trigger) = self.trigger.take() else {
            return;
        };
        let mut state = self.triggers.lock();
        state.teardowns += 1;
        if let Some(pos) = state
            .armed
            .iter()
            .position(|t| t.wait_id() == trigger.wait_id())
        {
            state.armed.remove(pos);
        }
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

impl Drop for ManualRetryHelper {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Retries every failure with helpers that fire only through
/// [`ManualTriggers`].
pub struct ManualRetryProvider {
    helpers_per_retry: usize,
    triggers: ManualTriggers,
}

impl ManualRetryProvider {
    /// Arms `helpers_per_retry` helpers on every retry.
    pub fn new(helpers_per_retry: usize) -> (Self, ManualTriggers) {
        let triggers = ManualTriggers::default();
        (
            Self {
                helpers_per_retry,
                triggers: triggers.clone(),
            },
            triggers,
        )
    }
}

impl RetryProvider for ManualRetryProvider {
    fn decide(&self, _request: &Request, _error: &Error, _operation: &OperationContext) -> RetryDecision {
        let helpers = (0..self.helpers_per_retry)
            .map(|_| {
                Box::new(ManualRetryHelper {
                    triggers: self.triggers.clone(),
                    trigger: None,
                }) as Box<dyn RetryHelper>
            })
            .collect();
        RetryDecision::Retry(helpers)
    }
}

