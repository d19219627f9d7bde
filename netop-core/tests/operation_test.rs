//! Operation lifecycle integration tests.
//!
//! Test coverage:
//! - Retry convergence for idempotent requests
//! - Non-idempotent requests are not retried
//! - Cancellation before, during and after attempts
//! - Concurrent retry helpers trigger exactly one retry
//! - Result pipelines and broken transport contracts through a full operation
//! - Downloads to a file
//! - Started operations outlive their handles

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use async_trait::async_trait;
use bytes::Bytes;
use netop_core::error::{Stage, TransportError};
use netop_core::events::{HostEventBus, ManualReachability, ReachabilityMonitor};
use netop_core::processor::{
    BearerToken, Decode, Recover, ResultProcessorExt, StatusCheck, StatusCodeValidator,
    TokenSource, request_processor_fn,
};
use netop_core::retry::{RetryConfig, SharedRetryProvider};
use netop_core::testing::{ManualRetryProvider, ScriptedAttempt, ScriptedTransport};
use netop_core::transport::{Destination, Transport};
use netop_core::{EngineConfig, Error, Operation, OperationState, Request, Result, StatusRange};
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio::time::{Instant, timeout};

#[derive(Debug, Deserialize, PartialEq, Eq)]
struct User {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: String,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "api error {}", self.code)
    }
}

impl std::error::Error for ApiError {}

const USER_JSON: &str = r#"{"name":"ada"}"#;

/// Fixed, short backoff so paused-clock tests stay deterministic.
fn fast_retry() -> EngineConfig {
    EngineConfig::default().with_retry(RetryConfig {
        backoff_table_ms: vec![100, 200, 400],
        jitter: false,
        ..RetryConfig::default()
    })
}

fn transport_of(script: &Arc<ScriptedTransport>) -> Arc<dyn Transport> {
    Arc::clone(script) as Arc<dyn Transport>
}

fn user_operation(
    script: &Arc<ScriptedTransport>,
    config: EngineConfig,
) -> Operation<Bytes, User> {
    Operation::builder(Request::get("https://api.example.com/users/1").unwrap(), transport_of(script))
        .validator(StatusCodeValidator::default())
        .result_processor(Decode::<User>::json())
        .config(config)
        .build()
        .unwrap()
}

/// Yields until `condition` holds; fails the test after many rounds.
async fn settle<F: Fn() -> bool>(condition: F) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never became true");
}

#[tokio::test(start_paused = true)]
async fn test_transient_error_then_success_matches_direct_success() {
    let direct = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let flaky = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::timeout(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);

    let direct_op = user_operation(&direct, fast_retry());
    let flaky_op = user_operation(&flaky, fast_retry());
    direct_op.start();
    flaky_op.start();

    let direct_result = direct_op.wait().await;
    let flaky_result = flaky_op.wait().await;

    let direct_value = &direct_result.as_ref().as_ref().unwrap().value;
    let flaky_value = &flaky_result.as_ref().as_ref().unwrap().value;
    assert_eq!(direct_value, flaky_value);
    assert_eq!(flaky_op.attempt_count(), 3);
    assert_eq!(flaky.attempts(), 3);
    assert_eq!(flaky_op.state(), OperationState::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn test_post_connection_error_is_not_retried() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let operation = Operation::builder(
        Request::post("https://api.example.com/users").unwrap(),
        transport_of(&script),
    )
    .start()
    .unwrap();

    let result = operation.wait().await;
    let err = result.as_ref().as_ref().unwrap_err();
    assert!(err.is_network());
    assert_eq!(operation.attempt_count(), 1);
    assert_eq!(operation.state(), OperationState::Failed);

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(script.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_stop_after_budget() {
    let script = ScriptedTransport::new((0..10).map(|_| ScriptedAttempt::connection_error()));
    let config = fast_retry().with_retry(RetryConfig {
        max_retries: 2,
        backoff_table_ms: vec![10],
        jitter: false,
        ..RetryConfig::default()
    });
    let operation = user_operation(&script, config);
    operation.start();

    let result = operation.wait().await;
    assert!(result.as_ref().as_ref().unwrap_err().is_network());
    assert_eq!(operation.attempt_count(), 3);
    assert_eq!(script.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_server_error_retry_honours_retry_after() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::status(503).header(http::header::RETRY_AFTER, "5"),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let started = Instant::now();
    let operation = user_operation(&script, fast_retry());
    operation.start();

    let result = operation.wait().await;
    assert!(result.as_ref().is_ok());
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(script.attempts(), 2);
}

#[tokio::test]
async fn test_cancel_twice_yields_one_cancelled_result() {
    let script = ScriptedTransport::new([ScriptedAttempt::hang()]);
    let operation = user_operation(&script, fast_retry());
    operation.start();
    settle(|| script.attempts() == 1).await;

    let callbacks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&callbacks);
    operation.on_complete(move |result| {
        assert!(result.as_ref().as_ref().unwrap_err().is_cancelled());
        counter.fetch_add(1, Ordering::SeqCst);
    });

    operation.cancel();
    operation.cancel();

    assert_eq!(operation.state(), OperationState::Cancelled);
    assert_eq!(callbacks.load(Ordering::SeqCst), 1);
    assert!(operation.result().as_ref().as_ref().unwrap_err().is_cancelled());
    assert_eq!(script.cancellations(), 1);

    // The transport's late cancellation report is ignored.
    tokio::task::yield_now().await;
    assert_eq!(operation.state(), OperationState::Cancelled);
    assert_eq!(script.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_awaiting_retry() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let config = EngineConfig::default().with_retry(RetryConfig {
        backoff_table_ms: vec![10_000],
        jitter: false,
        ..RetryConfig::default()
    });
    let operation = user_operation(&script, config);
    operation.start();
    settle(|| operation.state() == OperationState::AwaitingRetry).await;

    let started = Instant::now();
    operation.cancel();
    let result = operation.wait().await;
    assert!(result.as_ref().as_ref().unwrap_err().is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(1));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(script.attempts(), 1);
    assert_eq!(operation.state(), OperationState::Cancelled);
}

#[tokio::test]
async fn test_cancel_before_start() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let operation = user_operation(&script, fast_retry());
    operation.cancel();
    operation.start();

    assert_eq!(operation.state(), OperationState::Cancelled);
    tokio::task::yield_now().await;
    assert_eq!(script.attempts(), 0);
}

#[tokio::test]
async fn test_cancel_after_success_keeps_result() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let operation = user_operation(&script, fast_retry());
    operation.start();
    let result = operation.wait().await;
    assert!(result.as_ref().is_ok());

    operation.cancel();
    assert_eq!(operation.state(), OperationState::Succeeded);
    assert!(Arc::ptr_eq(&result, &operation.result()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_helpers_trigger_one_retry() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let (provider, triggers) = ManualRetryProvider::new(2);
    let operation = Operation::builder(
        Request::get("https://api.example.com/users/1").unwrap(),
        transport_of(&script),
    )
    .retry_providers(vec![Arc::new(provider) as SharedRetryProvider])
    .start()
    .unwrap();

    timeout(Duration::from_secs(5), async {
        while triggers.armed().len() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("helpers were never armed");

    let armed = triggers.armed();
    let barrier = Arc::new(Barrier::new(armed.len()));
    let threads: Vec<_> = armed
        .into_iter()
        .map(|trigger| {
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                trigger.fire()
            })
        })
        .collect();
    for thread in threads {
        assert!(thread.join().unwrap());
    }

    let result = timeout(Duration::from_secs(5), operation.wait()).await.unwrap();
    assert!(result.as_ref().is_ok());
    assert_eq!(script.attempts(), 2);
    assert_eq!(operation.attempt_count(), 2);
    assert_eq!(triggers.setups(), 2);
    assert_eq!(triggers.teardowns(), 2);
}

#[tokio::test]
async fn test_not_found_recovers_api_error() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(404, r#"{"code":"not_found"}"#)]);
    let pipeline = StatusCheck::<Bytes>::default()
        .flat_map(Decode::<User>::json())
        .flat_map_error(Recover::<Bytes>::default().flat_map(Decode::<ApiError>::json()));
    let operation = Operation::builder(
        Request::get("https://api.example.com/users/404").unwrap(),
        transport_of(&script),
    )
    .result_processor(pipeline)
    .start()
    .unwrap();

    let result = operation.wait().await;
    let err = result.as_ref().as_ref().unwrap_err();

    assert_eq!(err.stage(), Some(Stage::ResultProcessing));
    assert_eq!(err.api_error::<ApiError>().unwrap().code, "not_found");
    let status = err.as_unexpected_status().unwrap();
    assert_eq!(status.expected, StatusRange::new(200, 400));
    assert_eq!(status.actual, 404);
    assert_eq!(operation.attempt_count(), 1);
}

#[tokio::test]
async fn test_transport_reporting_neither_is_broken_contract() {
    for attempt in [
        ScriptedAttempt::neither(),
        ScriptedAttempt::both(),
        ScriptedAttempt::drop_events(),
    ] {
        let script = ScriptedTransport::new([attempt]);
        let operation = user_operation(&script, fast_retry());
        operation.start();

        let result = operation.wait().await;
        assert!(result.as_ref().as_ref().unwrap_err().is_broken_contract());
        assert_eq!(operation.state(), OperationState::Failed);
        assert_eq!(script.attempts(), 1);
    }
}

#[tokio::test]
async fn test_validator_rejection_fails_with_validator_stage() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(403, r#"{"code":"forbidden"}"#)]);
    let operation = user_operation(&script, fast_retry());
    operation.start();

    let result = operation.wait().await;
    let err = result.as_ref().as_ref().unwrap_err();
    assert!(matches!(err, Error::ResponseValidator(_)));
    assert_eq!(err.as_unexpected_status().unwrap().actual, 403);
    assert_eq!(script.attempts(), 1);
}

#[tokio::test]
async fn test_undecodable_body_is_not_retried() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::json(200, "not json"),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let operation = user_operation(&script, fast_retry());
    operation.start();

    let result = operation.wait().await;
    let conversion = result.as_ref().as_ref().unwrap_err().as_data_conversion().unwrap();
    assert_eq!(&conversion.body[..], b"not json");
    assert_eq!(script.attempts(), 1);
}

struct CountingTokens(AtomicUsize);

#[async_trait]
impl TokenSource for CountingTokens {
    async fn token(&self) -> Result<String> {
        Ok(format!("t{}", self.0.fetch_add(1, Ordering::SeqCst) + 1))
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_processors_rerun_from_original_request() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let operation = Operation::builder(
        Request::get("https://api.example.com/users/1").unwrap(),
        transport_of(&script),
    )
    .request_processor(BearerToken::new(Arc::new(CountingTokens(AtomicUsize::new(0)))))
    .config(fast_retry())
    .start()
    .unwrap();

    let result = operation.wait().await;
    let outcome = result.as_ref().as_ref().unwrap();

    let sent: Vec<_> = script
        .requests()
        .iter()
        .map(|r| r.headers[http::header::AUTHORIZATION].to_str().unwrap().to_owned())
        .collect();
    assert_eq!(sent, ["Bearer t1", "Bearer t2"]);
    assert_eq!(outcome.request.headers[http::header::AUTHORIZATION], "Bearer t2");
    assert!(!operation.original_request().headers.contains_key(http::header::AUTHORIZATION));
    assert_eq!(
        operation.current_request().unwrap().headers[http::header::AUTHORIZATION],
        "Bearer t2"
    );
}

#[tokio::test]
async fn test_request_processor_failure_is_wrapped() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let operation = Operation::builder(
        Request::get("https://api.example.com/users/1").unwrap(),
        transport_of(&script),
    )
    .request_processor(request_processor_fn(|_| Err(Error::invalid_request("missing signature"))))
    .start()
    .unwrap();

    let result = operation.wait().await;
    let err = result.as_ref().as_ref().unwrap_err();
    assert!(matches!(err, Error::RequestProcessor(_)));
    assert_eq!(err.stage(), Some(Stage::RequestProcessing));
    assert_eq!(script.attempts(), 0);
}

#[tokio::test]
async fn test_sibling_success_retries_early() {
    let bus = Arc::new(HostEventBus::new());
    let config = EngineConfig::default()
        .with_success_bus(Arc::clone(&bus))
        .with_retry(RetryConfig {
            backoff_table_ms: vec![3_600_000],
            jitter: false,
            ..RetryConfig::default()
        });

    let waiting_script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let waiting = user_operation(&waiting_script, config.clone());
    waiting.start();
    timeout(Duration::from_secs(5), async {
        while waiting.state() != OperationState::AwaitingRetry {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(bus.subscriber_count("api.example.com"), 1);

    let sibling_script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let sibling = user_operation(&sibling_script, config);
    sibling.start();
    assert!(sibling.wait().await.as_ref().is_ok());

    let result = timeout(Duration::from_secs(5), waiting.wait()).await.unwrap();
    assert!(result.as_ref().is_ok());
    assert_eq!(waiting_script.attempts(), 2);
    assert_eq!(bus.subscriber_count("api.example.com"), 0);
}

#[tokio::test]
async fn test_reachability_retries_early() {
    let monitor = Arc::new(ManualReachability::new());
    let config = EngineConfig::default()
        .with_reachability(Arc::clone(&monitor) as Arc<dyn ReachabilityMonitor>)
        .with_retry(RetryConfig {
            backoff_table_ms: vec![3_600_000],
            jitter: false,
            ..RetryConfig::default()
        });

    let script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let operation = user_operation(&script, config);
    monitor.set_reachable("api.example.com", false);
    operation.start();
    timeout(Duration::from_secs(5), async {
        while operation.state() != OperationState::AwaitingRetry {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_eq!(monitor.subscriber_count("api.example.com"), 1);
    assert_eq!(script.attempts(), 1);

    monitor.set_reachable("api.example.com", true);

    let result = timeout(Duration::from_secs(5), operation.wait()).await.unwrap();
    assert_eq!(result.as_ref().as_ref().unwrap().value.name, "ada");
    assert_eq!(script.attempts(), 2);
    assert_eq!(monitor.subscriber_count("api.example.com"), 0);
}

#[tokio::test]
async fn test_dropped_handle_still_completes() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::json(200, USER_JSON).after(Duration::from_millis(20))
    ]);
    let operation = user_operation(&script, fast_retry());
    operation.start();

    let (tx, rx) = tokio::sync::oneshot::channel();
    operation.on_complete(move |result| {
        let _ = tx.send(result);
    });
    drop(operation);

    let result = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap();
    assert_eq!(result.as_ref().as_ref().unwrap().value.name, "ada");
    assert_eq!(script.attempts(), 1);
    assert_eq!(script.cancellations(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_still_retries() {
    let script = ScriptedTransport::new([
        ScriptedAttempt::connection_error(),
        ScriptedAttempt::json(200, USER_JSON),
    ]);
    let operation = user_operation(&script, fast_retry());
    let (tx, rx) = tokio::sync::oneshot::channel();
    operation.on_complete(move |result| {
        let _ = tx.send(result);
    });
    operation.start();
    drop(operation);

    let result = rx.await.unwrap();
    assert!(result.as_ref().is_ok());
    assert_eq!(script.attempts(), 2);
}

#[tokio::test]
async fn test_download_destination_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing").join("user.json");
    let script = ScriptedTransport::new([
        ScriptedAttempt::json(200, USER_JSON),
        ScriptedAttempt::json(200, USER_JSON),
    ]);

    let operation = Operation::download(
        Request::get("https://api.example.com/users/1").unwrap(),
        path,
        transport_of(&script),
    )
    .config(fast_retry())
    .start()
    .unwrap();

    let result = operation.wait().await;
    let err = result.as_ref().as_ref().unwrap_err();
    assert!(matches!(err.as_transport(), Some(TransportError::Destination { .. })));
    assert!(!err.is_network());
    assert_eq!(operation.state(), OperationState::Failed);
    assert_eq!(script.attempts(), 1);
}

#[tokio::test]
async fn test_download_writes_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("user.json");
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);

    let operation = Operation::download(
        Request::get("https://api.example.com/users/1").unwrap(),
        path.clone(),
        transport_of(&script),
    )
    .validator(StatusCodeValidator::default())
    .start()
    .unwrap();

    let result = operation.wait().await;
    let outcome = result.as_ref().as_ref().unwrap();
    assert_eq!(outcome.value, path);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), USER_JSON);
    assert_eq!(script.destinations(), [Destination::File(path.clone())]);
}

#[tokio::test]
async fn test_completion_callback_after_finish_runs_immediately() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let operation = user_operation(&script, fast_retry());
    assert!(operation.result().as_ref().as_ref().unwrap_err().is_not_finished());

    operation.start();
    let waited = operation.wait().await;

    let seen = Arc::new(std::sync::Mutex::new(None));
    let slot = Arc::clone(&seen);
    operation.on_complete(move |result| {
        *slot.lock().unwrap() = Some(result);
    });
    let seen = seen.lock().unwrap().take().unwrap();
    assert!(Arc::ptr_eq(&seen, &waited));
    assert_eq!(seen.as_ref().as_ref().unwrap().value.name, "ada");
}

#[tokio::test]
async fn test_start_is_ignored_once_running() {
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let operation = user_operation(&script, fast_retry());
    operation.start();
    operation.start();

    operation.wait().await;
    operation.start();
    tokio::task::yield_now().await;
    assert_eq!(script.attempts(), 1);
}

#[test]
fn test_build_outside_runtime_fails() {
    let script = ScriptedTransport::new(Vec::new());
    let result = Operation::builder(
        Request::get("https://api.example.com/").unwrap(),
        transport_of(&script),
    )
    .build();
    assert!(result.is_err());
}

#[test]
fn test_build_with_explicit_runtime() {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let script = ScriptedTransport::new([ScriptedAttempt::json(200, USER_JSON)]);
    let operation = user_operation(
        &script,
        fast_retry().with_runtime(runtime.handle().clone()),
    );
    operation.start();

    let result = runtime.block_on(operation.wait());
    assert_eq!(result.as_ref().as_ref().unwrap().value.name, "ada");
}
