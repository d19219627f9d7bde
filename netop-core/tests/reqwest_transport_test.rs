//! `ReqwestTransport` against a local HTTP/1.1 listener.

#![cfg(feature = "reqwest")]
#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use netop_core::processor::{Decode, StatusCodeValidator};
use netop_core::retry::RetryConfig;
use netop_core::transport::{ReqwestConfig, ReqwestTransport, Transport};
use netop_core::{EngineConfig, Error, Operation, OperationState, Request};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[derive(Debug, Deserialize)]
struct User {
    name: String,
}

/// Serves `responses` in order, one per connection, then stops.
async fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&served);
    tokio::spawn(async move {
        for response in responses {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        }
    });
    (format!("http://{addr}"), served)
}

fn response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )
}

fn transport() -> Arc<dyn Transport> {
    Arc::new(ReqwestTransport::new(&ReqwestConfig::default()).unwrap())
}

fn fast_retry() -> EngineConfig {
    EngineConfig::default().with_retry(RetryConfig {
        backoff_table_ms: vec![10],
        jitter: false,
        ..RetryConfig::default()
    })
}

#[tokio::test]
async fn test_get_decodes_json() {
    let (base, served) = serve(vec![response("200 OK", "application/json", r#"{"name":"ada"}"#)]).await;
    let operation = Operation::builder(Request::get(&format!("{base}/users/1")).unwrap(), transport())
        .validator(StatusCodeValidator::default())
        .result_processor(Decode::<User>::json())
        .start()
        .unwrap();

    let result = operation.wait().await;
    let outcome = result.as_ref().as_ref().unwrap();
    assert_eq!(outcome.value.name, "ada");
    assert_eq!(outcome.response.status, 200);
    assert_eq!(served.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_server_error_is_retried() {
    let (base, served) = serve(vec![
        response("503 Service Unavailable", "text/plain", "busy"),
        response("200 OK", "application/json", r#"{"name":"ada"}"#),
    ])
    .await;
    let operation = Operation::builder(Request::get(&format!("{base}/users/1")).unwrap(), transport())
        .validator(StatusCodeValidator::default())
        .config(fast_retry())
        .start()
        .unwrap();

    let result = operation.wait().await;
    assert_eq!(result.as_ref().as_ref().unwrap().value, Bytes::from_static(br#"{"name":"ada"}"#));
    assert_eq!(operation.attempt_count(), 2);
    assert_eq!(served.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_connection_refused_is_network_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let operation = Operation::builder(
        Request::post(&format!("http://{addr}/users")).unwrap(),
        transport(),
    )
    .start()
    .unwrap();

    let result = operation.wait().await;
    let err = result.as_ref().as_ref().unwrap_err();
    assert!(err.is_network(), "unexpected error: {}", err.report());
    assert_eq!(operation.state(), OperationState::Failed);
    assert_eq!(operation.attempt_count(), 1);
}

#[tokio::test]
async fn test_download_to_file() {
    let (base, _) = serve(vec![response("200 OK", "text/plain", "hello file")]).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hello.txt");

    let operation = Operation::download(
        Request::get(&format!("{base}/hello.txt")).unwrap(),
        path.clone(),
        transport(),
    )
    .start()
    .unwrap();

    let result = operation.wait().await;
    assert_eq!(result.as_ref().as_ref().unwrap().value, path);
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "hello file");
}

#[tokio::test]
async fn test_cancel_in_flight_request() {
    // Accepts but never answers.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _server = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let operation = Operation::builder(Request::get(&format!("http://{addr}/slow")).unwrap(), transport())
        .start()
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    operation.cancel();

    let result = operation.wait().await;
    assert!(matches!(result.as_ref(), Err(Error::Cancelled)));
    assert_eq!(operation.state(), OperationState::Cancelled);
}
