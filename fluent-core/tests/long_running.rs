//! Integration Tests for Long-Running Operations
//!
//! A scripted transport replays canned responses so every polling protocol
//! can be driven end to end. Time is paused, so poll delays cost nothing and
//! can be measured exactly.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;

use fluent_core::lro::{
    begin_operation, HttpRequest, HttpResponse, Method, OperationStatus, Transport,
};
use fluent_core::{ClientConfig, Error, Result};

/// Replays responses in order and records every request.
#[derive(Default)]
struct Scripted {
    responses: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<(Method, String)>>,
}

impl Scripted {
    fn new(responses: impl IntoIterator<Item = Result<HttpResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::default(),
        })
    }

    fn requests(&self) -> Vec<(Method, String)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for Scripted {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push((request.method, request.url.clone()));
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(Error::transport("no scripted response left", false)))
    }
}

fn follow_server() -> ClientConfig {
    ClientConfig::default()
        .with_long_running_operation_retry_timeout(-1)
        .unwrap()
}

fn get(url: &str) -> (Method, String) {
    (Method::Get, url.to_string())
}

#[derive(Debug, Deserialize, PartialEq)]
struct VirtualMachine {
    name: String,
    location: String,
}

/// Test a PUT tracked through Azure-AsyncOperation followed by a final GET.
#[tokio::test(start_paused = true)]
async fn put_polls_async_operation_then_reads_resource() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(201)
            .with_header("Azure-AsyncOperation", "https://mgmt/operations/7")
            .with_header("Retry-After", "1")
            .with_body(r#"{"properties":{"provisioningState":"Creating"}}"#)),
        Ok(HttpResponse::new(200).with_body(r#"{"status":"InProgress"}"#)),
        Ok(HttpResponse::new(200).with_body(r#"{"status":"Succeeded"}"#)),
        Ok(HttpResponse::new(200).with_body(r#"{"name":"vm1","location":"westus"}"#)),
    ]);

    let request = HttpRequest::new(Method::Put, "https://mgmt/vm1")
        .with_json(&serde_json::json!({ "location": "westus" }))
        .unwrap();
    let poller = begin_operation(transport.clone(), request, follow_server())
        .await
        .unwrap();
    assert_eq!(poller.state().status(), OperationStatus::InProgress);

    let start = tokio::time::Instant::now();
    let observations: Vec<_> = poller.into_stream().collect().await;
    let statuses: Vec<OperationStatus> = observations
        .iter()
        .map(|o| o.as_ref().unwrap().status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            OperationStatus::InProgress,
            OperationStatus::InProgress,
            OperationStatus::Succeeded
        ]
    );

    // Two waits for the server hint, none before the final GET
    assert_eq!(start.elapsed(), Duration::from_secs(2));

    let resource = observations[2].as_ref().unwrap().resource.clone().unwrap();
    assert_eq!(resource["name"], "vm1");
    assert_eq!(
        transport.requests(),
        vec![
            (Method::Put, "https://mgmt/vm1".to_string()),
            get("https://mgmt/operations/7"),
            get("https://mgmt/operations/7"),
            get("https://mgmt/vm1"),
        ]
    );
}

/// Test that wait_for deserializes the final resource.
#[tokio::test(start_paused = true)]
async fn wait_for_returns_typed_resource() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(201)
            .with_body(r#"{"name":"vm1","location":"westus","properties":{"provisioningState":"Updating"}}"#)),
        Ok(HttpResponse::new(200).with_body(
            r#"{"name":"vm1","location":"westus","properties":{"provisioningState":"Succeeded"}}"#,
        )),
    ]);

    let poller = begin_operation(
        transport.clone(),
        HttpRequest::new(Method::Patch, "https://mgmt/vm1"),
        ClientConfig::default(),
    )
    .await
    .unwrap();

    let start = tokio::time::Instant::now();
    let vm: VirtualMachine = poller.wait_for().await.unwrap();
    assert_eq!(
        vm,
        VirtualMachine {
            name: "vm1".to_string(),
            location: "westus".to_string(),
        }
    );
    // The configured delay wins over the missing server hint
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_eq!(transport.requests()[1], get("https://mgmt/vm1"));
}

/// Test a DELETE tracked through the Location header.
#[tokio::test(start_paused = true)]
async fn delete_polls_location_until_done() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(202).with_header("Location", "https://mgmt/locations/3")),
        Ok(HttpResponse::new(202)),
        Ok(HttpResponse::new(204)),
    ]);

    let poller = begin_operation(
        transport.clone(),
        HttpRequest::new(Method::Delete, "https://mgmt/vm1"),
        ClientConfig::default().with_long_running_operation_retry_timeout(5).unwrap(),
    )
    .await
    .unwrap();

    let start = tokio::time::Instant::now();
    assert_eq!(poller.wait().await.unwrap(), None);
    assert_eq!(start.elapsed(), Duration::from_secs(10));
    assert_eq!(transport.requests().len(), 3);
}

/// Test that a DELETE without a resource cannot be deserialized.
#[tokio::test(start_paused = true)]
async fn wait_for_without_resource_fails() {
    let transport = Scripted::new([Ok(HttpResponse::new(204))]);
    let poller = begin_operation(
        transport,
        HttpRequest::new(Method::Delete, "https://mgmt/vm1"),
        ClientConfig::default(),
    )
    .await
    .unwrap();

    let result = poller.wait_for::<VirtualMachine>().await;
    assert!(matches!(result, Err(Error::Deserialization(_))));
}

/// Test that a terminal failure ends the stream with the service's error.
#[tokio::test(start_paused = true)]
async fn failed_operation_reports_cloud_error() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(202).with_header("Azure-AsyncOperation", "https://mgmt/operations/9")),
        Ok(HttpResponse::new(200).with_body(
            r#"{"status":"Failed","error":{"code":"AllocationFailed","message":"no capacity in westus"}}"#,
        )),
    ]);

    let poller = begin_operation(
        transport,
        HttpRequest::new(Method::Post, "https://mgmt/vm1/start"),
        follow_server(),
    )
    .await
    .unwrap();

    let observations: Vec<_> = poller.into_stream().collect().await;
    assert_eq!(observations.len(), 2);
    match observations.last() {
        Some(Err(Error::OperationFailed {
            verb,
            status,
            error: Some(error),
        })) => {
            assert_eq!(*verb, Method::Post);
            assert_eq!(*status, OperationStatus::Failed);
            assert_eq!(error.code, "AllocationFailed");
            assert_eq!(error.message, "no capacity in westus");
        }
        other => panic!("expected a failed operation, got {other:?}"),
    }
}

/// Test that transient poll failures are retried with backoff.
#[tokio::test(start_paused = true)]
async fn transient_poll_failures_are_retried() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(202).with_header("Location", "https://mgmt/locations/1")),
        Ok(HttpResponse::new(503)),
        Err(Error::transport("connection reset", true)),
        Ok(HttpResponse::new(200).with_body(r#"{"name":"restart"}"#)),
    ]);

    let poller = begin_operation(
        transport.clone(),
        HttpRequest::new(Method::Post, "https://mgmt/vm1/restart"),
        ClientConfig::default()
            .with_long_running_operation_retry_timeout(0)
            .unwrap(),
    )
    .await
    .unwrap();

    let start = tokio::time::Instant::now();
    let resource = poller.wait().await.unwrap().unwrap();
    assert_eq!(resource["name"], "restart");
    // One second before the first retry, two before the second
    assert_eq!(start.elapsed(), Duration::from_secs(3));
    assert_eq!(transport.requests().len(), 4);
}

/// Test that retries stop once the configured number is used up.
#[tokio::test(start_paused = true)]
async fn poll_retries_are_bounded() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(202).with_header("Location", "https://mgmt/locations/1")),
        Ok(HttpResponse::new(500)),
        Ok(HttpResponse::new(500)),
        Ok(HttpResponse::new(500)),
    ]);

    let poller = begin_operation(
        transport.clone(),
        HttpRequest::new(Method::Delete, "https://mgmt/vm1"),
        ClientConfig::default().with_max_poll_retries(2),
    )
    .await
    .unwrap();

    let result = poller.wait().await;
    assert!(matches!(result, Err(Error::Service { status: 500, .. })));
    assert_eq!(transport.requests().len(), 4);
}

/// Test that a rejected initial request never yields a poller.
#[tokio::test(start_paused = true)]
async fn rejected_request_is_a_service_error() {
    let transport = Scripted::new([Ok(HttpResponse::new(400).with_body(
        r#"{"error":{"code":"InvalidParameter","message":"bad size","target":"vmSize"}}"#,
    ))]);

    let result = begin_operation(
        transport,
        HttpRequest::new(Method::Put, "https://mgmt/vm1"),
        ClientConfig::default(),
    )
    .await;

    match result {
        Err(Error::Service { status, error }) => {
            assert_eq!(status, 400);
            assert_eq!(error.code, "InvalidParameter");
            assert_eq!(error.target.as_deref(), Some("vmSize"));
        }
        other => panic!("expected a service error, got {other:?}"),
    }
}

/// Test that an invalid configuration is rejected before anything is sent.
#[tokio::test]
async fn invalid_config_sends_nothing() {
    let transport = Scripted::new([]);
    let config = ClientConfig {
        long_running_operation_retry_timeout: -5,
        ..ClientConfig::default()
    };

    let result = begin_operation(
        transport.clone(),
        HttpRequest::new(Method::Put, "https://mgmt/vm1"),
        config,
    )
    .await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(transport.requests().is_empty());
}

/// Test that nothing is polled until the stream is polled, and that
/// dropping the stream stops polling.
#[tokio::test(start_paused = true)]
async fn polling_is_lazy_and_stops_on_drop() {
    let transport = Scripted::new([
        Ok(HttpResponse::new(202).with_header("Location", "https://mgmt/locations/5")),
        Ok(HttpResponse::new(202)),
        Ok(HttpResponse::new(202)),
        Ok(HttpResponse::new(204)),
    ]);

    let poller = begin_operation(
        transport.clone(),
        HttpRequest::new(Method::Delete, "https://mgmt/vm1"),
        ClientConfig::default(),
    )
    .await
    .unwrap();

    let mut observations = poller.into_stream();
    assert_eq!(transport.requests().len(), 1);

    // The first observation is the accepted response itself
    let first = observations.next().await.unwrap().unwrap();
    assert_eq!(first.status, OperationStatus::InProgress);
    assert_eq!(transport.requests().len(), 1);

    observations.next().await.unwrap().unwrap();
    assert_eq!(transport.requests().len(), 2);

    drop(observations);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.requests().len(), 2);
}
