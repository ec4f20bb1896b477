//! End-to-end delivery through `HttpTransport` against a local ingestion stub.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::Value;

use telemetry_agent::dispatcher::{
    DispatchError, DispatchOutcome, Dispatcher, HttpTransport, RetryPolicy,
};
use telemetry_agent::reading::{DiagnosticsReading, DiagnosticsSnapshot, SensorKind, SensorReading};
use telemetry_agent::validator::{self, Schema};

#[derive(Clone, Default)]
struct Recorder {
    requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    failures_left: Arc<AtomicU32>,
}

impl Recorder {
    fn failing_first(count: u32) -> Self {
        let recorder = Self::default();
        recorder.failures_left.store(count, Ordering::SeqCst);
        recorder
    }

    fn record(&self, path: &str, headers: &HeaderMap, body: Value) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        self.requests
            .lock()
            .unwrap()
            .push((path.to_string(), auth, body));

        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::OK
        }
    }
}

async fn sensors(
    State(recorder): State<Recorder>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    recorder.record("/api/sensors", &headers, body)
}

async fn diagnostics(
    State(recorder): State<Recorder>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    recorder.record("/api/diagnostics", &headers, body)
}

async fn spawn_stub(recorder: Recorder) -> SocketAddr {
    let app = Router::new()
        .route("/api/sensors", post(sensors))
        .route("/api/diagnostics", post(diagnostics))
        .with_state(recorder);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn dispatcher(max_retries: u32) -> Dispatcher<HttpTransport> {
    dispatcher_with_timeout(max_retries, Duration::from_secs(5))
}

fn dispatcher_with_timeout(max_retries: u32, timeout: Duration) -> Dispatcher<HttpTransport> {
    let transport = HttpTransport::new("test-key", timeout).unwrap();
    Dispatcher::new(
        transport,
        RetryPolicy {
            max_retries,
            backoff_base: 1.0,
            timeout,
        },
    )
}

#[tokio::test]
async fn test_sensor_batch_reaches_api_with_bearer_token() {
    let recorder = Recorder::default();
    let addr = spawn_stub(recorder.clone()).await;

    let reading = SensorReading::new()
        .with(SensorKind::Temperature, 22.5)
        .with(SensorKind::Humidity, 45.0)
        .with(SensorKind::Methane, 2.1)
        .with(SensorKind::Light, 800.0)
        .with(SensorKind::AtmosphericPressure, 1013.2);
    assert!(validator::check(&reading.to_fields(), &Schema::sensor_reading()).is_ok());

    let payload = serde_json::to_value(reading.to_batch()).unwrap();
    let outcome = dispatcher(3)
        .send(&format!("http://{}/api/sensors", addr), &payload)
        .await;

    assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 1 });

    let requests = recorder.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    let (path, auth, body) = &requests[0];
    assert_eq!(path, "/api/sensors");
    assert_eq!(auth.as_deref(), Some("Bearer test-key"));

    let readings = body["readings"].as_array().unwrap();
    assert_eq!(readings.len(), 5);
    for entry in readings {
        assert!(entry["sensor_id"].is_string());
        assert!(entry["value"].is_number());
        assert!(entry["timestamp"].as_str().unwrap().ends_with('Z'));
    }
}

#[tokio::test]
async fn test_diagnostics_retried_after_server_rejection() {
    let recorder = Recorder::failing_first(1);
    let addr = spawn_stub(recorder.clone()).await;

    let snapshot = DiagnosticsSnapshot {
        cpu_usage: 40.0,
        cpu_temperature: None,
        memory_usage: 50.0,
        disk_usage: 60.0,
        network_usage: 1024.0,
        system_uptime: 3600.0,
    };
    let payload =
        serde_json::to_value(DiagnosticsReading::from_snapshot(&snapshot, Utc::now())).unwrap();

    let outcome = dispatcher(3)
        .send(&format!("http://{}/api/diagnostics", addr), &payload)
        .await;

    assert_eq!(outcome, DispatchOutcome::Delivered { attempts: 2 });

    let requests = recorder.requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].2.is_object());
    assert_eq!(requests[1].2["cpu_temperature"], 55.0);
}

#[tokio::test]
async fn test_gives_up_when_server_keeps_rejecting() {
    let recorder = Recorder::failing_first(u32::MAX);
    let addr = spawn_stub(recorder.clone()).await;

    let outcome = dispatcher(1)
        .send(&format!("http://{}/api/sensors", addr), &serde_json::json!({"readings": []}))
        .await;

    assert!(matches!(
        outcome,
        DispatchOutcome::GaveUp {
            attempts: 1,
            last_error: DispatchError::ServerRejected {
                status: StatusCode::SERVICE_UNAVAILABLE,
                ..
            },
        }
    ));
}

#[tokio::test]
async fn test_connection_refused_is_classified() {
    // Reserve a port, then close it so nothing is listening
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let outcome = dispatcher(1)
        .send(&format!("http://{}/api/sensors", addr), &serde_json::json!({"readings": []}))
        .await;

    match outcome {
        DispatchOutcome::GaveUp { attempts, last_error } => {
            assert_eq!(attempts, 1);
            assert_eq!(last_error.kind(), "connection");
        }
        other => panic!("expected GaveUp, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_keeps_error_text() {
    // Accept connections but never answer
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let outcome = dispatcher_with_timeout(1, Duration::from_millis(200))
        .send(&format!("http://{}/api/sensors", addr), &serde_json::json!({"readings": []}))
        .await;

    match outcome {
        DispatchOutcome::GaveUp { last_error, .. } => {
            assert_eq!(last_error.kind(), "timeout");
            let DispatchError::Timeout(text) = &last_error else {
                panic!("expected Timeout, got {:?}", last_error);
            };
            assert!(!text.is_empty());
            assert!(last_error.to_string().contains(text.as_str()));
        }
        other => panic!("expected GaveUp, got {:?}", other),
    }
}
