use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use lan_recon::clock::SystemClock;
use lan_recon::config::OrchestratorConfig;
use lan_recon::error::{DetectError, ExecutorError};
use lan_recon::executor::{ProgressSender, RawScanOutput, ScanExecutor};
use lan_recon::netdetect::NetworkDetector;
use lan_recon::orchestrator::Orchestrator;
use lan_recon::reports::FileReportGenerator;
use lan_recon::server::{router, AppState};
use lan_recon::store::MemoryStore;
use lan_recon::types::ScanId;

/// Discovers nothing, so every scan completes right after discovery.
struct EmptyNetwork;

#[async_trait]
impl ScanExecutor for EmptyNetwork {
    async fn discover(
        &self,
        _scan_id: ScanId,
        _targets: &[String],
        _timeout: Duration,
    ) -> Result<Vec<IpAddr>, ExecutorError> {
        Ok(Vec::new())
    }

    async fn scan_host(
        &self,
        _scan_id: ScanId,
        _addr: IpAddr,
        _timeout: Duration,
        _progress: ProgressSender,
    ) -> Result<RawScanOutput, ExecutorError> {
        Err(ExecutorError::Other("unexpected host scan".into()))
    }
}

struct NoNetwork;

impl NetworkDetector for NoNetwork {
    fn detect_local_network(&self) -> Result<String, DetectError> {
        Err(DetectError::NoNetwork)
    }
}

fn app(dir: &tempfile::TempDir) -> axum::Router {
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(EmptyNetwork),
        Arc::new(FileReportGenerator::new(dir.path())),
        Arc::new(NoNetwork),
        Arc::new(SystemClock),
        OrchestratorConfig::default(),
    ));
    router(AppState::new(orchestrator))
}

async fn call(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.expect("response");
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

fn post_scans(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/scans")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn post_scan_is_accepted_and_pollable() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);

    let (status, body) = call(&app, post_scans(r#"{"targets":["10.0.0.0/30"]}"#)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["scan_id"].as_u64().expect("scan id");

    let view = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (status, view) = call(&app, get(&format!("/api/scans/{id}"))).await;
            assert_eq!(status, StatusCode::OK);
            if view["status"] == "completed" {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scan completes");
    assert_eq!(view["progress_percent"], 100);
    assert_eq!(view["total_hosts"], 0);
    assert_eq!(view["hosts"], Value::Array(vec![]));

    let (status, list) = call(&app, get("/api/scans")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn invalid_target_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);
    let (status, body) = call(&app, post_scans(r#"{"targets":["300.1.1.0/24"]}"#)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("300.1.1.0/24"));
    assert!(body["scan_id"].is_u64());
}

#[tokio::test]
async fn failed_auto_detection_is_a_bad_request() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);
    let (status, body) = call(&app, post_scans("{}")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("no targets"));
}

#[tokio::test]
async fn unknown_scan_is_404() {
    let dir = tempfile::tempdir().unwrap();
    let app = app(&dir);
    let (status, body) = call(&app, get("/api/scans/12345")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("12345"));
}
