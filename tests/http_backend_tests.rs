//! HttpBackend against an in-process axum stand-in for the dashboard API.

mod common;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use common::RecordingSurface;
use secguys_monitor::api::{ClientConfig, DashboardSource, HttpBackend, RouteFamily, ScanBackend};
use secguys_monitor::dashboard::Dashboard;
use secguys_monitor::error::ApiError;
use secguys_monitor::monitor::{MonitorConfig, ScanMonitor, StopRequest};
use secguys_monitor::types::{FindingQuery, ScanStatus};

#[derive(Clone, Default)]
struct FakeApi {
    inner: Arc<RwLock<FakeState>>,
}

#[derive(Default)]
struct FakeState {
    statuses: VecDeque<Value>,
    started: Vec<String>,
    stops: usize,
    queries: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    #[serde(default)]
    target: String,
}

#[derive(Debug, Deserialize)]
struct AssetFilter {
    asset_id: Option<String>,
}

async fn start_queue(State(api): State<FakeApi>, Json(body): Json<StartBody>) -> impl IntoResponse {
    if body.target.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"status": "error", "message": "Target required"})),
        );
    }
    api.inner.write().await.started.push(body.target);
    (StatusCode::OK, Json(json!({"status": "success", "scan_id": "abc123"})))
}

async fn next_status(api: &FakeApi) -> Value {
    let mut s = api.inner.write().await;
    s.statuses
        .pop_front()
        .unwrap_or_else(|| json!({"status": "running"}))
}

async fn queue_status(State(api): State<FakeApi>, Path(id): Path<String>) -> impl IntoResponse {
    if id != "abc123" {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"status": "error", "message": "Scan not found"})),
        );
    }
    let scan = next_status(&api).await;
    (StatusCode::OK, Json(json!({"status": "success", "scan": scan})))
}

async fn live_status(State(api): State<FakeApi>) -> Json<Value> {
    Json(next_status(&api).await)
}

async fn live_stop(State(api): State<FakeApi>) -> Json<Value> {
    api.inner.write().await.stops += 1;
    Json(json!({"status": "success", "message": "Stop requested"}))
}

async fn assets() -> Json<Value> {
    Json(json!({
        "status": "success",
        "assets": [
            {"asset_id": "a1", "primary_identifier": "example.com", "asset_type": "domain",
             "total_scans": 2, "total_findings": 7, "severity_summary": {"critical": 1, "high": 6}},
            {"asset_id": "a2", "primary_identifier": "10.0.0.5", "asset_type": "ip",
             "tech_stack": null}
        ]
    }))
}

async fn severity(State(api): State<FakeApi>, Query(f): Query<AssetFilter>) -> Json<Value> {
    api.inner
        .write()
        .await
        .queries
        .push(f.asset_id.clone().unwrap_or_default());
    match f.asset_id.as_deref() {
        Some("a1") => Json(json!({"status": "success", "distribution": {"critical": 1, "high": 6}})),
        _ => Json(json!({"status": "success", "distribution": {"critical": 1, "high": 6, "low": 3}})),
    }
}

async fn classifications() -> Json<Value> {
    Json(json!({
        "status": "success",
        "classifications": [
            {"classification": "sql_injection", "count": 4, "avg_cvss": 8.6},
            {"classification": "info_disclosure", "count": 2, "avg_cvss": null}
        ]
    }))
}

async fn broken() -> impl IntoResponse {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn empty_success() -> Json<Value> {
    Json(json!({"status": "success"}))
}

async fn findings_for_asset(Path(asset): Path<String>) -> Json<Value> {
    Json(json!({
        "status": "success",
        "findings": [
            {"finding_id": "f1", "severity": "critical", "title": format!("RCE on {asset}"),
             "semantic_cvss": 9.8, "scan_id": "s1"},
            {"finding_id": "f2", "severity": "low", "title": "Banner", "semantic_cvss": null, "scan_id": "s2"}
        ]
    }))
}

fn queue_router(api: FakeApi) -> Router {
    Router::new()
        .route("/api/scans/new", post(start_queue))
        .route("/api/scans/{id}/status", get(queue_status))
        .route("/api/assets", get(assets))
        .route("/api/analytics/severity-distribution", get(severity))
        .route("/api/analytics/classification-breakdown", get(classifications))
        .route("/api/analytics/source-breakdown", get(broken))
        .route("/api/analytics/mitre-mapping", get(empty_success))
        .route("/api/findings/{asset_id}", get(findings_for_asset))
        .route("/api/health", get(|| async { Json(json!({"status": "healthy"})) }))
        .with_state(api)
}

fn live_router(api: FakeApi) -> Router {
    Router::new()
        .route("/api/scan/start", post(|| async { Json(json!({"status": "started"})) }))
        .route("/api/scan/status", get(live_status))
        .route("/api/scan/stop", post(live_stop))
        .with_state(api)
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn client(base: &str, routes: RouteFamily) -> Arc<HttpBackend> {
    let cfg = ClientConfig::new(base)
        .with_routes(routes)
        .with_request_timeout(Duration::from_secs(2));
    Arc::new(HttpBackend::new(cfg).unwrap())
}

fn fast_monitor(backend: Arc<HttpBackend>) -> (ScanMonitor, Arc<RecordingSurface>) {
    let surface = Arc::new(RecordingSurface::default());
    let config = MonitorConfig::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_max_polls(500);
    (ScanMonitor::new(backend, surface.clone(), config), surface)
}

#[tokio::test]
async fn queue_scan_runs_to_completion() {
    let api = FakeApi::default();
    {
        let mut s = api.inner.write().await;
        s.statuses.extend([
            json!({"status": "queued", "target": "example.com", "created_at": "2024-03-05T14:07:09.123456"}),
            json!({"status": "running", "started_at": "2024-03-05T14:07:10"}),
            json!({"status": "completed", "completed_at": "2024-03-05T14:09:00"}),
        ]);
    }
    let base = serve(queue_router(api.clone())).await;
    let (monitor, surface) = fast_monitor(client(&base, RouteFamily::Queue));

    let handle = monitor.run("example.com").await.unwrap();

    assert_eq!(handle.id, "abc123");
    assert_eq!(handle.status, ScanStatus::Completed);
    assert_eq!(handle.created_at.as_deref(), Some("2024-03-05T14:07:09.123456"));
    assert_eq!(api.inner.read().await.started, vec!["example.com".to_string()]);
    assert_eq!(surface.refreshes(), 1);
}

#[tokio::test]
async fn server_message_is_surfaced_on_rejection() {
    let base = serve(queue_router(FakeApi::default())).await;
    let backend = client(&base, RouteFamily::Queue);

    let err = backend.start_scan("").await.unwrap_err();
    assert_eq!(
        err,
        ApiError::Rejected {
            status: Some(400),
            message: "Target required".into()
        }
    );

    let err = backend.scan_status("nope").await.unwrap_err();
    assert_eq!(err.to_string(), "Scan not found");
}

#[tokio::test]
async fn queue_routes_cannot_stop() {
    let base = serve(queue_router(FakeApi::default())).await;
    let backend = client(&base, RouteFamily::Queue);
    assert_eq!(backend.routes(), RouteFamily::Queue);
    assert!(matches!(
        backend.stop_scan("abc123").await,
        Err(ApiError::Unsupported(_))
    ));

    // Through the monitor the refusal is reported, not mistaken for a sent stop.
    let (monitor, surface) = fast_monitor(backend);
    monitor.start("example.com").await.unwrap();
    assert_eq!(
        monitor.stop().await,
        StopRequest::Failed(ApiError::Unsupported("stopping a scan"))
    );
    assert!(surface.errors().iter().any(|m| m.contains("not available")));
    monitor.abandon().await;
}

#[tokio::test]
async fn live_scan_streams_log_and_stops() {
    let api = FakeApi::default();
    {
        let mut s = api.inner.write().await;
        s.statuses.extend([
            json!({"status": "running", "output": "[*] recon\n[*] nmap"}),
            json!({"status": "running", "output": ["[*] recon", "[*] nmap", "[+] 443/tcp open"]}),
        ]);
    }
    let base = serve(live_router(api.clone())).await;
    let (monitor, surface) = fast_monitor(client(&base, RouteFamily::Live));

    let handle = monitor.start("example.com").await.unwrap();
    // No scan id from the live API: the target stands in for it.
    assert_eq!(handle.id, "example.com");

    while surface.last_log().map_or(0, |l| l.len()) < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(monitor.stop().await, StopRequest::Sent);
    assert_eq!(monitor.stop().await, StopRequest::AlreadyRequested);
    api.inner
        .write()
        .await
        .statuses
        .push_back(json!({"status": "stopped", "output": ["[*] recon", "[*] nmap", "[+] 443/tcp open", "[!] stopped"]}));

    let err = monitor.wait().await.unwrap_err();
    assert_eq!(err, secguys_monitor::error::MonitorError::Stopped);
    assert_eq!(api.inner.read().await.stops, 1);
    assert_eq!(surface.last_log().unwrap().len(), 4);
    assert_eq!(surface.refreshes(), 1);
}

#[tokio::test]
async fn unreachable_backend_is_a_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let backend = client(&format!("http://{addr}"), RouteFamily::Queue);

    let err = backend.scan_status("abc123").await.unwrap_err();
    assert!(err.is_transport(), "got {err:?}");
}

#[tokio::test]
async fn connection_lost_when_backend_goes_away() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    // Start succeeds against a scripted backend, polls hit a dead port.
    struct Split {
        dead: HttpBackend,
    }
    #[async_trait::async_trait]
    impl ScanBackend for Split {
        async fn start_scan(&self, _target: &str) -> Result<String, ApiError> {
            Ok("abc123".into())
        }
        async fn scan_status(
            &self,
            id: &str,
        ) -> Result<secguys_monitor::types::ScanSnapshot, ApiError> {
            self.dead.scan_status(id).await
        }
        async fn stop_scan(&self, id: &str) -> Result<(), ApiError> {
            self.dead.stop_scan(id).await
        }
    }
    let dead = HttpBackend::new(ClientConfig::new(format!("http://{addr}"))).unwrap();
    let surface = Arc::new(RecordingSurface::default());
    let monitor = ScanMonitor::new(
        Arc::new(Split { dead }),
        surface.clone(),
        MonitorConfig::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_failure_budget(3),
    );

    let err = monitor.run("example.com").await.unwrap_err();
    assert!(matches!(
        err,
        secguys_monitor::error::MonitorError::ConnectionLost { failures: 3, .. }
    ));
    assert_eq!(surface.refreshes(), 0);
}

#[tokio::test]
async fn dashboard_panels_fail_independently() {
    let api = FakeApi::default();
    let base = serve(queue_router(api.clone())).await;
    let dashboard = Dashboard::new(client(&base, RouteFamily::Queue));

    let view = dashboard.refresh().await.unwrap();

    let stats = view.stats.loaded().unwrap();
    assert_eq!(stats.total_assets, 2);
    assert_eq!(stats.total_findings, 10);
    assert_eq!(stats.critical, 1);
    assert_eq!(view.classifications.loaded().unwrap()[1].avg_cvss, 0.0);
    assert!(view.sources.is_failed());
    assert!(view.mitre.loaded().unwrap().is_empty());
    assert_eq!(view.assets.loaded().unwrap()[1].tech_stack.len(), 0);
    // Queue API needs an asset to list findings.
    assert!(view.findings.is_failed());
}

#[tokio::test]
async fn asset_filter_applies_to_every_panel() {
    let api = FakeApi::default();
    let base = serve(queue_router(api.clone())).await;
    let dashboard = Dashboard::new(client(&base, RouteFamily::Queue));

    let view = dashboard.set_asset_filter(Some("a1".into())).await.unwrap();

    assert_eq!(view.asset_filter.as_deref(), Some("a1"));
    assert_eq!(view.stats.loaded().unwrap().total_findings, 7);
    let findings = view.findings.loaded().unwrap();
    assert_eq!(findings[0].title, "RCE on a1");
    assert_eq!(findings[1].semantic_cvss, 0.0);
    // Severity was fetched twice (panel + stats), both for the new filter.
    assert_eq!(api.inner.read().await.queries, vec!["a1".to_string(), "a1".to_string()]);
}

#[tokio::test]
async fn findings_scan_filter_is_applied_client_side() {
    let base = serve(queue_router(FakeApi::default())).await;
    let backend = client(&base, RouteFamily::Queue);
    let query = FindingQuery {
        asset_id: Some("a1".into()),
        scan_id: Some("s2".into()),
        severity: vec![],
    };
    let findings = backend.findings(&query).await.unwrap();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].finding_id, "f2");
}

#[tokio::test]
async fn health_check() {
    let base = serve(queue_router(FakeApi::default())).await;
    assert!(client(&base, RouteFamily::Queue).health().await.is_ok());
}
