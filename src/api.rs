//! REST client for the dashboard backend.
//!
//! The backend exists in two route families that differ in paths and in
//! which operations they offer. Both return JSON envelopes of the form
//! `{"status": "success", "<key>": ...}` or `{"status": "error", "message": ...}`;
//! the live family also answers some endpoints with a bare payload.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::ApiError;
use crate::types::{
    Asset, AssetDetail, ClassificationCount, DashboardStats, Finding, FindingQuery, MitreCount,
    Report, ReportSummary, ScanSnapshot, SourceCount, TopVulnerability,
};

/// Drives a scan's lifecycle on the backend.
#[async_trait]
pub trait ScanBackend: Send + Sync {
    /// Start a scan and return the backend-assigned scan id.
    async fn start_scan(&self, target: &str) -> Result<String, ApiError>;
    async fn scan_status(&self, scan_id: &str) -> Result<ScanSnapshot, ApiError>;
    async fn stop_scan(&self, scan_id: &str) -> Result<(), ApiError>;
}

/// Read-only data behind the dashboard panels. `asset` narrows a query to
/// one asset where the backend supports it.
#[async_trait]
pub trait DashboardSource: Send + Sync {
    async fn assets(&self) -> Result<Vec<Asset>, ApiError>;
    async fn asset_detail(&self, asset_id: &str) -> Result<AssetDetail, ApiError>;
    async fn findings(&self, query: &FindingQuery) -> Result<Vec<Finding>, ApiError>;
    async fn finding(&self, finding_id: &str) -> Result<Finding, ApiError>;
    async fn severity_distribution(
        &self,
        asset: Option<&str>,
    ) -> Result<BTreeMap<String, u64>, ApiError>;
    async fn classification_breakdown(
        &self,
        asset: Option<&str>,
    ) -> Result<Vec<ClassificationCount>, ApiError>;
    async fn source_breakdown(&self, asset: Option<&str>) -> Result<Vec<SourceCount>, ApiError>;
    async fn mitre_mapping(&self, asset: Option<&str>) -> Result<Vec<MitreCount>, ApiError>;
    async fn dashboard_stats(&self, asset: Option<&str>) -> Result<DashboardStats, ApiError>;
    async fn top_vulnerabilities(&self) -> Result<Vec<TopVulnerability>, ApiError>;
    async fn reports(&self) -> Result<Vec<ReportSummary>, ApiError>;
    async fn report(&self, id: &str) -> Result<Report, ApiError>;
    async fn download_report(&self, id: &str) -> Result<Vec<u8>, ApiError>;
    async fn health(&self) -> Result<(), ApiError>;
}

/// Which set of backend routes to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RouteFamily {
    /// Queue-backed API: `/api/scans/new`, `/api/scans/{id}/status`, `/api/analytics/*`.
    #[default]
    Queue,
    /// Single live scan with streamed log: `/api/scan/{start,status,stop}`, `/api/findings-by-*`.
    Live,
}

#[derive(Debug, Clone, Copy)]
enum Breakdown {
    Severity,
    Classification,
    Source,
    Mitre,
}

impl RouteFamily {
    fn start(self) -> &'static str {
        match self {
            RouteFamily::Queue => "/api/scans/new",
            RouteFamily::Live => "/api/scan/start",
        }
    }

    fn status(self, scan_id: &str) -> String {
        match self {
            RouteFamily::Queue => format!("/api/scans/{scan_id}/status"),
            RouteFamily::Live => "/api/scan/status".to_string(),
        }
    }

    fn asset_detail(self, asset_id: &str) -> String {
        match self {
            RouteFamily::Queue => format!("/api/assets/{asset_id}"),
            RouteFamily::Live => format!("/api/asset/{asset_id}/details"),
        }
    }

    fn breakdown(self, which: Breakdown) -> &'static str {
        match (self, which) {
            (RouteFamily::Queue, Breakdown::Severity) => "/api/analytics/severity-distribution",
            (RouteFamily::Queue, Breakdown::Classification) => {
                "/api/analytics/classification-breakdown"
            }
            (RouteFamily::Queue, Breakdown::Source) => "/api/analytics/source-breakdown",
            (RouteFamily::Queue, Breakdown::Mitre) => "/api/analytics/mitre-mapping",
            (RouteFamily::Live, Breakdown::Severity) => "/api/findings-by-severity",
            (RouteFamily::Live, Breakdown::Classification) => "/api/findings-by-classification",
            (RouteFamily::Live, Breakdown::Source) => "/api/findings-by-source",
            (RouteFamily::Live, Breakdown::Mitre) => "/api/findings-by-mitre",
        }
    }
}

/// Connection settings for [`HttpBackend`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub routes: RouteFamily,
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:5000".to_string(),
            routes: RouteFamily::Queue,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_routes(mut self, routes: RouteFamily) -> Self {
        self.routes = routes;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// Status codes worth retrying when the body carries no error envelope.
pub fn is_retryable_http_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[derive(Debug, Deserialize)]
struct StartAck {
    #[serde(default)]
    scan_id: Option<String>,
}

/// reqwest-based client for both route families.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    routes: RouteFamily,
}

impl HttpBackend {
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            routes: config.routes,
        })
    }

    pub fn routes(&self) -> RouteFamily {
        self.routes
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json(&self, path: &str, query: &[(&str, String)]) -> Result<Value, ApiError> {
        let req = self.client.get(self.url(path)).query(query);
        self.send(path, req).await
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        let req = self.client.post(self.url(path)).json(&body);
        self.send(path, req).await
    }

    async fn send(&self, path: &str, req: RequestBuilder) -> Result<Value, ApiError> {
        debug!(path, "request");
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let body: Option<Value> = serde_json::from_slice(&bytes).ok();
        interpret(path, status, body)
    }

    fn asset_query(asset: Option<&str>) -> Vec<(&'static str, String)> {
        asset
            .map(|a| vec![("asset_id", a.to_string())])
            .unwrap_or_default()
    }
}

/// Turn a raw response into a JSON payload or a typed error.
fn interpret(path: &str, status: StatusCode, body: Option<Value>) -> Result<Value, ApiError> {
    let envelope_error = body
        .as_ref()
        .filter(|b| b.get("status").and_then(Value::as_str) == Some("error"));

    if let Some(b) = envelope_error {
        let message = b.get("message").and_then(Value::as_str).map(str::to_string);
        let code = (!status.is_success()).then(|| status.as_u16());
        return Err(ApiError::rejected(code, message));
    }

    if !status.is_success() {
        let message = body
            .as_ref()
            .and_then(|b| b.get("message"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if message.is_none() && is_retryable_http_status(status.as_u16()) {
            return Err(ApiError::Transport(format!("{path} returned HTTP {status}")));
        }
        return Err(ApiError::rejected(Some(status.as_u16()), message));
    }

    body.ok_or_else(|| ApiError::Decode {
        endpoint: path.to_string(),
        reason: "response body is not JSON".to_string(),
    })
}

/// Pull `key` out of an envelope, fall back to the bare body, and default
/// when neither has the expected shape.
fn field_or_body<T>(path: &str, body: Value, key: &str) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    match body.get(key) {
        Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v.clone()).map_err(|e| ApiError::Decode {
            endpoint: path.to_string(),
            reason: format!("field '{key}': {e}"),
        }),
        None => Ok(serde_json::from_value(body).unwrap_or_default()),
    }
}

/// Like [`field_or_body`] but for single records, which have no sensible default.
fn record<T: DeserializeOwned>(path: &str, body: Value, key: &str) -> Result<T, ApiError> {
    let v = match body.get(key) {
        Some(inner) if inner.is_object() => inner.clone(),
        _ => body,
    };
    serde_json::from_value(v).map_err(|e| ApiError::Decode {
        endpoint: path.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl ScanBackend for HttpBackend {
    async fn start_scan(&self, target: &str) -> Result<String, ApiError> {
        let path = self.routes.start();
        let body = self.post_json(path, json!({ "target": target })).await?;
        let ack: StartAck = serde_json::from_value(body).map_err(|e| ApiError::Decode {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })?;
        match (ack.scan_id, self.routes) {
            (Some(id), _) => Ok(id),
            // The live API tracks a single scan and may not hand out an id.
            (None, RouteFamily::Live) => Ok(target.to_string()),
            (None, RouteFamily::Queue) => Err(ApiError::Decode {
                endpoint: path.to_string(),
                reason: "missing scan_id".to_string(),
            }),
        }
    }

    async fn scan_status(&self, scan_id: &str) -> Result<ScanSnapshot, ApiError> {
        let path = self.routes.status(scan_id);
        let body = self.get_json(&path, &[]).await?;
        record(&path, body, "scan")
    }

    async fn stop_scan(&self, _scan_id: &str) -> Result<(), ApiError> {
        match self.routes {
            RouteFamily::Queue => Err(ApiError::Unsupported("stopping a scan")),
            RouteFamily::Live => self.post_json("/api/scan/stop", json!({})).await.map(|_| ()),
        }
    }
}

#[async_trait]
impl DashboardSource for HttpBackend {
    async fn assets(&self) -> Result<Vec<Asset>, ApiError> {
        let path = "/api/assets";
        field_or_body(path, self.get_json(path, &[]).await?, "assets")
    }

    async fn asset_detail(&self, asset_id: &str) -> Result<AssetDetail, ApiError> {
        let path = self.routes.asset_detail(asset_id);
        let body = self.get_json(&path, &[]).await?;
        record(&path, body, "asset")
    }

    async fn findings(&self, query: &FindingQuery) -> Result<Vec<Finding>, ApiError> {
        let (path, params) = match self.routes {
            RouteFamily::Live => ("/api/findings".to_string(), query.query_pairs()),
            RouteFamily::Queue => {
                let asset = query
                    .asset_id
                    .as_deref()
                    .ok_or(ApiError::Unsupported("listing findings without an asset filter"))?;
                let mut params = Vec::new();
                if !query.severity.is_empty() {
                    params.push(("severity", query.severity.join(",")));
                }
                (format!("/api/findings/{asset}"), params)
            }
        };
        let body = self.get_json(&path, &params).await?;
        let mut findings: Vec<Finding> = field_or_body(&path, body, "findings")?;
        // The queue API has no scan filter; apply it client-side.
        if let Some(scan) = &query.scan_id {
            findings.retain(|f| f.scan_id.as_deref().map_or(true, |s| s == scan));
        }
        Ok(findings)
    }

    async fn finding(&self, finding_id: &str) -> Result<Finding, ApiError> {
        if self.routes == RouteFamily::Queue {
            return Err(ApiError::Unsupported("finding detail"));
        }
        let path = format!("/api/finding/{finding_id}");
        let body = self.get_json(&path, &[]).await?;
        record(&path, body, "finding")
    }

    async fn severity_distribution(
        &self,
        asset: Option<&str>,
    ) -> Result<BTreeMap<String, u64>, ApiError> {
        let path = self.routes.breakdown(Breakdown::Severity);
        let body = self.get_json(path, &Self::asset_query(asset)).await?;
        field_or_body(path, body, "distribution")
    }

    async fn classification_breakdown(
        &self,
        asset: Option<&str>,
    ) -> Result<Vec<ClassificationCount>, ApiError> {
        let path = self.routes.breakdown(Breakdown::Classification);
        let body = self.get_json(path, &Self::asset_query(asset)).await?;
        field_or_body(path, body, "classifications")
    }

    async fn source_breakdown(&self, asset: Option<&str>) -> Result<Vec<SourceCount>, ApiError> {
        let path = self.routes.breakdown(Breakdown::Source);
        let body = self.get_json(path, &Self::asset_query(asset)).await?;
        field_or_body(path, body, "sources")
    }

    async fn mitre_mapping(&self, asset: Option<&str>) -> Result<Vec<MitreCount>, ApiError> {
        let path = self.routes.breakdown(Breakdown::Mitre);
        let body = self.get_json(path, &Self::asset_query(asset)).await?;
        field_or_body(path, body, "mitre")
    }

    async fn dashboard_stats(&self, asset: Option<&str>) -> Result<DashboardStats, ApiError> {
        match self.routes {
            RouteFamily::Live => {
                let path = "/api/dashboard-stats";
                let body = self.get_json(path, &Self::asset_query(asset)).await?;
                field_or_body(path, body, "stats")
            }
            RouteFamily::Queue => {
                let (assets, distribution) =
                    tokio::try_join!(self.assets(), self.severity_distribution(asset))?;
                Ok(DashboardStats::summarize(&assets, &distribution))
            }
        }
    }

    async fn top_vulnerabilities(&self) -> Result<Vec<TopVulnerability>, ApiError> {
        if self.routes == RouteFamily::Queue {
            return Err(ApiError::Unsupported("top vulnerabilities"));
        }
        let path = "/api/top-vulnerabilities";
        field_or_body(path, self.get_json(path, &[]).await?, "vulnerabilities")
    }

    async fn reports(&self) -> Result<Vec<ReportSummary>, ApiError> {
        if self.routes == RouteFamily::Queue {
            return Err(ApiError::Unsupported("report listing"));
        }
        let path = "/api/reports";
        field_or_body(path, self.get_json(path, &[]).await?, "reports")
    }

    /// On the queue API `id` is an asset id and the latest report is returned.
    async fn report(&self, id: &str) -> Result<Report, ApiError> {
        let path = match self.routes {
            RouteFamily::Queue => format!("/api/reports/latest/{id}"),
            RouteFamily::Live => format!("/api/reports/{id}"),
        };
        let body = self.get_json(&path, &[]).await?;
        record(&path, body, "report")
    }

    async fn download_report(&self, id: &str) -> Result<Vec<u8>, ApiError> {
        if self.routes == RouteFamily::Queue {
            return Err(ApiError::Unsupported("report download"));
        }
        let path = format!("/api/reports/{id}/download");
        debug!(path = %path, "download");
        let resp = self.client.get(self.url(&path)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await?;
            return interpret(&path, status, serde_json::from_slice(&bytes).ok()).map(|_| Vec::new());
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn health(&self) -> Result<(), ApiError> {
        let path = "/api/health";
        let body = self.get_json(path, &[]).await?;
        match body.get("status").and_then(Value::as_str) {
            Some("healthy") | Some("ok") | Some("success") => Ok(()),
            other => Err(ApiError::rejected(
                None,
                Some(format!("backend reports {}", other.unwrap_or("unknown health"))),
            )),
        }
    }
}
