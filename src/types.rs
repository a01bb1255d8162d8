use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Treat JSON `null` the same as a missing field.
pub(crate) fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

/// Accept a log as either a list of lines or one newline-separated blob.
fn lines_or_text<'de, D>(de: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Log {
        Lines(Vec<String>),
        Text(String),
    }

    Ok(match Option::<Log>::deserialize(de)? {
        Some(Log::Lines(lines)) => lines,
        Some(Log::Text(text)) => text.lines().map(str::to_string).collect(),
        None => Vec::new(),
    })
}

/// Lifecycle of a backend scan. Moves forward only.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[serde(alias = "queued")]
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ScanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Stopped
        )
    }

    fn rank(self) -> u8 {
        match self {
            ScanStatus::Pending => 0,
            ScanStatus::Running => 1,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Stopped => 2,
        }
    }

    /// Whether `next` is a legal successor. Staying put counts as legal;
    /// nothing leaves a terminal state.
    pub fn can_advance_to(self, next: ScanStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One poll response: the scan's current status and full accumulated log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanSnapshot {
    pub status: ScanStatus,
    #[serde(default, deserialize_with = "lines_or_text")]
    pub output: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

impl ScanSnapshot {
    pub fn new(status: ScanStatus) -> Self {
        Self {
            status,
            output: Vec::new(),
            error: None,
            created_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_output<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output = lines.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Client-side proxy for one in-flight or finished scan.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanHandle {
    pub id: String,
    pub target: String,
    pub status: ScanStatus,
    pub output: Vec<String>,
    pub error: Option<String>,
    pub created_at: Option<String>,
}

impl ScanHandle {
    pub fn new(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            status: ScanStatus::Pending,
            output: Vec::new(),
            error: None,
            created_at: None,
        }
    }

    /// Apply a poll result. Returns `true` if anything visible changed.
    ///
    /// Backward status moves are ignored, the log is only replaced by an
    /// equal-or-longer one, and `error` is only kept for failed scans.
    pub fn absorb(&mut self, snap: &ScanSnapshot) -> bool {
        let mut changed = false;
        if snap.status != self.status && self.status.can_advance_to(snap.status) {
            self.status = snap.status;
            changed = true;
        }
        if snap.output.len() >= self.output.len() && snap.output != self.output {
            self.output = snap.output.clone();
            changed = true;
        }
        if self.status == ScanStatus::Failed && self.error.is_none() {
            self.error = snap.error.clone();
            changed |= self.error.is_some();
        }
        if self.created_at.is_none() && snap.created_at.is_some() {
            self.created_at = snap.created_at.clone();
        }
        changed
    }
}

/// `type:value` pair such as `ip:10.0.0.5` or `domain:example.com`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Asset {
    pub asset_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub primary_identifier: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub asset_type: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_scans: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_findings: u64,
    #[serde(default)]
    pub last_scan: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub identifiers: Vec<Identifier>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub severity_summary: BTreeMap<String, u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tech_stack: Vec<String>,
}

/// Row of an asset's scan history.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ScanRecord {
    #[serde(default, deserialize_with = "null_as_default")]
    pub scan_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tool: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub started_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct AssetDetail {
    #[serde(flatten)]
    pub asset: Asset,
    #[serde(default, deserialize_with = "null_as_default")]
    pub scans: Vec<ScanRecord>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Finding {
    pub finding_id: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub scan_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub severity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub cve: Option<String>,
    #[serde(default)]
    pub cwe: Option<String>,
    #[serde(default)]
    pub semantic_classification: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub semantic_cvss: f64,
    #[serde(default)]
    pub attack_capability: Option<String>,
    #[serde(default)]
    pub mitre_tactic: Option<String>,
    #[serde(default)]
    pub mitre_technique: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Filters for the findings listing. Empty means unfiltered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FindingQuery {
    pub asset_id: Option<String>,
    pub scan_id: Option<String>,
    pub severity: Vec<String>,
}

impl FindingQuery {
    pub fn for_asset(asset_id: Option<&str>) -> Self {
        Self {
            asset_id: asset_id.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = Vec::new();
        if let Some(a) = &self.asset_id {
            pairs.push(("asset_id", a.clone()));
        }
        if let Some(s) = &self.scan_id {
            pairs.push(("scan_id", s.clone()));
        }
        if !self.severity.is_empty() {
            pairs.push(("severity", self.severity.join(",")));
        }
        pairs
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ClassificationCount {
    #[serde(default, deserialize_with = "null_as_default")]
    pub classification: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub avg_cvss: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceCount {
    #[serde(default, deserialize_with = "null_as_default")]
    pub source: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub critical: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub high: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct MitreCount {
    #[serde(default, deserialize_with = "null_as_default")]
    pub tactic: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub technique: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TopVulnerability {
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub severity: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub count: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub avg_cvss: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    #[serde(alias = "id")]
    pub report_id: String,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Generated report: severity rollup, top findings and optional markdown body.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Report {
    #[serde(default)]
    pub asset: Option<Asset>,
    #[serde(default)]
    pub scan_date: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub severity_summary: BTreeMap<String, u64>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_findings: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub top_findings: Vec<Finding>,
    #[serde(default)]
    pub content: Option<String>,
}

/// Headline numbers for the dashboard.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct DashboardStats {
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_assets: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_findings: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub critical: u64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub high: u64,
}

impl DashboardStats {
    /// Derive the headline numbers from the asset list and severity counts.
    pub fn summarize(assets: &[Asset], distribution: &BTreeMap<String, u64>) -> Self {
        Self {
            total_assets: assets.len() as u64,
            total_findings: distribution.values().sum(),
            critical: distribution.get("critical").copied().unwrap_or(0),
            high: distribution.get("high").copied().unwrap_or(0),
        }
    }
}
