//! Plain-text rendering of dashboard data for the terminal client.

use std::collections::BTreeMap;

use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::dashboard::{DashboardView, Panel};
use crate::types::{
    Asset, AssetDetail, ClassificationCount, DashboardStats, Finding, MitreCount, Report,
    ReportSummary, ScanHandle, SourceCount, TopVulnerability,
};

const TITLE_WIDTH: usize = 60;

/// Render a backend timestamp as `YYYY-MM-DD HH:MM`. Accepts RFC 3339 and
/// naive ISO 8601 (with `T` or a space separator); anything else is echoed.
pub fn format_date(raw: &str) -> String {
    let fmt = |y: i32, mo: u8, d: u8, h: u8, mi: u8| format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}");

    if let Ok(dt) = OffsetDateTime::parse(raw, &Rfc3339) {
        return fmt(dt.year(), u8::from(dt.month()), dt.day(), dt.hour(), dt.minute());
    }
    let normalized = raw.trim().replacen(' ', "T", 1);
    if let Ok(dt) = PrimitiveDateTime::parse(&normalized, &Iso8601::DEFAULT) {
        return fmt(dt.year(), u8::from(dt.month()), dt.day(), dt.hour(), dt.minute());
    }
    raw.to_string()
}

pub fn format_date_opt(raw: Option<&str>) -> String {
    raw.map(format_date).unwrap_or_else(|| "Never".to_string())
}

/// Severity band for a CVSS score.
pub fn cvss_band(score: f64) -> &'static str {
    if score >= 9.0 {
        "critical"
    } else if score >= 7.0 {
        "high"
    } else if score >= 4.0 {
        "medium"
    } else {
        "low"
    }
}

/// Heat of a MITRE cell: saturates at five findings.
pub fn mitre_intensity(count: u64) -> f64 {
    (count as f64 / 5.0).min(1.0)
}

pub fn severity_badges(summary: &BTreeMap<String, u64>) -> String {
    summary
        .iter()
        .map(|(sev, n)| format!("{sev}:{n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn clip(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let mut out: String = s.chars().take(width.saturating_sub(3)).collect();
    out.push_str("...");
    out
}

fn table(headers: &[&str], rows: &[Vec<String>]) -> Vec<String> {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: &[String]| {
        cells
            .iter()
            .zip(&widths)
            .map(|(c, w)| format!("{c:<w$}", w = *w))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let head: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    let mut out = vec![line(&head), line(&rule)];
    out.extend(rows.iter().map(|r| line(r)));
    out
}

pub fn render_stats(stats: &DashboardStats) -> String {
    format!(
        "Assets: {}  Findings: {}  Critical: {}  High: {}",
        stats.total_assets, stats.total_findings, stats.critical, stats.high
    )
}

pub fn render_assets(assets: &[Asset]) -> String {
    if assets.is_empty() {
        return "No assets found. Start a scan to add assets.".to_string();
    }
    let rows: Vec<Vec<String>> = assets
        .iter()
        .map(|a| {
            vec![
                a.asset_id.clone(),
                a.primary_identifier.clone(),
                a.asset_type.clone(),
                a.total_scans.to_string(),
                a.total_findings.to_string(),
                severity_badges(&a.severity_summary),
                format_date_opt(a.last_scan.as_deref()),
            ]
        })
        .collect();
    table(
        &["id", "target", "type", "scans", "findings", "severity", "last scan"],
        &rows,
    )
    .join("\n")
}

pub fn render_asset_detail(detail: &AssetDetail) -> String {
    let a = &detail.asset;
    let mut lines = vec![
        a.primary_identifier.clone(),
        format!("Type: {}", a.asset_type),
        String::new(),
        "Identifiers:".to_string(),
    ];
    lines.extend(a.identifiers.iter().map(|i| format!("  {}: {}", i.kind, i.value)));
    if !a.tech_stack.is_empty() {
        lines.push(format!("Tech stack: {}", a.tech_stack.join(", ")));
    }
    lines.push(format!("Severity: {}", severity_badges(&a.severity_summary)));
    lines.push(String::new());
    lines.push("Recent scans:".to_string());
    if detail.scans.is_empty() {
        lines.push("  none".to_string());
    }
    lines.extend(detail.scans.iter().map(|s| {
        format!(
            "  {} [{}] {}",
            s.tool,
            s.status,
            format_date_opt(s.started_at.as_deref())
        )
    }));
    lines.join("\n")
}

pub fn render_findings(findings: &[Finding]) -> String {
    if findings.is_empty() {
        return "No findings.".to_string();
    }
    let rows: Vec<Vec<String>> = findings
        .iter()
        .map(|f| {
            vec![
                f.finding_id.clone(),
                f.severity.clone(),
                format!("{:.1}", f.semantic_cvss),
                clip(&f.title, TITLE_WIDTH),
                f.semantic_classification.clone().unwrap_or_default(),
                f.cve.clone().unwrap_or_default(),
            ]
        })
        .collect();
    table(
        &["id", "severity", "cvss", "title", "classification", "cve"],
        &rows,
    )
    .join("\n")
}

pub fn render_finding(f: &Finding) -> String {
    let opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "-".to_string());
    let mut lines = vec![
        f.title.clone(),
        format!(
            "Severity: {}  CVSS: {:.1} ({})  Source: {}",
            f.severity,
            f.semantic_cvss,
            cvss_band(f.semantic_cvss),
            f.source
        ),
        format!("CVE: {}  CWE: {}", opt(&f.cve), opt(&f.cwe)),
        format!("Classification: {}", opt(&f.semantic_classification)),
        format!(
            "MITRE: {} / {}",
            opt(&f.mitre_tactic),
            opt(&f.mitre_technique)
        ),
    ];
    if let Some(cap) = &f.attack_capability {
        lines.push(format!("Attack capability: {cap}"));
    }
    if let Some(desc) = &f.description {
        lines.push(String::new());
        lines.push(desc.clone());
    }
    lines.join("\n")
}

pub fn render_classifications(rows: &[ClassificationCount]) -> String {
    if rows.is_empty() {
        return "No classification data.".to_string();
    }
    let rows: Vec<Vec<String>> = rows
        .iter()
        .take(8)
        .map(|c| {
            vec![
                c.classification.clone(),
                c.count.to_string(),
                format!("{:.1}", c.avg_cvss),
                cvss_band(c.avg_cvss).to_string(),
            ]
        })
        .collect();
    table(&["classification", "count", "avg cvss", "band"], &rows).join("\n")
}

pub fn render_sources(rows: &[SourceCount]) -> String {
    if rows.is_empty() {
        return "No scanner data.".to_string();
    }
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|s| {
            vec![
                s.source.clone(),
                s.count.to_string(),
                s.critical.to_string(),
                s.high.to_string(),
            ]
        })
        .collect();
    table(&["source", "findings", "critical", "high"], &rows).join("\n")
}

/// Techniques grouped by tactic, in first-seen tactic order, with a heat bar.
pub fn render_mitre(rows: &[MitreCount]) -> String {
    if rows.is_empty() {
        return "No MITRE data available".to_string();
    }
    let mut tactics: Vec<(&str, Vec<&MitreCount>)> = Vec::new();
    for row in rows {
        match tactics.iter_mut().find(|(t, _)| *t == row.tactic) {
            Some((_, group)) => group.push(row),
            None => tactics.push((row.tactic.as_str(), vec![row])),
        }
    }
    let mut lines = Vec::new();
    for (tactic, techniques) in tactics {
        lines.push(tactic.to_string());
        for t in techniques {
            let heat = 1 + (mitre_intensity(t.count) * 4.0).round() as usize;
            lines.push(format!("  {:<5} {} ({})", "#".repeat(heat), t.technique, t.count));
        }
    }
    lines.join("\n")
}

pub fn render_top_vulnerabilities(rows: &[TopVulnerability]) -> String {
    if rows.is_empty() {
        return "No vulnerabilities recorded.".to_string();
    }
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|v| {
            vec![
                clip(&v.title, TITLE_WIDTH),
                v.severity.clone(),
                v.count.to_string(),
                format!("{:.1}", v.avg_cvss),
            ]
        })
        .collect();
    table(&["title", "severity", "count", "avg cvss"], &rows).join("\n")
}

pub fn render_reports(rows: &[ReportSummary]) -> String {
    if rows.is_empty() {
        return "No reports yet.".to_string();
    }
    let rows: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            vec![
                r.report_id.clone(),
                r.asset_id.clone().unwrap_or_default(),
                r.title.clone(),
                format_date_opt(r.created_at.as_deref()),
            ]
        })
        .collect();
    table(&["id", "asset", "title", "created"], &rows).join("\n")
}

pub fn render_report(report: &Report) -> String {
    let mut lines = Vec::new();
    if let Some(asset) = &report.asset {
        lines.push(format!("Report for {}", asset.primary_identifier));
    }
    lines.push(format!("Scan date: {}", format_date_opt(report.scan_date.as_deref())));
    lines.push(format!(
        "Findings: {}  ({})",
        report.total_findings,
        severity_badges(&report.severity_summary)
    ));
    if !report.top_findings.is_empty() {
        lines.push(String::new());
        lines.push(render_findings(&report.top_findings));
    }
    if let Some(content) = &report.content {
        lines.push(String::new());
        lines.push(content.clone());
    }
    lines.join("\n")
}

pub fn render_scan(handle: &ScanHandle) -> String {
    let mut lines = vec![format!(
        "Scan {} on {}: {}",
        handle.id, handle.target, handle.status
    )];
    if let Some(err) = &handle.error {
        lines.push(format!("Error: {err}"));
    }
    lines.extend(handle.output.iter().map(|l| format!("  {l}")));
    lines.join("\n")
}

fn panel<T>(title: &str, panel: &Panel<T>, body: impl Fn(&T) -> String) -> String {
    let content = match panel {
        Panel::Loaded(v) => body(v),
        Panel::Failed(msg) => msg.clone(),
    };
    format!("== {title}\n{content}")
}

pub fn render_dashboard(view: &DashboardView) -> String {
    let scope = view.asset_filter.as_deref().unwrap_or("all assets");
    [
        format!("Dashboard ({scope})"),
        panel("Overview", &view.stats, render_stats),
        panel("Severity", &view.severity, |d| {
            if d.is_empty() {
                "No findings.".to_string()
            } else {
                severity_badges(d)
            }
        }),
        panel("Classifications", &view.classifications, |c| {
            render_classifications(c)
        }),
        panel("Scanners", &view.sources, |s| render_sources(s)),
        panel("MITRE ATT&CK", &view.mitre, |m| render_mitre(m)),
        panel("Recent assets", &view.assets, |a| {
            render_assets(&a[..a.len().min(5)])
        }),
        panel("Findings", &view.findings, |f| render_findings(f)),
    ]
    .join("\n\n")
}
