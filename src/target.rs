use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{Context, Result};
use ipnet::IpNet;
use reqwest::Url;

use crate::error::TargetError;

/// What kind of thing a scan target names. Informational only: the
/// backend decides what it can scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetKind {
    Ip(IpAddr),
    Network(IpNet),
    Url(Url),
    /// Hostname, scheme-less URL, range or anything else the backend interprets.
    Other,
}

/// A scan target. `as_str` is what gets sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    raw: String,
    kind: TargetKind,
}

impl Target {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn kind(&self) -> &TargetKind {
        &self.kind
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Accept any non-blank target, trimmed. An empty value is rejected
/// before anything touches the network; everything else is classified
/// and left for the backend to accept or refuse.
pub fn parse_target(input: &str) -> Result<Target, TargetError> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err(TargetError::Empty);
    }
    Ok(Target {
        raw: raw.to_string(),
        kind: classify(raw),
    })
}

fn classify(raw: &str) -> TargetKind {
    if raw.contains("://") {
        if let Ok(url) = Url::parse(raw) {
            if url.host_str().is_some_and(|h| !h.is_empty()) {
                return TargetKind::Url(url);
            }
        }
        return TargetKind::Other;
    }
    if let Ok(net) = raw.parse::<IpNet>() {
        return TargetKind::Network(net);
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return TargetKind::Ip(ip);
    }
    // `10.0.0.1:80`, `[::1]:8080`
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return TargetKind::Ip(addr.ip());
    }
    TargetKind::Other
}

/// Cut a trailing comment: `#` at the start of the line or after whitespace.
/// A `#` inside a target (URL fragment) is kept.
fn strip_comment(line: &str) -> &str {
    let mut prev_ws = true;
    for (i, c) in line.char_indices() {
        if c == '#' && prev_ws {
            return &line[..i];
        }
        prev_ws = c.is_whitespace();
    }
    line
}

/// Parse a targets file: one target per line, `#` starts a comment, blank
/// lines ignored, duplicates dropped keeping first appearance.
pub fn parse_targets_str(s: &str) -> Vec<Target> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();

    for raw_line in s.lines() {
        let Ok(target) = parse_target(strip_comment(raw_line)) else {
            continue;
        };
        if seen.insert(target.raw.clone()) {
            out.push(target);
        }
    }

    out
}

pub fn load_targets_from_path(path: impl AsRef<Path>) -> Result<Vec<Target>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read targets file: {}", path.as_ref().display()))?;
    Ok(parse_targets_str(&content))
}
