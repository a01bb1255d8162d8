use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::api::DashboardSource;
use crate::error::ApiError;
use crate::types::{
    Asset, ClassificationCount, DashboardStats, Finding, FindingQuery, MitreCount, SourceCount,
};

/// One dashboard panel: its data, or the placeholder shown when its fetch failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "data", rename_all = "snake_case")]
pub enum Panel<T> {
    Loaded(T),
    Failed(String),
}

impl<T> Panel<T> {
    pub fn loaded(&self) -> Option<&T> {
        match self {
            Panel::Loaded(v) => Some(v),
            Panel::Failed(_) => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Panel::Failed(_))
    }
}

impl<T> From<Result<T, ApiError>> for Panel<T> {
    fn from(res: Result<T, ApiError>) -> Self {
        match res {
            Ok(v) => Panel::Loaded(v),
            Err(e) => {
                warn!(error = %e, "panel failed to load");
                Panel::Failed(format!("Failed to load: {e}"))
            }
        }
    }
}

/// Every panel, fetched for one value of the asset filter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardView {
    pub asset_filter: Option<String>,
    pub stats: Panel<DashboardStats>,
    pub severity: Panel<BTreeMap<String, u64>>,
    pub classifications: Panel<Vec<ClassificationCount>>,
    pub sources: Panel<Vec<SourceCount>>,
    pub mitre: Panel<Vec<MitreCount>>,
    pub assets: Panel<Vec<Asset>>,
    pub findings: Panel<Vec<Finding>>,
}

/// The shared "current asset" filter all panels read.
#[derive(Debug, Clone, Default)]
struct ViewState {
    asset_filter: Option<String>,
    generation: u64,
}

/// Owns the dashboard's filter and refreshes all panels together.
///
/// The filter is replaced before anything is fetched. A refresh that
/// finishes after the filter changed again is dropped, so a view never
/// mixes panels fetched for different filters.
pub struct Dashboard {
    source: Arc<dyn DashboardSource>,
    state: Mutex<ViewState>,
    latest: Mutex<Option<DashboardView>>,
}

impl Dashboard {
    pub fn new(source: Arc<dyn DashboardSource>) -> Self {
        Self {
            source,
            state: Mutex::new(ViewState::default()),
            latest: Mutex::new(None),
        }
    }

    pub async fn asset_filter(&self) -> Option<String> {
        self.state.lock().await.asset_filter.clone()
    }

    /// Replace the asset filter, then refresh every panel for it.
    pub async fn set_asset_filter(&self, asset_id: Option<String>) -> Option<DashboardView> {
        {
            let mut st = self.state.lock().await;
            st.asset_filter = asset_id;
            st.generation += 1;
        }
        self.refresh().await
    }

    /// Re-fetch all panels for the current filter. `None` if superseded.
    pub async fn refresh(&self) -> Option<DashboardView> {
        let (filter, generation) = {
            let st = self.state.lock().await;
            (st.asset_filter.clone(), st.generation)
        };
        let asset = filter.as_deref();
        let query = FindingQuery::for_asset(asset);
        let src = &self.source;

        let (stats, severity, classifications, sources, mitre, assets, findings) = tokio::join!(
            src.dashboard_stats(asset),
            src.severity_distribution(asset),
            src.classification_breakdown(asset),
            src.source_breakdown(asset),
            src.mitre_mapping(asset),
            src.assets(),
            src.findings(&query),
        );

        let view = DashboardView {
            asset_filter: filter.clone(),
            stats: stats.into(),
            severity: severity.into(),
            classifications: classifications.into(),
            sources: sources.into(),
            mitre: mitre.into(),
            assets: assets.into(),
            findings: findings.into(),
        };

        // Hold the filter lock while publishing so a newer filter cannot slip in between.
        let st = self.state.lock().await;
        if st.generation != generation {
            debug!(?filter, "dropping superseded dashboard refresh");
            return None;
        }
        *self.latest.lock().await = Some(view.clone());
        drop(st);
        Some(view)
    }

    /// Last view that was applied.
    pub async fn latest(&self) -> Option<DashboardView> {
        self.latest.lock().await.clone()
    }
}
