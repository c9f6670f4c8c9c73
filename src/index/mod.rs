//! Secondary indices for cross-resource change propagation.
//!
//! Two indices are maintained: HelmRepository URL to the repository object
//! (for dependency resolution), and `(source kind, source name)` to the
//! HelmCharts referencing it (for fan-out requeues when an upstream
//! revision changes).

use std::collections::{HashMap, HashSet};
use std::fmt;

use kube::ResourceExt;
use tokio::sync::RwLock;

use crate::models::{HelmChart, HelmRepository, SourceKind};

/// Namespace/name pair identifying an object of a known kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Default)]
struct IndexState {
    /// chart -> (source kind, source key) registration, for cleanup.
    chart_sources: HashMap<ObjectKey, (SourceKind, ObjectKey)>,
    /// (source kind, source key) -> charts referencing it.
    charts_by_source: HashMap<(SourceKind, ObjectKey), HashSet<ObjectKey>>,
    /// (namespace, normalized URL) -> HelmRepository key.
    repositories_by_url: HashMap<(String, String), ObjectKey>,
    /// chart -> upstream revision last observed by its reconciler.
    observed_revisions: HashMap<ObjectKey, String>,
}

/// Index over watched objects, driving dependent requeues.
#[derive(Default)]
pub struct ChangeIndex {
    state: RwLock<IndexState>,
}

impl ChangeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a chart under its source reference.
    pub async fn index_chart(&self, chart: &HelmChart) {
        let key = ObjectKey::new(chart.namespace().unwrap_or_default(), chart.name_any());
        let Ok(kind) = chart.spec.source_ref.kind.parse::<SourceKind>() else {
            // Unsupported kinds are surfaced by the reconciler; nothing to
            // index here.
            self.forget_chart(&key).await;
            return;
        };
        let source = ObjectKey::new(key.namespace.clone(), chart.spec.source_ref.name.clone());

        let mut state = self.state.write().await;
        if let Some(previous) = state.chart_sources.insert(key.clone(), (kind, source.clone())) {
            if let Some(set) = state.charts_by_source.get_mut(&previous) {
                set.remove(&key);
            }
        }
        state
            .charts_by_source
            .entry((kind, source))
            .or_default()
            .insert(key.clone());

        if let Some(revision) = chart
            .status
            .as_ref()
            .and_then(|s| s.observed_source_artifact_revision.clone())
        {
            state.observed_revisions.insert(key, revision);
        }
    }

    pub async fn forget_chart(&self, key: &ObjectKey) {
        let mut state = self.state.write().await;
        if let Some(registration) = state.chart_sources.remove(key) {
            if let Some(set) = state.charts_by_source.get_mut(&registration) {
                set.remove(key);
            }
        }
        state.observed_revisions.remove(key);
    }

    /// Registers a HelmRepository under its normalized URL.
    pub async fn index_repository(&self, repo: &HelmRepository) {
        let key = ObjectKey::new(repo.namespace().unwrap_or_default(), repo.name_any());
        let url = normalize_url(&repo.spec.url);
        let mut state = self.state.write().await;
        state
            .repositories_by_url
            .insert((key.namespace.clone(), url), key);
    }

    pub async fn forget_repository(&self, key: &ObjectKey) {
        let mut state = self.state.write().await;
        state.repositories_by_url.retain(|_, v| v != key);
    }

    /// Finds the HelmRepository declaring the URL in the namespace.
    pub async fn repository_by_url(&self, namespace: &str, url: &str) -> Option<ObjectKey> {
        let state = self.state.read().await;
        state
            .repositories_by_url
            .get(&(namespace.to_string(), normalize_url(url)))
            .cloned()
    }

    /// Records the upstream revision a chart reconciliation observed.
    pub async fn record_observed_revision(&self, chart: &ObjectKey, revision: &str) {
        let mut state = self.state.write().await;
        state
            .observed_revisions
            .insert(chart.clone(), revision.to_string());
    }

    /// Charts referencing the source whose observed revision differs from
    /// the source's new revision. These are the keys to requeue.
    pub async fn charts_for_source_change(
        &self,
        kind: SourceKind,
        source: &ObjectKey,
        new_revision: &str,
    ) -> Vec<ObjectKey> {
        let state = self.state.read().await;
        let Some(charts) = state.charts_by_source.get(&(kind, source.clone())) else {
            return Vec::new();
        };
        charts
            .iter()
            .filter(|key| {
                state.observed_revisions.get(*key).map(String::as_str) != Some(new_revision)
            })
            .cloned()
            .collect()
    }
}

fn normalize_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
