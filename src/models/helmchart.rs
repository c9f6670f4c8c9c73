use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, HasConditions};
use crate::models::artifact::Artifact;
use crate::models::VerificationSpec;

/// HelmChart declares a chart to be materialized from a referenced source.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "source.charthouse.dev",
    version = "v1",
    kind = "HelmChart",
    plural = "helmcharts",
    shortname = "hc",
    namespaced,
    status = "HelmChartStatus",
    printcolumn = r#"{"name":"Chart", "type":"string", "jsonPath":".spec.chart"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Source", "type":"string", "jsonPath":".spec.sourceRef.name"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartSpec {
    /// Name or path of the chart. A name for repository sources, a path
    /// within the source artifact for Git and Bucket sources.
    pub chart: String,

    /// SemVer constraint or fixed version. Latest when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Reference to the source the chart is available at.
    pub source_ref: ChartSourceReference,

    /// Interval at which to check the source for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// What triggers a rebuild of the chart.
    #[serde(default)]
    pub reconcile_strategy: ReconcileStrategy,

    /// Alternative values files to merge into the chart, relative to the
    /// chart root. Missing files are a build failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values_files: Vec<String>,

    /// Verification of the chart's OCI signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerificationSpec>,

    /// Pause reconciliation of this object.
    #[serde(default)]
    pub suspend: bool,
}

/// Reference to a source object in the same namespace.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChartSourceReference {
    /// Kind of the source: HelmRepository, GitRepository or Bucket.
    pub kind: String,
    pub name: String,
}

/// What drives new chart builds.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum ReconcileStrategy {
    /// Rebuild only when the chart version changes.
    #[default]
    ChartVersion,
    /// Rebuild whenever the upstream source revision changes.
    Revision,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmChartStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Revision of the upstream source artifact last seen by the builder.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_source_artifact_revision: Option<String>,

    /// Chart name last built, used to detect chart renames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_chart_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// URL of the `latest.tar.gz` symlink for this object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl HasConditions for HelmChart {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HelmChart {
    pub fn artifact(&self) -> Option<&Artifact> {
        self.status.as_ref().and_then(|s| s.artifact.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec: HelmChartSpec = serde_yaml::from_str(
            r#"
chart: podinfo
sourceRef:
  kind: HelmRepository
  name: podinfo
"#,
        )
        .unwrap();

        assert_eq!(spec.chart, "podinfo");
        assert_eq!(spec.reconcile_strategy, ReconcileStrategy::ChartVersion);
        assert!(spec.values_files.is_empty());
        assert!(!spec.suspend);
        assert!(spec.verify.is_none());
    }

    #[test]
    fn revision_strategy_round_trips() {
        let spec: HelmChartSpec = serde_yaml::from_str(
            r#"
chart: ./charts/app
version: ">=6.0 <7.0"
reconcileStrategy: Revision
valuesFiles: ["override.yaml"]
sourceRef:
  kind: GitRepository
  name: app
"#,
        )
        .unwrap();

        assert_eq!(spec.reconcile_strategy, ReconcileStrategy::Revision);
        assert_eq!(spec.values_files, vec!["override.yaml"]);
        assert_eq!(spec.source_ref.kind, "GitRepository");
    }
}
