use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, HasConditions};
use crate::models::artifact::Artifact;
use crate::models::SecretReference;

pub const HELM_REPOSITORY_TYPE_DEFAULT: &str = "default";
pub const HELM_REPOSITORY_TYPE_OCI: &str = "oci";

/// HelmRepository defines a Helm chart repository, either a classic HTTP
/// repository with an index.yaml or an OCI registry namespace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "source.charthouse.dev",
    version = "v1",
    kind = "HelmRepository",
    plural = "helmrepositories",
    shortname = "hr",
    namespaced,
    status = "HelmRepositoryStatus",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositorySpec {
    /// URL of the repository: HTTP(S) for classic repositories, `oci://`
    /// for OCI registries.
    pub url: String,

    /// Interval at which to check the repository for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Timeout for repository operations, e.g. "60s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Reference to a Secret containing authentication credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// Whether to pass credentials to hosts other than the URL host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_credentials: Option<bool>,

    /// Repository type: "default" or "oci".
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "type")]
    pub repository_type: Option<String>,

    /// Cloud provider for automatic OCI authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Pause reconciliation of this object.
    #[serde(default)]
    pub suspend: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HelmRepositoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl HasConditions for HelmRepository {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl HelmRepository {
    pub fn artifact(&self) -> Option<&Artifact> {
        self.status.as_ref().and_then(|s| s.artifact.as_ref())
    }

    pub fn is_oci(&self) -> bool {
        self.spec.repository_type.as_deref() == Some(HELM_REPOSITORY_TYPE_OCI)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oci_type_detection() {
        let spec: HelmRepositorySpec = serde_yaml::from_str(
            r#"
url: oci://ghcr.io/org/charts
type: oci
provider: aws
"#,
        )
        .unwrap();
        assert_eq!(spec.repository_type.as_deref(), Some("oci"));
        assert_eq!(spec.provider.as_deref(), Some("aws"));
    }

    #[test]
    fn classic_repository_defaults() {
        let spec: HelmRepositorySpec =
            serde_yaml::from_str("url: https://charts.example.com\n").unwrap();
        assert!(spec.repository_type.is_none());
        assert!(spec.secret_ref.is_none());
        assert!(!spec.suspend);
    }
}
