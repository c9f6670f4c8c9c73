use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{Condition, HasConditions};
use crate::models::artifact::Artifact;
use crate::models::{SecretReference, VerificationSpec};

/// URL scheme prefix for OCI repositories.
pub const OCI_REPOSITORY_PREFIX: &str = "oci://";

pub const LAYER_OPERATION_EXTRACT: &str = "extract";
pub const LAYER_OPERATION_COPY: &str = "copy";

/// OCIRepository tracks an artifact stored in an OCI registry.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "source.charthouse.dev",
    version = "v1",
    kind = "OCIRepository",
    plural = "ocirepositories",
    shortname = "ocirepo",
    namespaced,
    status = "OCIRepositoryStatus",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositorySpec {
    /// URL in the format `oci://<domain>/<org>/<repo>`, without a tag.
    pub url: String,

    /// Which artifact revision to pull. Defaults to the `latest` tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<OCIRepositoryRef>,

    /// Which layer of the artifact to persist, and how.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_selector: Option<OCILayerSelector>,

    /// Cloud provider for automatic authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Reference to a Secret with registry credentials
    /// (kubernetes.io/dockerconfigjson or basic auth keys).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,

    /// Service account whose image pull secrets are used for
    /// authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Reference to a Secret with `caCert`, `clientCert` and `clientKey`
    /// entries for TLS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_secret_ref: Option<SecretReference>,

    /// Verification of the artifact signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerificationSpec>,

    /// Ignore patterns in .gitignore format, applied when archiving
    /// extracted layer content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore: Option<String>,

    /// Skip TLS verification when connecting to the registry.
    #[serde(default)]
    pub insecure: bool,

    /// Timeout for registry operations, e.g. "60s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Interval at which to check the registry for updates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// Pause reconciliation of this object.
    #[serde(default)]
    pub suspend: bool,
}

/// Selects the artifact revision: digest wins over semVer, semVer over tag.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositoryRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sem_ver: Option<String>,

    /// Digest in the format `sha256:<hex>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OCILayerSelector {
    /// Media type of the layer to select. First layer when empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// "extract" (default) untars the layer; "copy" stores it verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OCIRepositoryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,

    /// Ignore patterns observed when the current artifact was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_ignore: Option<String>,

    /// Layer selector observed when the current artifact was built.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_layer_selector: Option<OCILayerSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

impl HasConditions for OCIRepository {
    fn conditions(&self) -> &[Condition] {
        self.status.as_ref().map(|s| s.conditions.as_slice()).unwrap_or(&[])
    }

    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.status.get_or_insert_with(Default::default).conditions
    }
}

impl OCIRepository {
    pub fn artifact(&self) -> Option<&Artifact> {
        self.status.as_ref().and_then(|s| s.artifact.as_ref())
    }

    /// The layer media type filter, empty when unset.
    pub fn layer_media_type(&self) -> &str {
        self.spec
            .layer_selector
            .as_ref()
            .and_then(|s| s.media_type.as_deref())
            .unwrap_or("")
    }

    /// The layer persistence operation, extract by default.
    pub fn layer_operation(&self) -> &str {
        self.spec
            .layer_selector
            .as_ref()
            .and_then(|s| s.operation.as_deref())
            .unwrap_or(LAYER_OPERATION_EXTRACT)
    }

    /// Whether the spec's content configuration drifted from what the
    /// current artifact was built with. A drift forces a rebuild even when
    /// the upstream revision is unchanged.
    pub fn content_config_changed(&self) -> bool {
        let status = match &self.status {
            Some(s) => s,
            None => return false,
        };
        if self.spec.ignore != status.observed_ignore {
            return true;
        }
        self.spec.layer_selector != status.observed_layer_selector
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo_with(spec: OCIRepositorySpec, status: Option<OCIRepositoryStatus>) -> OCIRepository {
        let mut repo = OCIRepository::new("test", spec);
        repo.status = status;
        repo
    }

    fn base_spec() -> OCIRepositorySpec {
        serde_yaml::from_str("url: oci://ghcr.io/org/manifests\n").unwrap()
    }

    #[test]
    fn layer_operation_defaults_to_extract() {
        let repo = repo_with(base_spec(), None);
        assert_eq!(repo.layer_operation(), LAYER_OPERATION_EXTRACT);
        assert_eq!(repo.layer_media_type(), "");
    }

    #[test]
    fn reference_priority_fields_parse() {
        let spec: OCIRepositorySpec = serde_yaml::from_str(
            r#"
url: oci://ghcr.io/org/manifests
reference:
  semVer: ">=1.0.0"
layerSelector:
  mediaType: application/vnd.cncf.helm.chart.content.v1.tar+gzip
  operation: copy
insecure: true
"#,
        )
        .unwrap();
        assert_eq!(spec.reference.unwrap().sem_ver.as_deref(), Some(">=1.0.0"));
        assert!(spec.insecure);
    }

    #[test]
    fn content_config_drift_detection() {
        let mut spec = base_spec();
        spec.ignore = Some("*.md".to_string());

        // Artifact was built with no ignore patterns.
        let repo = repo_with(
            spec.clone(),
            Some(OCIRepositoryStatus::default()),
        );
        assert!(repo.content_config_changed());

        // Observed state matches the spec.
        let repo = repo_with(
            spec.clone(),
            Some(OCIRepositoryStatus {
                observed_ignore: Some("*.md".to_string()),
                ..Default::default()
            }),
        );
        assert!(!repo.content_config_changed());
    }
}
