pub mod artifact;
pub mod bucket;
pub mod gitrepository;
pub mod helmchart;
pub mod helmrepository;
pub mod ocirepository;
pub mod source;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use artifact::Artifact;
pub use bucket::{Bucket, BucketSpec, BucketStatus};
pub use gitrepository::{GitRepository, GitRepositorySpec, GitRepositoryStatus};
pub use helmchart::{
    ChartSourceReference, HelmChart, HelmChartSpec, HelmChartStatus, ReconcileStrategy,
};
pub use helmrepository::{
    HelmRepository, HelmRepositorySpec, HelmRepositoryStatus, HELM_REPOSITORY_TYPE_OCI,
};
pub use ocirepository::{
    OCILayerSelector, OCIRepository, OCIRepositoryRef, OCIRepositorySpec, OCIRepositoryStatus,
    LAYER_OPERATION_COPY, LAYER_OPERATION_EXTRACT, OCI_REPOSITORY_PREFIX,
};
pub use source::{Source, SourceKind, UnsupportedSourceKind};

/// Finalizer set on all reconciled source objects.
pub const SOURCE_FINALIZER: &str = "source.charthouse.dev/finalizer";

/// Annotation requesting an out-of-band reconciliation. The value is
/// mirrored to `status.lastHandledReconcileAt` once handled.
pub const RECONCILE_REQUESTED_ANNOTATION: &str = "reconcile.toolkit/requestedAt";

/// Reference to a Secret in the same namespace.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct SecretReference {
    pub name: String,
}

/// Signature verification settings.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VerificationSpec {
    /// Verification provider; only "cosign" is supported.
    pub provider: String,

    /// Secret with trusted public keys in entries ending `.pub`. Keyless
    /// verification is attempted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretReference>,
}
