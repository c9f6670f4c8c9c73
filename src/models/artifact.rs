use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Artifact is the output of a successful source reconciliation: an
/// immutable tarball in storage, addressable by URL.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Relative file path of the artifact within the storage root.
    pub path: String,

    /// HTTP address of the artifact on the storage host.
    pub url: String,

    /// Canonical identifier of the artifact content: a chart version, an
    /// OCI `tag/digest` pair, or a source revision.
    pub revision: String,

    /// SHA256 checksum of the artifact file, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Last time the artifact file was updated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub last_update_time: Option<DateTime<Utc>>,

    /// Size of the artifact file in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,

    /// Upstream metadata, such as OCI manifest annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
}

impl Artifact {
    pub fn has_revision(&self, revision: &str) -> bool {
        self.revision == revision
    }
}

/// True when the optional artifact carries the given revision.
pub fn has_revision(artifact: Option<&Artifact>, revision: &str) -> bool {
    artifact.map(|a| a.has_revision(revision)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_revision_handles_missing_artifact() {
        assert!(!has_revision(None, "6.2.0"));

        let artifact = Artifact {
            revision: "6.2.0".to_string(),
            ..Default::default()
        };
        assert!(has_revision(Some(&artifact), "6.2.0"));
        assert!(!has_revision(Some(&artifact), "6.2.1"));
    }
}
