//! Chart repositories the remote builder can pull from.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{BuildError, BuildErrorReason};
use crate::credentials::BasicCredentials;
use crate::registry::{pick_semver_tag, RegistryClient};
use crate::verify::CosignVerifier;

/// Media type of the chart content layer in Helm OCI artifacts.
pub const HELM_CHART_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

/// A chart version resolved against a repository.
#[derive(Debug, Clone)]
pub struct ResolvedChartVersion {
    pub name: String,
    pub version: String,
    /// Where to download the chart from: an absolute URL for HTTP
    /// repositories, a full OCI reference otherwise.
    pub location: String,
    /// Manifest digest for OCI charts, used for signature verification.
    pub digest_hex: Option<String>,
}

/// A repository charts can be resolved against and downloaded from.
#[async_trait]
pub trait ChartRepository: Send {
    /// Resolves a chart name and version constraint to a concrete version.
    async fn resolve(&mut self, name: &str, version: &str)
        -> Result<ResolvedChartVersion, BuildError>;

    /// Downloads the packaged chart.
    async fn download(&mut self, resolved: &ResolvedChartVersion) -> Result<Vec<u8>, BuildError>;

    /// Verifies the chart signature. Returns false when the repository has
    /// no verification support.
    async fn verify(&mut self, resolved: &ResolvedChartVersion) -> Result<bool, BuildError>;
}

/// Helm repository index.yaml.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    pub api_version: String,
    pub entries: HashMap<String, Vec<ChartIndexEntry>>,
    #[serde(default)]
    pub generated: Option<String>,
}

/// A single chart version entry in the index.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChartIndexEntry {
    pub name: String,
    pub version: String,
    pub urls: Vec<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub app_version: Option<String>,
}

/// Classic HTTP Helm repository with an index.yaml.
pub struct HttpChartRepository {
    url: String,
    client: reqwest::Client,
    credentials: Option<BasicCredentials>,
    /// Send credentials to hosts other than the repository host.
    pass_credentials: bool,
    index: Option<IndexFile>,
}

impl HttpChartRepository {
    pub fn new(
        url: &str,
        timeout: Duration,
        credentials: Option<BasicCredentials>,
    ) -> Result<Self, BuildError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("charthouse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| {
                BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("failed to create HTTP client: {}", err),
                )
            })?;
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client,
            credentials,
            pass_credentials: false,
            index: None,
        })
    }

    /// Injects an already-parsed index, bypassing the network fetch.
    pub fn with_index(mut self, index: IndexFile) -> Self {
        self.index = Some(index);
        self
    }

    /// Also sends credentials to download hosts other than the repository
    /// host.
    pub fn with_pass_credentials(mut self, pass: bool) -> Self {
        self.pass_credentials = pass;
        self
    }

    fn credentials_for(&self, location: &str) -> Option<&BasicCredentials> {
        let credentials = self.credentials.as_ref()?;
        if self.pass_credentials || host_of(location) == host_of(&self.url) {
            Some(credentials)
        } else {
            None
        }
    }

    async fn load_index(&mut self) -> Result<&IndexFile, BuildError> {
        if self.index.is_none() {
            let index_url = format!("{}/index.yaml", self.url);
            debug!(url = %index_url, "fetching repository index");

            let mut request = self.client.get(&index_url);
            if let Some(creds) = &self.credentials {
                request = request.basic_auth(&creds.username, Some(&creds.password));
            }
            let response = request.send().await.map_err(|err| {
                BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("failed to fetch index.yaml: {}", err),
                )
            })?;
            if !response.status().is_success() {
                return Err(BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("HTTP {} fetching index.yaml from {}", response.status(), index_url),
                ));
            }
            let body = response.text().await.map_err(|err| {
                BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("failed to read index.yaml response: {}", err),
                )
            })?;
            let index: IndexFile = serde_yaml::from_str(&body).map_err(|err| {
                BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("failed to parse index.yaml: {}", err),
                )
            })?;
            debug!(charts = index.entries.len(), "parsed repository index");
            self.index = Some(index);
        }
        self.index.as_ref().ok_or_else(|| {
            BuildError::new(BuildErrorReason::ChartPull, "repository index not loaded")
        })
    }
}

#[async_trait]
impl ChartRepository for HttpChartRepository {
    async fn resolve(
        &mut self,
        name: &str,
        version: &str,
    ) -> Result<ResolvedChartVersion, BuildError> {
        let base_url = self.url.clone();
        let index = self.load_index().await?;
        let entries = index.entries.get(name).ok_or_else(|| {
            BuildError::new(
                BuildErrorReason::ChartReference,
                format!("chart '{}' not found in repository index", name),
            )
        })?;

        let versions: Vec<String> = entries.iter().map(|e| e.version.clone()).collect();
        let constraint = if version.is_empty() { "*" } else { version };
        let picked = pick_semver_tag(&versions, constraint)
            .map_err(|err| BuildError::new(BuildErrorReason::ChartReference, err.to_string()))?
            .ok_or_else(|| {
                BuildError::new(
                    BuildErrorReason::ChartReference,
                    format!("no '{}' chart matching version '{}'", name, constraint),
                )
            })?;

        let entry = entries
            .iter()
            .find(|e| e.version == picked)
            .ok_or_else(|| {
                BuildError::new(
                    BuildErrorReason::ChartReference,
                    format!("index entry '{}' {} disappeared during resolution", name, picked),
                )
            })?;
        let url = entry.urls.first().ok_or_else(|| {
            BuildError::new(
                BuildErrorReason::ChartReference,
                format!("index entry '{}' {} has no download URL", name, picked),
            )
        })?;
        let location = if url.starts_with("http://") || url.starts_with("https://") {
            url.clone()
        } else {
            format!("{}/{}", base_url, url)
        };

        Ok(ResolvedChartVersion {
            name: name.to_string(),
            version: entry.version.clone(),
            location,
            digest_hex: None,
        })
    }

    async fn download(&mut self, resolved: &ResolvedChartVersion) -> Result<Vec<u8>, BuildError> {
        debug!(url = %resolved.location, "downloading chart");
        let mut request = self.client.get(&resolved.location);
        if let Some(creds) = self.credentials_for(&resolved.location) {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(|err| {
            BuildError::new(
                BuildErrorReason::ChartPull,
                format!("failed to download chart: {}", err),
            )
        })?;
        if !response.status().is_success() {
            return Err(BuildError::new(
                BuildErrorReason::ChartPull,
                format!("HTTP {} downloading chart from {}", response.status(), resolved.location),
            ));
        }
        let bytes = response.bytes().await.map_err(|err| {
            BuildError::new(
                BuildErrorReason::ChartPull,
                format!("failed to read chart response: {}", err),
            )
        })?;
        Ok(bytes.to_vec())
    }

    async fn verify(&mut self, _resolved: &ResolvedChartVersion) -> Result<bool, BuildError> {
        Ok(false)
    }
}

/// OCI registry namespace holding charts as OCI artifacts. A chart named
/// `podinfo` under `oci://ghcr.io/org/charts` lives at
/// `ghcr.io/org/charts/podinfo`.
pub struct OciChartRepository {
    repo: String,
    registry: RegistryClient,
    verifier: Option<CosignVerifier>,
}

impl OciChartRepository {
    pub fn new(repo: String, registry: RegistryClient) -> Self {
        Self {
            repo,
            registry,
            verifier: None,
        }
    }

    pub fn with_verifier(mut self, verifier: CosignVerifier) -> Self {
        self.verifier = Some(verifier);
        self
    }

    fn chart_repo(&self, name: &str) -> String {
        format!("{}/{}", self.repo, name)
    }
}

#[async_trait]
impl ChartRepository for OciChartRepository {
    async fn resolve(
        &mut self,
        name: &str,
        version: &str,
    ) -> Result<ResolvedChartVersion, BuildError> {
        let chart_repo = self.chart_repo(name);

        // Exact versions skip the tag listing round-trip.
        let tag = if !version.is_empty() && semver::Version::parse(version).is_ok() {
            version.to_string()
        } else {
            let tags = self.registry.list_tags(&chart_repo).await.map_err(|err| {
                BuildError::new(BuildErrorReason::ChartPull, err.to_string())
            })?;
            let constraint = if version.is_empty() { "*" } else { version };
            pick_semver_tag(&tags, constraint)
                .map_err(|err| BuildError::new(BuildErrorReason::ChartReference, err.to_string()))?
                .ok_or_else(|| {
                    BuildError::new(
                        BuildErrorReason::ChartReference,
                        format!("no '{}' chart matching version '{}'", name, constraint),
                    )
                })?
        };

        let reference = format!("{}:{}", chart_repo, tag);
        let digest = self
            .registry
            .digest(&reference)
            .await
            .map_err(|err| BuildError::new(BuildErrorReason::ChartPull, err.to_string()))?;

        Ok(ResolvedChartVersion {
            name: name.to_string(),
            version: tag.trim_start_matches('v').to_string(),
            location: reference,
            digest_hex: Some(digest),
        })
    }

    async fn download(&mut self, resolved: &ResolvedChartVersion) -> Result<Vec<u8>, BuildError> {
        let artifact = self
            .registry
            .pull(&resolved.location)
            .await
            .map_err(|err| BuildError::new(BuildErrorReason::ChartPull, err.to_string()))?;

        let layer = artifact
            .layers
            .iter()
            .find(|l| l.media_type == HELM_CHART_CONTENT_MEDIA_TYPE)
            .or_else(|| artifact.layers.first())
            .ok_or_else(|| {
                BuildError::new(
                    BuildErrorReason::ChartPull,
                    format!("no layers found in chart artifact '{}'", resolved.location),
                )
            })?;
        Ok(layer.data.clone())
    }

    async fn verify(&mut self, resolved: &ResolvedChartVersion) -> Result<bool, BuildError> {
        let verifier = match &self.verifier {
            Some(v) => v,
            None => return Ok(false),
        };
        let digest = resolved.digest_hex.as_deref().ok_or_else(|| {
            BuildError::new(
                BuildErrorReason::ChartVerification,
                "chart digest unknown, cannot verify signature",
            )
        })?;
        let chart_repo = self.chart_repo(&resolved.name);
        verifier
            .verify(&mut self.registry, &chart_repo, digest)
            .await
            .map_err(|err| BuildError::new(BuildErrorReason::ChartVerification, err.to_string()))?;
        Ok(true)
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    rest.split('/').next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_index() -> IndexFile {
        serde_yaml::from_str(
            r#"
apiVersion: v1
entries:
  podinfo:
    - name: podinfo
      version: 6.0.0
      urls: ["charts/podinfo-6.0.0.tgz"]
    - name: podinfo
      version: 6.1.3
      urls: ["charts/podinfo-6.1.3.tgz"]
    - name: podinfo
      version: 6.2.0
      urls: ["charts/podinfo-6.2.0.tgz"]
    - name: podinfo
      version: 7.0.0
      urls: ["charts/podinfo-7.0.0.tgz"]
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn resolve_applies_the_version_constraint() {
        let mut repo =
            HttpChartRepository::new("https://charts.example.com", Duration::from_secs(5), None)
                .unwrap()
                .with_index(sample_index());

        let resolved = repo.resolve("podinfo", ">=6.0 <7.0").await.unwrap();
        assert_eq!(resolved.version, "6.2.0");
        assert_eq!(
            resolved.location,
            "https://charts.example.com/charts/podinfo-6.2.0.tgz"
        );
    }

    #[tokio::test]
    async fn resolve_empty_constraint_takes_latest() {
        let mut repo =
            HttpChartRepository::new("https://charts.example.com/", Duration::from_secs(5), None)
                .unwrap()
                .with_index(sample_index());

        let resolved = repo.resolve("podinfo", "").await.unwrap();
        assert_eq!(resolved.version, "7.0.0");
    }

    #[tokio::test]
    async fn unknown_chart_is_a_reference_error() {
        let mut repo =
            HttpChartRepository::new("https://charts.example.com", Duration::from_secs(5), None)
                .unwrap()
                .with_index(sample_index());

        let err = repo.resolve("nginx", "*").await.unwrap_err();
        assert_eq!(err.reason, BuildErrorReason::ChartReference);
    }

    #[test]
    fn credentials_stay_on_the_repository_host_by_default() {
        let creds = BasicCredentials {
            username: "bot".to_string(),
            password: "tok".to_string(),
        };
        let repo =
            HttpChartRepository::new("https://charts.example.com", Duration::from_secs(5), Some(creds))
                .unwrap();

        assert!(repo
            .credentials_for("https://charts.example.com/podinfo-6.2.0.tgz")
            .is_some());
        assert!(repo.credentials_for("https://cdn.example.net/podinfo-6.2.0.tgz").is_none());

        let repo = repo.with_pass_credentials(true);
        assert!(repo.credentials_for("https://cdn.example.net/podinfo-6.2.0.tgz").is_some());
    }

    #[tokio::test]
    async fn no_matching_version_is_a_reference_error() {
        let mut repo =
            HttpChartRepository::new("https://charts.example.com", Duration::from_secs(5), None)
                .unwrap()
                .with_index(sample_index());

        let err = repo.resolve("podinfo", ">=8.0").await.unwrap_err();
        assert_eq!(err.reason, BuildErrorReason::ChartReference);
        assert!(err.to_string().contains(">=8.0"));
    }
}
