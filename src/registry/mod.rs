//! OCI registry access: tag listing, digest resolution, pulls and login.
//!
//! A client is constructed per reconciliation and dropped with it, so
//! credentials never outlive the run that resolved them.

use std::collections::BTreeMap;
use std::str::FromStr;

use oci_distribution::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference, RegistryOperation};
use thiserror::Error;
use tracing::debug;

use crate::models::{OCIRepositoryRef, OCI_REPOSITORY_PREFIX};

/// Layer media types accepted when pulling artifacts.
const ACCEPTED_MEDIA_TYPES: [&str; 5] = [
    "application/vnd.cncf.helm.chart.content.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.oci.image.layer.v1.tar",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
    "application/octet-stream",
];

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid OCI URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("registry operation failed: {0}")]
    Distribution(#[from] oci_distribution::errors::OciDistributionError),

    #[error("no match found for semver: {0}")]
    NoSemverMatch(String),

    #[error("semver '{expr}' parse error: {source}")]
    InvalidSemver {
        expr: String,
        source: semver::Error,
    },
}

/// TLS material from a cert secret.
#[derive(Debug, Clone, Default)]
pub struct TlsCertificateSet {
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
}

/// Single-use client for one reconciliation.
pub struct RegistryClient {
    client: Client,
    auth: RegistryAuth,
}

/// A pulled OCI artifact: manifest annotations plus its layers.
pub struct PulledArtifact {
    pub digest: String,
    pub annotations: Option<BTreeMap<String, String>>,
    pub layers: Vec<PulledLayer>,
}

pub struct PulledLayer {
    pub media_type: String,
    pub data: Vec<u8>,
    pub annotations: Option<BTreeMap<String, String>>,
}

impl RegistryClient {
    pub fn new(insecure: bool, certs: Option<&TlsCertificateSet>) -> Self {
        let mut config = ClientConfig {
            protocol: ClientProtocol::Https,
            accept_invalid_certificates: insecure,
            ..Default::default()
        };
        if let Some(certs) = certs {
            if let Some(ca) = &certs.ca_cert {
                config.extra_root_certificates.push(Certificate {
                    encoding: CertificateEncoding::Pem,
                    data: ca.clone(),
                });
            }
        }
        Self {
            client: Client::new(config),
            auth: RegistryAuth::Anonymous,
        }
    }

    /// Uses basic credentials for subsequent operations.
    pub fn with_basic_auth(&mut self, username: impl Into<String>, password: impl Into<String>) {
        self.auth = RegistryAuth::Basic(username.into(), password.into());
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self.auth, RegistryAuth::Anonymous)
    }

    /// Performs the registry token handshake for the repository, validating
    /// the configured credentials.
    pub async fn login(&mut self, repo: &str) -> Result<(), RegistryError> {
        let reference = parse_reference(repo)?;
        self.client
            .auth(&reference, &self.auth, RegistryOperation::Pull)
            .await?;
        debug!(repo, "registry login succeeded");
        Ok(())
    }

    /// Lists all tags of the repository.
    pub async fn list_tags(&mut self, repo: &str) -> Result<Vec<String>, RegistryError> {
        let reference = parse_reference(repo)?;
        let response = self
            .client
            .list_tags(&reference, &self.auth, None, None)
            .await?;
        debug!(repo, count = response.tags.len(), "listed registry tags");
        Ok(response.tags)
    }

    /// Resolves the manifest digest of the reference, returned as bare hex.
    pub async fn digest(&mut self, reference: &str) -> Result<String, RegistryError> {
        let reference = parse_reference(reference)?;
        let digest = self
            .client
            .fetch_manifest_digest(&reference, &self.auth)
            .await?;
        Ok(strip_digest_scheme(&digest).to_string())
    }

    /// Pulls the artifact manifest and layer contents.
    pub async fn pull(&mut self, reference: &str) -> Result<PulledArtifact, RegistryError> {
        let reference = parse_reference(reference)?;
        let image = self
            .client
            .pull(&reference, &self.auth, ACCEPTED_MEDIA_TYPES.to_vec())
            .await?;

        let annotations = image
            .manifest
            .as_ref()
            .and_then(|m| m.annotations.clone())
            .map(|m| m.into_iter().collect::<BTreeMap<_, _>>());
        let digest = image
            .digest
            .as_deref()
            .map(|d| strip_digest_scheme(d).to_string())
            .unwrap_or_default();

        Ok(PulledArtifact {
            digest,
            annotations,
            layers: image
                .layers
                .into_iter()
                .map(|l| PulledLayer {
                    media_type: l.media_type,
                    data: l.data,
                    annotations: l
                        .annotations
                        .map(|a| a.into_iter().collect::<BTreeMap<_, _>>()),
                })
                .collect(),
        })
    }
}

fn parse_reference(value: &str) -> Result<Reference, RegistryError> {
    Reference::from_str(value).map_err(|err| RegistryError::InvalidUrl {
        url: value.to_string(),
        message: err.to_string(),
    })
}

/// Validates an `oci://` URL and returns the bare `host/repository` part.
/// The URL must not carry a tag or digest.
pub fn parse_repository_url(url: &str) -> Result<String, RegistryError> {
    let stripped = url
        .strip_prefix(OCI_REPOSITORY_PREFIX)
        .ok_or_else(|| RegistryError::InvalidUrl {
            url: url.to_string(),
            message: "URL must be in format 'oci://<domain>/<org>/<repo>'".to_string(),
        })?;

    if let Some((_, tag)) = stripped.rsplit_once(':') {
        if !tag.contains('/') {
            return Err(RegistryError::InvalidUrl {
                url: url.to_string(),
                message: format!("URL must not contain a tag; remove ':{}'", tag),
            });
        }
    }
    if stripped.contains('@') {
        return Err(RegistryError::InvalidUrl {
            url: url.to_string(),
            message: "URL must not contain a digest".to_string(),
        });
    }

    let reference = parse_reference(stripped)?;
    Ok(format!("{}/{}", reference.registry(), reference.repository()))
}

/// The reference the repository spec selects, by priority
/// digest > semVer > tag > implicit `latest`. Returns the full pull
/// reference and the tag it resolves through, when there is one.
pub async fn resolve_reference(
    client: &mut RegistryClient,
    repo: &str,
    spec: Option<&OCIRepositoryRef>,
) -> Result<(String, Option<String>), RegistryError> {
    if let Some(spec) = spec {
        if let Some(digest) = spec.digest.as_deref().filter(|d| !d.is_empty()) {
            return Ok((format!("{}@{}", repo, digest), None));
        }
        if let Some(expr) = spec.sem_ver.as_deref().filter(|s| !s.is_empty()) {
            let tags = client.list_tags(repo).await?;
            let tag = pick_semver_tag(&tags, expr)?
                .ok_or_else(|| RegistryError::NoSemverMatch(expr.to_string()))?;
            return Ok((format!("{}:{}", repo, tag), Some(tag)));
        }
        if let Some(tag) = spec.tag.as_deref().filter(|t| !t.is_empty()) {
            return Ok((format!("{}:{}", repo, tag), Some(tag.to_string())));
        }
    }
    Ok((format!("{}:latest", repo), Some("latest".to_string())))
}

/// Picks the highest tag matching the constraint. Tags that do not parse as
/// semantic versions are skipped. Deterministic for any tag order.
pub fn pick_semver_tag(tags: &[String], expr: &str) -> Result<Option<String>, RegistryError> {
    let constraint = parse_constraint(expr)?;

    let mut matching: Vec<(semver::Version, &String)> = tags
        .iter()
        .filter_map(|t| {
            semver::Version::parse(t.trim_start_matches('v'))
                .ok()
                .map(|v| (v, t))
        })
        .filter(|(v, _)| constraint.matches(v))
        .collect();

    matching.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(matching.first().map(|(_, t)| (*t).clone()))
}

/// Parses a version constraint, accepting both comma- and space-separated
/// comparators (`">=6.0 <7.0"` and `">=6.0, <7.0"`).
fn parse_constraint(expr: &str) -> Result<semver::VersionReq, RegistryError> {
    match semver::VersionReq::parse(expr) {
        Ok(req) => Ok(req),
        Err(first_err) => {
            let normalized = expr.split_whitespace().collect::<Vec<_>>().join(", ");
            semver::VersionReq::parse(&normalized).map_err(|_| RegistryError::InvalidSemver {
                expr: expr.to_string(),
                source: first_err,
            })
        }
    }
}

/// Canonical artifact revision: `[tag "/"] digestHex`.
pub fn revision_for(tag: Option<&str>, digest_hex: &str) -> String {
    match tag {
        Some(tag) if !tag.is_empty() => format!("{}/{}", tag, digest_hex),
        _ => digest_hex.to_string(),
    }
}

/// The digest part of a revision string.
pub fn digest_from_revision(revision: &str) -> &str {
    revision.rsplit('/').next().unwrap_or(revision)
}

fn strip_digest_scheme(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}
