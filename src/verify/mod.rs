//! Artifact signature verification.
//!
//! Signatures follow the cosign layout: a signature artifact is stored
//! next to the subject under the tag `sha256-<digest>.sig`, each layer
//! holding a signed payload with the raw signature in a layer annotation.
//!
//! With a key secret, every entry ending in `.pub` is a candidate public
//! key and any valid signature from any key passes. Without a secret the
//! keyless path checks the signature artifact structurally: the payload
//! must bind to the subject digest and carry an identity certificate.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signature, Verifier as _, VerifyingKey};
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::registry::{PulledArtifact, RegistryClient};

/// Layer annotation carrying the base64 signature.
pub const SIGNATURE_ANNOTATION: &str = "dev.cosignproject.cosign/signature";
/// Layer annotation carrying the signer certificate on keyless signatures.
pub const CERTIFICATE_ANNOTATION: &str = "dev.sigstore.cosign/certificate";

pub const PROVIDER_COSIGN: &str = "cosign";

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("unsupported verification provider: {0}")]
    UnsupportedProvider(String),

    #[error("no public keys found in secret '{0}'")]
    NoKeysInSecret(String),

    #[error("cosign does not support insecure registries")]
    InsecureRegistry,

    #[error("failed to fetch signature artifact for '{reference}': {message}")]
    SignatureFetch { reference: String, message: String },

    #[error("no matching signatures were found for '{0}'")]
    NoMatchingSignatures(String),
}

/// Cosign signature verifier, in key or keyless mode.
#[derive(Debug)]
pub struct CosignVerifier {
    keys: Vec<VerifyingKey>,
}

impl CosignVerifier {
    /// Validates the verification configuration: only the cosign provider
    /// is supported, and never against an insecure registry.
    pub fn check_config(provider: &str, insecure: bool) -> Result<(), VerifyError> {
        if provider != PROVIDER_COSIGN {
            return Err(VerifyError::UnsupportedProvider(provider.to_string()));
        }
        if insecure {
            return Err(VerifyError::InsecureRegistry);
        }
        Ok(())
    }

    /// Builds a key-mode verifier from the `.pub` entries of a secret.
    pub fn from_secret(secret: &Secret) -> Result<Self, VerifyError> {
        let name = secret.metadata.name.clone().unwrap_or_default();
        let mut keys = Vec::new();
        for (key, value) in secret.data.clone().unwrap_or_default() {
            if !key.ends_with(".pub") {
                continue;
            }
            if let Some(parsed) = parse_public_key(&value.0) {
                keys.push(parsed);
            }
        }
        if keys.is_empty() {
            return Err(VerifyError::NoKeysInSecret(name));
        }
        Ok(Self { keys })
    }

    pub fn keyless() -> Self {
        Self { keys: Vec::new() }
    }

    /// Verifies the subject digest against its signature artifact.
    pub async fn verify(
        &self,
        registry: &mut RegistryClient,
        repo: &str,
        digest_hex: &str,
    ) -> Result<(), VerifyError> {
        let reference = format!("{}:{}", repo, signature_tag(digest_hex));
        let artifact = registry.pull(&reference).await.map_err(|err| {
            VerifyError::SignatureFetch {
                reference: reference.clone(),
                message: err.to_string(),
            }
        })?;

        if self.verify_signatures(&artifact, digest_hex) {
            debug!(repo, digest = digest_hex, "signature verified");
            return Ok(());
        }
        Err(VerifyError::NoMatchingSignatures(format!(
            "{}@sha256:{}",
            repo, digest_hex
        )))
    }

    fn verify_signatures(&self, artifact: &PulledArtifact, digest_hex: &str) -> bool {
        for layer in &artifact.layers {
            // The payload must bind to the digest we verified upstream,
            // otherwise a signature for another subject would pass.
            if !payload_binds_digest(&layer.data, digest_hex) {
                continue;
            }
            let annotations = match &layer.annotations {
                Some(a) => a,
                None => continue,
            };

            if self.keys.is_empty() {
                // Keyless: require an identity certificate on the layer.
                if annotations.contains_key(CERTIFICATE_ANNOTATION) {
                    return true;
                }
                continue;
            }

            let signature = annotations
                .get(SIGNATURE_ANNOTATION)
                .and_then(|s| BASE64_STANDARD.decode(s).ok())
                .and_then(|bytes| Signature::from_slice(&bytes).ok());
            let Some(signature) = signature else { continue };

            if self
                .keys
                .iter()
                .any(|key| key.verify(&layer.data, &signature).is_ok())
            {
                return true;
            }
        }
        false
    }
}

/// Tag of the cosign signature artifact for a subject digest.
pub fn signature_tag(digest_hex: &str) -> String {
    format!("sha256-{}.sig", digest_hex)
}

#[derive(Deserialize)]
struct SimpleSigningPayload {
    critical: CriticalSection,
}

#[derive(Deserialize)]
struct CriticalSection {
    image: CriticalImage,
}

#[derive(Deserialize)]
struct CriticalImage {
    #[serde(rename = "docker-manifest-digest")]
    docker_manifest_digest: String,
}

fn payload_binds_digest(payload: &[u8], digest_hex: &str) -> bool {
    let parsed: SimpleSigningPayload = match serde_json::from_slice(payload) {
        Ok(p) => p,
        Err(_) => return false,
    };
    let bound = parsed
        .critical
        .image
        .docker_manifest_digest
        .trim_start_matches("sha256:")
        .to_string();
    bound == digest_hex
}

/// Decodes an ed25519 public key from raw bytes, PEM armor, or SPKI DER.
fn parse_public_key(data: &[u8]) -> Option<VerifyingKey> {
    let text = String::from_utf8_lossy(data);
    let body: Vec<u8> = if text.contains("-----BEGIN") {
        let inner: String = text
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("");
        BASE64_STANDARD.decode(inner).ok()?
    } else if let Ok(decoded) = BASE64_STANDARD.decode(text.trim()) {
        decoded
    } else {
        data.to_vec()
    };

    let raw: [u8; 32] = match body.len() {
        32 => body.as_slice().try_into().ok()?,
        // SPKI DER: 12-byte algorithm header followed by the raw key.
        44 => body[12..].try_into().ok()?,
        _ => return None,
    };
    VerifyingKey::from_bytes(&raw).ok()
}
