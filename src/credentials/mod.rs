//! Registry credential resolution.
//!
//! Resolution order: explicit secret, then image pull secrets of a
//! referenced service account, then cloud provider login, then anonymous.
//! An unconfigured cloud provider is not an error; it falls through to
//! anonymous access.

use std::collections::BTreeMap;
use std::io::Write;
use std::str::FromStr;

use base64::prelude::{Engine as _, BASE64_STANDARD};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Api, Client};
use serde::Deserialize;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::debug;

use crate::models::SecretReference;
use crate::registry::TlsCertificateSet;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("secret '{secret}' is missing key '{key}'")]
    MissingKey { secret: String, key: String },

    #[error("invalid credential data in secret '{secret}': {message}")]
    InvalidData { secret: String, message: String },

    #[error("unconfigured provider '{0}'")]
    UnconfiguredProvider(String),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cloud providers for automatic registry login.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloudProvider {
    #[default]
    Generic,
    Aws,
    Azure,
    Gcp,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Generic => "generic",
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
            CloudProvider::Gcp => "gcp",
        }
    }
}

impl FromStr for CloudProvider {
    type Err = CredentialError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "generic" => Ok(CloudProvider::Generic),
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            "gcp" => Ok(CloudProvider::Gcp),
            other => Err(CredentialError::UnconfiguredProvider(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// The outcome of credential resolution. Holds the optional ephemeral
/// credentials file; dropping the struct deletes it on every exit path.
#[derive(Default)]
pub struct ResolvedCredentials {
    pub basic: Option<BasicCredentials>,
    file: Option<NamedTempFile>,
}

impl ResolvedCredentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.basic.is_none()
    }

    /// Writes a docker config file for tools that authenticate through the
    /// filesystem. The file lives as long as this struct.
    pub fn write_docker_config(&mut self, host: &str) -> Result<Option<&std::path::Path>, CredentialError> {
        let basic = match &self.basic {
            Some(b) => b,
            None => return Ok(None),
        };
        let auth = BASE64_STANDARD.encode(format!("{}:{}", basic.username, basic.password));
        let config = serde_json::json!({
            "auths": { host: { "auth": auth } }
        });
        let mut file = NamedTempFile::new()?;
        file.write_all(config.to_string().as_bytes())?;
        self.file = Some(file);
        Ok(self.file.as_ref().map(|f| f.path()))
    }

    pub fn credentials_file(&self) -> Option<&std::path::Path> {
        self.file.as_ref().map(|f| f.path())
    }
}

/// Interface to cloud registry logins. The default implementation resolves
/// ambient credentials from the process environment; anything richer plugs
/// in behind this trait.
pub trait CloudCredentialHelper: Send + Sync {
    fn login(&self, provider: CloudProvider, host: &str) -> Result<BasicCredentials, CredentialError>;
}

/// Reads `CHARTHOUSE_<PROVIDER>_USERNAME` / `CHARTHOUSE_<PROVIDER>_PASSWORD`
/// from the environment.
#[derive(Default)]
pub struct EnvCredentialHelper;

impl CloudCredentialHelper for EnvCredentialHelper {
    fn login(&self, provider: CloudProvider, _host: &str) -> Result<BasicCredentials, CredentialError> {
        let prefix = provider.as_str().to_uppercase();
        let username = std::env::var(format!("CHARTHOUSE_{}_USERNAME", prefix));
        let password = std::env::var(format!("CHARTHOUSE_{}_PASSWORD", prefix));
        match (username, password) {
            (Ok(username), Ok(password)) => Ok(BasicCredentials { username, password }),
            _ => Err(CredentialError::UnconfiguredProvider(
                provider.as_str().to_string(),
            )),
        }
    }
}

pub struct CredentialProvider {
    client: Client,
}

impl CredentialProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolves credentials for the registry host, in priority order.
    pub async fn resolve(
        &self,
        namespace: &str,
        secret_ref: Option<&SecretReference>,
        service_account: Option<&str>,
        provider: CloudProvider,
        host: &str,
    ) -> Result<ResolvedCredentials, CredentialError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        if let Some(secret_ref) = secret_ref {
            let secret = secrets.get(&secret_ref.name).await?;
            let basic = credentials_from_secret(&secret, host)?;
            return Ok(ResolvedCredentials { basic: Some(basic), file: None });
        }

        if let Some(sa_name) = service_account {
            let service_accounts: Api<ServiceAccount> =
                Api::namespaced(self.client.clone(), namespace);
            let sa = service_accounts.get(sa_name).await?;
            for pull_secret in sa.image_pull_secrets.unwrap_or_default() {
                let Some(name) = pull_secret.name else { continue };
                let secret = secrets.get(&name).await?;
                if let Ok(basic) = credentials_from_secret(&secret, host) {
                    return Ok(ResolvedCredentials { basic: Some(basic), file: None });
                }
            }
        }

        if let Some(basic) = cloud_login(&EnvCredentialHelper, provider, host)? {
            return Ok(ResolvedCredentials { basic: Some(basic), file: None });
        }

        Ok(ResolvedCredentials::anonymous())
    }

    /// Loads TLS material from a cert secret with `caCert`, `clientCert`
    /// and `clientKey` entries.
    pub async fn tls_certificates(
        &self,
        namespace: &str,
        secret_ref: &SecretReference,
    ) -> Result<TlsCertificateSet, CredentialError> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(&secret_ref.name).await?;
        let data = secret.data.unwrap_or_default();

        let get = |key: &str| data.get(key).map(|v| v.0.clone());
        let certs = TlsCertificateSet {
            ca_cert: get("caCert"),
            client_cert: get("clientCert"),
            client_key: get("clientKey"),
        };
        if certs.client_cert.is_some() != certs.client_key.is_some() {
            return Err(CredentialError::InvalidData {
                secret: secret_ref.name.clone(),
                message: "'clientCert' and 'clientKey' must be provided together".to_string(),
            });
        }
        Ok(certs)
    }
}

/// Cloud login step of the resolution chain. A configured provider yields
/// credentials, an unconfigured one falls through to anonymous access, and
/// any other helper failure aborts the resolution.
fn cloud_login(
    helper: &dyn CloudCredentialHelper,
    provider: CloudProvider,
    host: &str,
) -> Result<Option<BasicCredentials>, CredentialError> {
    if provider == CloudProvider::Generic {
        return Ok(None);
    }
    match helper.login(provider, host) {
        Ok(basic) => Ok(Some(basic)),
        Err(CredentialError::UnconfiguredProvider(p)) => {
            debug!(provider = %p, "cloud provider not configured, using anonymous access");
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

#[derive(Deserialize)]
struct DockerConfig {
    auths: BTreeMap<String, DockerAuthEntry>,
}

#[derive(Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

/// Extracts basic credentials for the host from a secret. Supports
/// kubernetes.io/dockerconfigjson secrets and plain username/password keys.
pub fn credentials_from_secret(
    secret: &Secret,
    host: &str,
) -> Result<BasicCredentials, CredentialError> {
    let name = secret.metadata.name.clone().unwrap_or_default();
    let data = secret.data.clone().unwrap_or_default();

    if let Some(config) = data.get(".dockerconfigjson") {
        let config: DockerConfig =
            serde_json::from_slice(&config.0).map_err(|err| CredentialError::InvalidData {
                secret: name.clone(),
                message: format!("failed to parse .dockerconfigjson: {}", err),
            })?;

        let entry = config
            .auths
            .iter()
            .find(|(registry, _)| registry_matches(registry, host))
            .map(|(_, entry)| entry)
            .ok_or_else(|| CredentialError::InvalidData {
                secret: name.clone(),
                message: format!("no auth entry for registry '{}'", host),
            })?;

        if let (Some(username), Some(password)) = (&entry.username, &entry.password) {
            return Ok(BasicCredentials {
                username: username.clone(),
                password: password.clone(),
            });
        }
        if let Some(auth) = &entry.auth {
            let decoded =
                BASE64_STANDARD
                    .decode(auth)
                    .map_err(|err| CredentialError::InvalidData {
                        secret: name.clone(),
                        message: format!("invalid base64 in auth entry: {}", err),
                    })?;
            let decoded = String::from_utf8(decoded).map_err(|_| CredentialError::InvalidData {
                secret: name.clone(),
                message: "auth entry is not valid UTF-8".to_string(),
            })?;
            let (username, password) =
                decoded
                    .split_once(':')
                    .ok_or_else(|| CredentialError::InvalidData {
                        secret: name.clone(),
                        message: "auth entry is not in 'user:password' format".to_string(),
                    })?;
            return Ok(BasicCredentials {
                username: username.to_string(),
                password: password.to_string(),
            });
        }
        return Err(CredentialError::InvalidData {
            secret: name,
            message: format!("auth entry for '{}' has no usable credentials", host),
        });
    }

    let username = data
        .get("username")
        .ok_or_else(|| CredentialError::MissingKey {
            secret: name.clone(),
            key: "username".to_string(),
        })?;
    let password = data
        .get("password")
        .ok_or_else(|| CredentialError::MissingKey {
            secret: name.clone(),
            key: "password".to_string(),
        })?;

    let decode = |bytes: &[u8], key: &str| {
        String::from_utf8(bytes.to_vec()).map_err(|_| CredentialError::InvalidData {
            secret: name.clone(),
            message: format!("invalid UTF-8 in '{}'", key),
        })
    };
    Ok(BasicCredentials {
        username: decode(&username.0, "username")?,
        password: decode(&password.0, "password")?,
    })
}

fn registry_matches(entry: &str, host: &str) -> bool {
    let entry = entry
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let entry = entry.trim_end_matches('/');
    entry == host
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;

    fn secret_with(entries: &[(&str, &[u8])]) -> Secret {
        let mut data = BTreeMap::new();
        for (k, v) in entries {
            data.insert(k.to_string(), ByteString(v.to_vec()));
        }
        Secret {
            metadata: kube::core::ObjectMeta {
                name: Some("regcred".to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn basic_auth_keys() {
        let secret = secret_with(&[("username", b"admin"), ("password", b"hunter2")]);
        let creds = credentials_from_secret(&secret, "ghcr.io").unwrap();
        assert_eq!(creds.username, "admin");
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn missing_password_key_is_an_error() {
        let secret = secret_with(&[("username", b"admin")]);
        let err = credentials_from_secret(&secret, "ghcr.io").unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn dockerconfigjson_with_inline_credentials() {
        let config = br#"{"auths":{"ghcr.io":{"username":"bot","password":"tok"}}}"#;
        let secret = secret_with(&[(".dockerconfigjson", config)]);
        let creds = credentials_from_secret(&secret, "ghcr.io").unwrap();
        assert_eq!(creds.username, "bot");
        assert_eq!(creds.password, "tok");
    }

    #[test]
    fn dockerconfigjson_with_encoded_auth() {
        let auth = BASE64_STANDARD.encode("bot:tok");
        let config = format!(r#"{{"auths":{{"https://ghcr.io/":{{"auth":"{}"}}}}}}"#, auth);
        let secret = secret_with(&[(".dockerconfigjson", config.as_bytes())]);
        let creds = credentials_from_secret(&secret, "ghcr.io").unwrap();
        assert_eq!(creds.username, "bot");
        assert_eq!(creds.password, "tok");
    }

    #[test]
    fn dockerconfigjson_without_matching_host() {
        let config = br#"{"auths":{"docker.io":{"username":"bot","password":"tok"}}}"#;
        let secret = secret_with(&[(".dockerconfigjson", config)]);
        assert!(credentials_from_secret(&secret, "ghcr.io").is_err());
    }

    #[test]
    fn credentials_file_is_deleted_on_drop() {
        let mut resolved = ResolvedCredentials {
            basic: Some(BasicCredentials {
                username: "bot".to_string(),
                password: "tok".to_string(),
            }),
            file: None,
        };
        let path = resolved
            .write_docker_config("ghcr.io")
            .unwrap()
            .unwrap()
            .to_path_buf();
        assert!(path.exists());
        drop(resolved);
        assert!(!path.exists());
    }

    #[test]
    fn anonymous_resolution_writes_no_file() {
        let mut resolved = ResolvedCredentials::anonymous();
        assert!(resolved.write_docker_config("ghcr.io").unwrap().is_none());
        assert!(resolved.is_anonymous());
    }

    #[test]
    fn unknown_provider_is_unconfigured() {
        assert!(CloudProvider::from_str("alibaba").is_err());
        assert_eq!(CloudProvider::from_str("").unwrap(), CloudProvider::Generic);
        assert_eq!(CloudProvider::from_str("gcp").unwrap(), CloudProvider::Gcp);
    }

    #[test]
    fn env_helper_reports_unconfigured() {
        let helper = EnvCredentialHelper;
        let err = helper.login(CloudProvider::Azure, "myregistry.azurecr.io");
        assert!(matches!(err, Err(CredentialError::UnconfiguredProvider(_))));
    }

    /// Helper stub that always yields credentials.
    struct ConfiguredHelper;

    impl CloudCredentialHelper for ConfiguredHelper {
        fn login(
            &self,
            _provider: CloudProvider,
            _host: &str,
        ) -> Result<BasicCredentials, CredentialError> {
            Ok(BasicCredentials {
                username: "oidc".to_string(),
                password: "token".to_string(),
            })
        }
    }

    /// Helper stub that fails hard, e.g. an expired cloud token.
    struct BrokenHelper;

    impl CloudCredentialHelper for BrokenHelper {
        fn login(
            &self,
            _provider: CloudProvider,
            _host: &str,
        ) -> Result<BasicCredentials, CredentialError> {
            Err(CredentialError::InvalidData {
                secret: "cloud".to_string(),
                message: "token expired".to_string(),
            })
        }
    }

    #[test]
    fn generic_provider_skips_cloud_login() {
        // The helper must not even be consulted for generic registries.
        let resolved = cloud_login(&BrokenHelper, CloudProvider::Generic, "ghcr.io").unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn configured_cloud_provider_yields_credentials() {
        let resolved = cloud_login(&ConfiguredHelper, CloudProvider::Aws, "1234.dkr.ecr.io")
            .unwrap()
            .unwrap();
        assert_eq!(resolved.username, "oidc");
        assert_eq!(resolved.password, "token");
    }

    #[test]
    fn unconfigured_cloud_provider_falls_through_to_anonymous() {
        let resolved =
            cloud_login(&EnvCredentialHelper, CloudProvider::Gcp, "gcr.io").unwrap();
        assert!(resolved.is_none());
    }

    #[test]
    fn cloud_helper_failures_propagate() {
        let err = cloud_login(&BrokenHelper, CloudProvider::Azure, "myregistry.azurecr.io")
            .unwrap_err();
        assert!(err.to_string().contains("token expired"));
    }
}
