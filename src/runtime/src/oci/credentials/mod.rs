//! Registry credential resolution.
//!
//! Turns a registry kind plus the credential fields of a job into a map from
//! registry host to the credential used when pulling from that host. Each
//! [`RegistryKind`] has one resolver behind the [`ResolveCredentials`] trait.

mod acr;
mod ecr;
mod ghcr;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use scantask_core::error::{Result, TaskError};
use scantask_core::job::RegistryParams;
use serde::{Deserialize, Serialize};

pub use acr::{AadTokenSource, AcrResolver, AzureTokenSource, ACR_PLACEHOLDER_USERNAME};
pub use ecr::{AwsEcrTokenApi, EcrAuthorization, EcrResolver, EcrTokenApi};
pub use ghcr::{GhcrResolver, GHCR_HOST};

/// Supported registry providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistryKind {
    Ghcr,
    Ecr,
    Acr,
}

impl std::str::FromStr for RegistryKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ghcr" => Ok(Self::Ghcr),
            "ecr" => Ok(Self::Ecr),
            "acr" => Ok(Self::Acr),
            other => Err(TaskError::UnsupportedRegistry(other.to_string())),
        }
    }
}

impl std::fmt::Display for RegistryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ghcr => write!(f, "ghcr"),
            Self::Ecr => write!(f, "ecr"),
            Self::Acr => write!(f, "acr"),
        }
    }
}

/// Username and secret presented to one registry host.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredential {
    pub username: String,
    pub secret: String,
}

impl RegistryCredential {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
        }
    }

    /// Docker-style `auth` value: base64 of `username:secret`.
    pub fn encoded_auth(&self) -> String {
        STANDARD.encode(format!("{}:{}", self.username, self.secret))
    }

    /// Parse a Docker-style `auth` value.
    pub fn from_encoded_auth(host: &str, encoded: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(encoded)
            .map_err(|e| TaskError::Other(format!("invalid auth encoding for {}: {}", host, e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| TaskError::Other(format!("invalid auth encoding for {}: {}", host, e)))?;
        let (username, secret) = decoded
            .split_once(':')
            .ok_or_else(|| TaskError::Other(format!("invalid auth format for {}", host)))?;
        Ok(Self::new(username, secret))
    }
}

impl std::fmt::Debug for RegistryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryCredential")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Credentials keyed by registry host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CredentialMap {
    entries: HashMap<String, RegistryCredential>,
}

impl CredentialMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a credential for `host`, replacing any existing one.
    pub fn insert(&mut self, host: &str, credential: RegistryCredential) {
        self.entries.insert(normalize_registry(host), credential);
    }

    pub fn get(&self, host: &str) -> Option<&RegistryCredential> {
        self.entries.get(&normalize_registry(host))
    }

    pub fn merge(&mut self, other: CredentialMap) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registry hosts with credentials, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.entries.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    /// Render as a Docker `config.json` document.
    pub fn to_docker_config(&self) -> DockerConfig {
        DockerConfig {
            auths: self
                .entries
                .iter()
                .map(|(host, cred)| {
                    (
                        host.clone(),
                        DockerAuth {
                            auth: cred.encoded_auth(),
                        },
                    )
                })
                .collect(),
        }
    }

    /// Write the Docker `config.json` rendering to `path` with owner-only permissions.
    pub fn write_docker_config(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
            }
        }
        let data = serde_json::to_vec_pretty(&self.to_docker_config())?;
        std::fs::write(path, data)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}

/// Docker `config.json` credential document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerConfig {
    pub auths: HashMap<String, DockerAuth>,
}

impl DockerConfig {
    pub fn into_credentials(self) -> Result<CredentialMap> {
        let mut map = CredentialMap::new();
        for (host, entry) in self.auths {
            let credential = RegistryCredential::from_encoded_auth(&host, &entry.auth)?;
            map.insert(&host, credential);
        }
        Ok(map)
    }
}

/// Single `auths` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAuth {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth: String,
}

/// Produces registry credentials for one provider.
#[async_trait]
pub trait ResolveCredentials: Send + Sync {
    async fn resolve(&self, params: &RegistryParams) -> Result<CredentialMap>;
}

/// One resolver per [`RegistryKind`].
#[derive(Clone)]
pub struct RegistryResolvers {
    ghcr: GhcrResolver,
    ecr: EcrResolver,
    acr: AcrResolver,
}

impl RegistryResolvers {
    pub fn new(ghcr: GhcrResolver, ecr: EcrResolver, acr: AcrResolver) -> Self {
        Self { ghcr, ecr, acr }
    }

    /// Resolvers backed by the AWS SDK and the Azure environment credential.
    pub fn from_env() -> Result<Self> {
        Ok(Self::new(
            GhcrResolver,
            EcrResolver::new(Arc::new(AwsEcrTokenApi)),
            AcrResolver::new(Arc::new(AzureTokenSource::from_env()?))?,
        ))
    }

    pub fn resolver(&self, kind: RegistryKind) -> &dyn ResolveCredentials {
        match kind {
            RegistryKind::Ghcr => &self.ghcr,
            RegistryKind::Ecr => &self.ecr,
            RegistryKind::Acr => &self.acr,
        }
    }

    /// Resolve credentials for the registry kind named by `registry_type`.
    pub async fn resolve(
        &self,
        registry_type: &str,
        params: &RegistryParams,
    ) -> Result<CredentialMap> {
        let kind: RegistryKind = registry_type.parse()?;
        let credentials = self.resolver(kind).resolve(params).await?;
        tracing::debug!(
            registry_type = %kind,
            hosts = ?credentials.hosts(),
            "Resolved registry credentials"
        );
        Ok(credentials)
    }
}

/// Normalize registry names (e.g., "docker.io" and "index.docker.io" → "index.docker.io").
fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        "index.docker.io".to_string()
    } else {
        r
    }
}
