//! OCI registry access.
//!
//! Uses the `oci-distribution` crate to fetch manifests and blobs from
//! container registries (GHCR, ECR, ACR, etc.). Authentication is chosen per
//! host from a resolved [`CredentialMap`].

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use scantask_core::error::{Result, TaskError};

use super::credentials::CredentialMap;
use super::reference::ArtifactReference;

/// Authentication credentials for a container registry.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Convert to oci-distribution auth type.
    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

impl std::fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Picks the credential for a registry host.
///
/// Hosts missing from the map fail with `NoCredentialForHost`; other hosts in
/// the same job are unaffected.
#[derive(Debug, Clone, Copy)]
pub struct HostAuthenticator<'a> {
    credentials: &'a CredentialMap,
}

impl<'a> HostAuthenticator<'a> {
    pub fn new(credentials: &'a CredentialMap) -> Self {
        Self { credentials }
    }

    pub fn authenticate(&self, host: &str) -> Result<RegistryAuth> {
        self.credentials
            .get(host)
            .map(|c| RegistryAuth::basic(&c.username, &c.secret))
            .ok_or_else(|| TaskError::NoCredentialForHost(host.to_string()))
    }
}

/// Raw registry operations used by the puller.
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the raw manifest bytes and their digest.
    async fn pull_manifest(
        &self,
        reference: &ArtifactReference,
        auth: &RegistryAuth,
        accepted_media_types: &[&str],
    ) -> Result<(Vec<u8>, String)>;

    /// Fetch one blob. Called after `pull_manifest` for the same repository.
    async fn pull_blob(
        &self,
        reference: &ArtifactReference,
        descriptor: &OciDescriptor,
    ) -> Result<Vec<u8>>;
}

/// Opens a registry session for one pull.
///
/// A session may cache per-host authentication, so it must not outlive the
/// job whose credentials it was opened with.
pub trait RegistryConnector: Send + Sync {
    fn connect(&self) -> Box<dyn RegistryClient + '_>;
}

/// [`RegistryConnector`] handing out a fresh [`OciRegistryClient`] per pull.
#[derive(Debug, Clone, Default)]
pub struct OciRegistryConnector {
    protocol: ClientProtocol,
}

impl OciRegistryConnector {
    pub fn new() -> Self {
        Self::with_protocol(ClientProtocol::Https)
    }

    pub fn with_protocol(protocol: ClientProtocol) -> Self {
        Self { protocol }
    }
}

impl RegistryConnector for OciRegistryConnector {
    fn connect(&self) -> Box<dyn RegistryClient + '_> {
        Box::new(OciRegistryClient::with_protocol(self.protocol.clone()))
    }
}

/// [`RegistryClient`] over the distribution HTTP API.
///
/// The underlying client pins the first credential it sees for each host.
pub struct OciRegistryClient {
    client: Client,
}

impl OciRegistryClient {
    pub fn new() -> Self {
        Self::with_protocol(ClientProtocol::Https)
    }

    pub fn with_protocol(protocol: ClientProtocol) -> Self {
        let config = ClientConfig {
            protocol,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }
}

impl Default for OciRegistryClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryClient for OciRegistryClient {
    async fn pull_manifest(
        &self,
        reference: &ArtifactReference,
        auth: &RegistryAuth,
        accepted_media_types: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        let oci_ref = to_oci_reference(reference)?;
        let (manifest, digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth.to_oci_auth(), accepted_media_types)
            .await
            .map_err(|e| TaskError::RegistryFetchError {
                registry: reference.registry.clone(),
                message: format!("Failed to pull manifest: {}", e),
            })?;
        Ok((manifest.into(), digest))
    }

    async fn pull_blob(
        &self,
        reference: &ArtifactReference,
        descriptor: &OciDescriptor,
    ) -> Result<Vec<u8>> {
        let oci_ref = to_oci_reference(reference)?;
        let mut data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, descriptor, &mut data)
            .await
            .map_err(|e| TaskError::RegistryFetchError {
                registry: reference.registry.clone(),
                message: format!("Failed to pull blob {}: {}", descriptor.digest, e),
            })?;
        Ok(data)
    }
}

/// Convert an ArtifactReference to an oci-distribution Reference.
fn to_oci_reference(reference: &ArtifactReference) -> Result<Reference> {
    let ref_str = reference.full_reference();
    ref_str
        .parse::<Reference>()
        .map_err(|e| TaskError::InvalidReference(format!("'{}': {}", ref_str, e)))
}

fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

/// Select the linux manifest for the host CPU architecture.
pub fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = host_architecture();
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
