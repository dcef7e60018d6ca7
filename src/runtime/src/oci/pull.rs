//! Artifact pull: manifest graph plus blobs into a job-owned content store.
//!
//! Media types are checked against the allow-list before any blob is
//! requested, so a rejected artifact never produces content on disk or in
//! memory.

use std::sync::Arc;

use oci_distribution::manifest::{OciImageIndex, OciImageManifest};
use scantask_core::error::{Result, TaskError};
use serde::Deserialize;

use super::credentials::CredentialMap;
use super::media_types;
use super::reference::ArtifactReference;
use super::registry::{
    linux_platform_resolver, HostAuthenticator, RegistryAuth, RegistryClient, RegistryConnector,
};
use super::store::ContentStore;

/// Everything the archive builder needs from one pull.
#[derive(Debug)]
pub struct PulledArtifact {
    /// Reference as requested by the job
    pub reference: ArtifactReference,
    /// Digest of the image manifest that was used
    pub manifest_digest: String,
    pub manifest: OciImageManifest,
    /// Manifest bytes exactly as served by the registry
    pub raw_manifest: Vec<u8>,
    pub store: ContentStore,
}

/// Fields needed to tell an image manifest from an index.
#[derive(Deserialize)]
struct ManifestKind {
    #[serde(rename = "mediaType", default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

impl ManifestKind {
    fn is_index(&self) -> bool {
        match self.media_type.as_deref() {
            Some(mt) => media_types::is_index(mt),
            None => self.manifests.is_some(),
        }
    }
}

/// Pulls artifacts, each through its own registry session.
pub struct ArtifactPuller {
    connector: Arc<dyn RegistryConnector>,
}

impl ArtifactPuller {
    pub fn new(connector: Arc<dyn RegistryConnector>) -> Self {
        Self { connector }
    }

    /// Pull `reference` using `credentials`.
    pub async fn pull(
        &self,
        reference: &str,
        credentials: &CredentialMap,
    ) -> Result<PulledArtifact> {
        let reference = ArtifactReference::parse(reference)?;
        let auth = HostAuthenticator::new(credentials).authenticate(&reference.registry)?;

        tracing::info!(reference = %reference, "Pulling artifact");

        let session = self.connector.connect();
        let (raw_manifest, manifest_digest) =
            resolve_manifest(session.as_ref(), &reference, &auth).await?;
        let manifest: OciImageManifest = serde_json::from_slice(&raw_manifest)
            .map_err(|e| TaskError::ManifestDecodeError(format!("{}: {}", manifest_digest, e)))?;

        validate_media_types(&manifest)?;

        let mut store = ContentStore::new();
        store.insert(&reference.registry, &manifest_digest, raw_manifest.clone())?;
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if store.contains(&descriptor.digest) {
                continue;
            }
            tracing::debug!(
                digest = %descriptor.digest,
                media_type = %descriptor.media_type,
                size = descriptor.size,
                "Pulling blob"
            );
            let data = session.pull_blob(&reference, descriptor).await?;
            store.insert(&reference.registry, &descriptor.digest, data)?;
        }

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            bytes = store.size_bytes(),
            "Artifact pulled"
        );

        Ok(PulledArtifact {
            reference,
            manifest_digest,
            manifest,
            raw_manifest,
            store,
        })
    }
}

/// Fetch the image manifest, following one level of index.
async fn resolve_manifest(
    client: &dyn RegistryClient,
    reference: &ArtifactReference,
    auth: &RegistryAuth,
) -> Result<(Vec<u8>, String)> {
    let (raw, digest) = client
        .pull_manifest(reference, auth, media_types::ACCEPTED_MANIFESTS)
        .await?;
    let kind = decode_kind(&raw, &digest)?;
    if !kind.is_index() {
        check_manifest_type(&kind, &digest)?;
        return Ok((raw, digest));
    }

    let index: OciImageIndex = serde_json::from_slice(&raw)
        .map_err(|e| TaskError::ManifestDecodeError(format!("{}: {}", digest, e)))?;
    let child = linux_platform_resolver(&index.manifests)
        .or_else(|| index.manifests.first().map(|m| m.digest.clone()))
        .ok_or_else(|| {
            TaskError::ManifestDecodeError(format!("{}: image index has no manifests", digest))
        })?;

    tracing::debug!(index = %digest, manifest = %child, "Dereferenced image index");

    let pinned = reference.with_digest(&child);
    let (raw, digest) = client
        .pull_manifest(&pinned, auth, media_types::ACCEPTED_MANIFESTS)
        .await?;
    let kind = decode_kind(&raw, &digest)?;
    if kind.is_index() {
        return Err(TaskError::UnsupportedMediaType {
            media_type: kind
                .media_type
                .unwrap_or_else(|| media_types::OCI_IMAGE_INDEX.to_string()),
            digest,
        });
    }
    check_manifest_type(&kind, &digest)?;
    Ok((raw, digest))
}

fn decode_kind(raw: &[u8], digest: &str) -> Result<ManifestKind> {
    serde_json::from_slice(raw)
        .map_err(|e| TaskError::ManifestDecodeError(format!("{}: {}", digest, e)))
}

fn check_manifest_type(kind: &ManifestKind, digest: &str) -> Result<()> {
    match kind.media_type.as_deref() {
        Some(mt) if !media_types::is_manifest(mt) => Err(TaskError::UnsupportedMediaType {
            media_type: mt.to_string(),
            digest: digest.to_string(),
        }),
        _ => Ok(()),
    }
}

/// Reject the whole artifact if the config or any layer has an unknown type.
fn validate_media_types(manifest: &OciImageManifest) -> Result<()> {
    if !media_types::is_config(&manifest.config.media_type) {
        return Err(TaskError::UnsupportedMediaType {
            media_type: manifest.config.media_type.clone(),
            digest: manifest.config.digest.clone(),
        });
    }
    if let Some(layer) = manifest
        .layers
        .iter()
        .find(|l| !media_types::is_layer(&l.media_type))
    {
        return Err(TaskError::UnsupportedMediaType {
            media_type: layer.media_type.clone(),
            digest: layer.digest.clone(),
        });
    }
    Ok(())
}
