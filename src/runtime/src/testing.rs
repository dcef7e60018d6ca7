//! Fakes for the registry and scanner ports.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use oci_distribution::manifest::OciDescriptor;
use scantask_core::error::{Result, TaskError};

use crate::archive::{DockerManifestEntry, DOCKER_MANIFEST_FILE};
use crate::oci::media_types;
use crate::oci::reference::ArtifactReference;
use crate::oci::registry::{RegistryAuth, RegistryClient, RegistryConnector};
use crate::oci::store::sha256_digest;
use crate::scanner::{ScanResult, ScannerPort};

const SAMPLE_CONFIG: &[u8] =
    br#"{"architecture":"amd64","os":"linux","rootfs":{"type":"layers","diff_ids":[]}}"#;

/// Image config, layers and the media types to advertise for them.
pub struct SampleImage {
    pub config: Vec<u8>,
    pub layers: Vec<Vec<u8>>,
    pub config_media_type: String,
    pub layer_media_type: String,
}

impl SampleImage {
    pub fn new(layer_count: usize) -> Self {
        Self {
            config: SAMPLE_CONFIG.to_vec(),
            layers: (1..=layer_count)
                .map(|i| format!("layer-{}-content", i).into_bytes())
                .collect(),
            config_media_type: media_types::OCI_IMAGE_CONFIG.to_string(),
            layer_media_type: media_types::OCI_LAYER_TAR_GZIP.to_string(),
        }
    }

    pub fn config_descriptor(&self) -> OciDescriptor {
        descriptor(&self.config_media_type, &self.config)
    }

    pub fn layer_descriptors(&self) -> Vec<OciDescriptor> {
        self.layers
            .iter()
            .map(|l| descriptor(&self.layer_media_type, l))
            .collect()
    }

    pub fn manifest_json(&self) -> Vec<u8> {
        let layers: Vec<_> = self
            .layer_descriptors()
            .iter()
            .map(descriptor_json)
            .collect();
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_IMAGE_MANIFEST,
            "config": descriptor_json(&self.config_descriptor()),
            "layers": layers,
        }))
        .unwrap()
    }

    /// Registry serving this image at `reference`.
    pub fn registry(&self, reference: &str) -> FakeRegistry {
        let mut registry = FakeRegistry::default()
            .with_manifest(reference, self.manifest_json());
        registry.add_blob(&self.config);
        for layer in &self.layers {
            registry.add_blob(layer);
        }
        registry
    }
}

fn descriptor(media_type: &str, data: &[u8]) -> OciDescriptor {
    OciDescriptor {
        media_type: media_type.to_string(),
        digest: sha256_digest(data),
        size: data.len() as i64,
        ..Default::default()
    }
}

fn descriptor_json(d: &OciDescriptor) -> serde_json::Value {
    serde_json::json!({
        "mediaType": d.media_type,
        "digest": d.digest,
        "size": d.size,
    })
}

/// Serves manifests by full reference and blobs by digest, recording calls.
#[derive(Default)]
pub struct FakeRegistry {
    manifests: HashMap<String, Vec<u8>>,
    blobs: HashMap<String, Vec<u8>>,
    sessions: AtomicUsize,
    /// Reference and username of every manifest request
    pub manifest_pulls: Mutex<Vec<(String, Option<String>)>>,
    pub blob_pulls: Mutex<Vec<String>>,
}

impl FakeRegistry {
    pub fn with_manifest(mut self, reference: &str, body: Vec<u8>) -> Self {
        self.manifests.insert(reference.to_string(), body);
        self
    }

    pub fn add_blob(&mut self, data: &[u8]) {
        self.blobs.insert(sha256_digest(data), data.to_vec());
    }

    /// Serve `data` under `digest` even if they do not match.
    pub fn with_raw_blob(mut self, digest: &str, data: &[u8]) -> Self {
        self.blobs.insert(digest.to_string(), data.to_vec());
        self
    }

    pub fn blob_pull_count(&self) -> usize {
        self.blob_pulls.lock().unwrap().len()
    }

    /// Number of sessions opened so far.
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }
}

impl RegistryConnector for FakeRegistry {
    fn connect(&self) -> Box<dyn RegistryClient + '_> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        Box::new(FakeSession { registry: self })
    }
}

struct FakeSession<'a> {
    registry: &'a FakeRegistry,
}

#[async_trait]
impl RegistryClient for FakeSession<'_> {
    async fn pull_manifest(
        &self,
        reference: &ArtifactReference,
        auth: &RegistryAuth,
        _accepted_media_types: &[&str],
    ) -> Result<(Vec<u8>, String)> {
        let key = reference.full_reference();
        self.registry
            .manifest_pulls
            .lock()
            .unwrap()
            .push((key.clone(), auth.username().map(str::to_string)));
        let body = self
            .registry
            .manifests
            .get(&key)
            .cloned()
            .ok_or_else(|| TaskError::RegistryFetchError {
                registry: reference.registry.clone(),
                message: format!("Failed to pull manifest: 404 manifest unknown {}", key),
            })?;
        let digest = sha256_digest(&body);
        Ok((body, digest))
    }

    async fn pull_blob(
        &self,
        reference: &ArtifactReference,
        descriptor: &OciDescriptor,
    ) -> Result<Vec<u8>> {
        self.registry
            .blob_pulls
            .lock()
            .unwrap()
            .push(descriptor.digest.clone());
        self.registry
            .blobs
            .get(&descriptor.digest)
            .cloned()
            .ok_or_else(|| TaskError::RegistryFetchError {
                registry: reference.registry.clone(),
                message: format!("Failed to pull blob {}: 404 blob unknown", descriptor.digest),
            })
    }
}

/// Scanner returning canned output and recording the archives it saw.
pub struct StaticScanner {
    output: Vec<u8>,
    failure: Option<String>,
    delay: Duration,
    /// Docker `manifest.json` of every archive scanned
    pub seen_manifests: Mutex<Vec<Vec<DockerManifestEntry>>>,
}

impl StaticScanner {
    pub fn new(output: impl Into<Vec<u8>>) -> Self {
        Self {
            output: output.into(),
            failure: None,
            delay: Duration::ZERO,
            seen_manifests: Mutex::new(Vec::new()),
        }
    }

    /// Fail every scan with `ScanExecutionError` carrying `output`.
    pub fn failing(message: &str, output: impl Into<Vec<u8>>) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new(output)
        }
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn scan_count(&self) -> usize {
        self.seen_manifests.lock().unwrap().len()
    }
}

#[async_trait]
impl ScannerPort for StaticScanner {
    async fn scan(&self, archive: &Path) -> Result<ScanResult> {
        let mut tar = tar::Archive::new(std::fs::File::open(archive)?);
        let mut manifest = Vec::new();
        for entry in tar.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_os_str() == DOCKER_MANIFEST_FILE {
                manifest = serde_json::from_reader(&mut entry)?;
            }
        }
        self.seen_manifests.lock().unwrap().push(manifest);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.failure {
            Some(message) => Err(TaskError::ScanExecutionError {
                message: message.clone(),
                output: self.output.clone(),
            }),
            None => ScanResult::from_output(self.output.clone(), Vec::new()),
        }
    }
}
