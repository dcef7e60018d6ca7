//! Resolve, pull, archive and scan for one job.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use scantask_core::config::WorkerConfig;
use scantask_core::error::Result;
use scantask_core::job::{ScanParams, TaskRequest};

use crate::archive::{ArchiveBuilder, ArchiveBundle, ARCHIVE_FILE};
use crate::oci::{
    ArtifactPuller, CredentialMap, OciRegistryConnector, RegistryConnector, RegistryResolvers,
};
use crate::scanner::{GrypeScanner, ScanResult, ScannerPort};

/// Work performed for one dequeued job.
///
/// `Ok` carries the raw scanner output and maps to a finished run; any error
/// maps to a failed run.
#[async_trait]
pub trait JobPipeline: Send + Sync {
    async fn run(&self, request: &TaskRequest) -> Result<Vec<u8>>;
}

/// The production pipeline.
pub struct ScanPipeline {
    resolvers: RegistryResolvers,
    puller: ArtifactPuller,
    archive: ArchiveBuilder,
    scanner: Arc<dyn ScannerPort>,
    work_root: PathBuf,
}

impl ScanPipeline {
    pub fn new(
        resolvers: RegistryResolvers,
        registry: Arc<dyn RegistryConnector>,
        scanner: Arc<dyn ScannerPort>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            resolvers,
            puller: ArtifactPuller::new(registry),
            archive: ArchiveBuilder::new(config.archive),
            scanner,
            work_root: config.work_dir.clone(),
        }
    }

    /// Pipeline talking to real registries and the configured scanner binary.
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        Ok(Self::new(
            RegistryResolvers::from_env()?,
            Arc::new(OciRegistryConnector::new()),
            Arc::new(GrypeScanner::new(&config.scanner)),
            config,
        ))
    }

    /// Resolve credentials, pull the artifact and write the archive to `output`.
    pub async fn fetch(&self, params: &ScanParams, output: &Path) -> Result<ArchiveBundle> {
        let credentials = self
            .resolvers
            .resolve(&params.registry_type, &params.credentials)
            .await?;
        self.fetch_with_credentials(&params.artifact_url, &credentials, output)
            .await
    }

    /// Pull `artifact_url` with already resolved credentials and write the
    /// archive to `output`.
    pub async fn fetch_with_credentials(
        &self,
        artifact_url: &str,
        credentials: &CredentialMap,
        output: &Path,
    ) -> Result<ArchiveBundle> {
        let artifact = self.puller.pull(artifact_url, credentials).await?;
        self.archive.build_artifact(artifact, output).await
    }

    /// Fetch into `work_dir` and scan the result.
    pub async fn execute(&self, params: &ScanParams, work_dir: &Path) -> Result<ScanResult> {
        let bundle = self.fetch(params, &work_dir.join(ARCHIVE_FILE)).await?;
        log_work_dir(work_dir);
        self.scanner.scan(&bundle.path).await
    }

    pub fn resolvers(&self) -> &RegistryResolvers {
        &self.resolvers
    }

    pub fn scanner(&self) -> &dyn ScannerPort {
        self.scanner.as_ref()
    }
}

#[async_trait]
impl JobPipeline for ScanPipeline {
    async fn run(&self, request: &TaskRequest) -> Result<Vec<u8>> {
        let params = ScanParams::from_params(&request.params)?;

        std::fs::create_dir_all(&self.work_root)?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("run-{}-", request.run_id))
            .tempdir_in(&self.work_root)?;

        tracing::info!(
            run_id = request.run_id,
            image = %params.artifact_url,
            registry_type = %params.registry_type,
            work_dir = %work_dir.path().display(),
            "Fetching image"
        );

        let result = self.execute(&params, work_dir.path()).await?;
        Ok(result.output)
    }
}

fn log_work_dir(dir: &Path) {
    if !tracing::enabled!(tracing::Level::DEBUG) {
        return;
    }
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Cannot list work directory");
            return;
        }
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            match e.file_type() {
                Ok(t) if t.is_dir() => format!("{}/", name),
                _ => name,
            }
        })
        .collect();
    names.sort();
    tracing::debug!(dir = %dir.display(), files = ?names, "Work directory contents");
}
