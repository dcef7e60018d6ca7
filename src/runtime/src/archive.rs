//! Docker-archive assembly.
//!
//! Writes the config and layers of a pulled artifact next to the output path,
//! adds a Docker `manifest.json`, and packs everything into one tar in the
//! order `manifest.json`, `config.json`, `oci-manifest.json` (optional),
//! `layer1.tar`..`layerN.tar`.
//!
//! The tar is written to a temporary file in the same directory and only
//! renamed onto the output path once sealed, so an error never leaves a
//! usable archive behind.

use std::path::{Path, PathBuf};

use oci_distribution::manifest::OciImageManifest;
use scantask_core::config::ArchiveConfig;
use scantask_core::error::{Result, TaskError};
use serde::{Deserialize, Serialize};

use crate::oci::{ContentStore, PulledArtifact};

pub const DOCKER_MANIFEST_FILE: &str = "manifest.json";
pub const CONFIG_FILE: &str = "config.json";
pub const OCI_MANIFEST_FILE: &str = "oci-manifest.json";
pub const ARCHIVE_FILE: &str = "image.tar";

/// One entry of a Docker-archive `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerManifestEntry {
    #[serde(rename = "Config")]
    pub config: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    pub layers: Vec<String>,
}

/// A sealed archive.
#[derive(Debug, Clone)]
pub struct ArchiveBundle {
    pub path: PathBuf,
    pub entry: DockerManifestEntry,
    /// Member names in archive order
    pub members: Vec<String>,
}

/// Builds Docker-archive tarballs from a content store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveBuilder {
    options: ArchiveConfig,
}

impl ArchiveBuilder {
    pub fn new(options: ArchiveConfig) -> Self {
        Self { options }
    }

    /// Build from a pulled artifact, tagging it with the requested reference.
    ///
    /// Runs on the blocking pool since layers are written with synchronous
    /// file and tar I/O.
    pub async fn build_artifact(
        &self,
        artifact: PulledArtifact,
        output: &Path,
    ) -> Result<ArchiveBundle> {
        let builder = *self;
        let output = output.to_path_buf();
        tokio::task::spawn_blocking(move || {
            builder.build(
                &artifact.manifest,
                Some(&artifact.raw_manifest),
                &artifact.store,
                &artifact.reference.full_reference(),
                &output,
            )
        })
        .await
        .map_err(|e| TaskError::Other(format!("archive task failed: {}", e)))?
    }

    /// Build `output` from `manifest` and the blobs in `store`.
    ///
    /// Intermediate files are written to the directory containing `output`.
    /// `raw_manifest` is stored verbatim as `oci-manifest.json` when given;
    /// otherwise `manifest` is re-encoded.
    pub fn build(
        &self,
        manifest: &OciImageManifest,
        raw_manifest: Option<&[u8]>,
        store: &ContentStore,
        repo_tag: &str,
        output: &Path,
    ) -> Result<ArchiveBundle> {
        let work_dir = match output.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&work_dir)?;

        let config = store.fetch(&manifest.config)?;
        std::fs::write(work_dir.join(CONFIG_FILE), config)?;

        let mut layer_files = Vec::with_capacity(manifest.layers.len());
        for (i, layer) in manifest.layers.iter().enumerate() {
            let data = store.fetch(layer)?;
            let name = format!("layer{}.tar", i + 1);
            std::fs::write(work_dir.join(&name), data)?;
            layer_files.push(name);
        }

        let entry = DockerManifestEntry {
            config: CONFIG_FILE.to_string(),
            repo_tags: vec![repo_tag.to_string()],
            layers: layer_files,
        };
        std::fs::write(
            work_dir.join(DOCKER_MANIFEST_FILE),
            serde_json::to_vec_pretty(&[&entry])?,
        )?;

        let mut members = vec![DOCKER_MANIFEST_FILE.to_string(), CONFIG_FILE.to_string()];
        if self.options.include_oci_manifest {
            let oci_manifest = match raw_manifest {
                Some(raw) => raw.to_vec(),
                None => serde_json::to_vec_pretty(manifest)?,
            };
            std::fs::write(work_dir.join(OCI_MANIFEST_FILE), oci_manifest)?;
            members.push(OCI_MANIFEST_FILE.to_string());
        }
        members.extend(entry.layers.iter().cloned());

        write_tar(&work_dir, &members, output)?;

        if self.options.remove_intermediate {
            for name in [DOCKER_MANIFEST_FILE, OCI_MANIFEST_FILE] {
                if let Err(e) = std::fs::remove_file(work_dir.join(name)) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!(file = name, error = %e, "Failed to remove intermediate");
                    }
                }
            }
        }

        tracing::info!(
            archive = %output.display(),
            layers = entry.layers.len(),
            repo_tag = %repo_tag,
            "Docker archive created"
        );

        Ok(ArchiveBundle {
            path: output.to_path_buf(),
            entry,
            members,
        })
    }
}

/// Tar `members` from `dir` into `output`, taking headers from file metadata.
fn write_tar(dir: &Path, members: &[String], output: &Path) -> Result<()> {
    let partial = tempfile::NamedTempFile::new_in(dir)?;
    let mut builder = tar::Builder::new(partial);
    for name in members {
        builder
            .append_path_with_name(dir.join(name), name)
            .map_err(|e| {
                TaskError::IoError(std::io::Error::new(
                    e.kind(),
                    format!("failed to add {} to archive: {}", name, e),
                ))
            })?;
    }
    let partial = builder.into_inner()?;
    partial.persist(output).map_err(|e| TaskError::IoError(e.error))?;
    Ok(())
}
