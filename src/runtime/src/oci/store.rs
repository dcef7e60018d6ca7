//! In-memory content-addressable blob store.
//!
//! One store is owned by one job and dropped with it. Blobs are keyed by
//! digest and every `sha256:` digest is checked against the content before
//! it is accepted.

use std::collections::HashMap;

use oci_distribution::manifest::OciDescriptor;
use scantask_core::error::{Result, TaskError};
use sha2::{Digest, Sha256};

/// Blobs keyed by digest.
#[derive(Debug, Default)]
pub struct ContentStore {
    blobs: HashMap<String, Vec<u8>>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a blob fetched from `registry` under `digest`.
    ///
    /// Fails with `RegistryFetchError` if the content does not hash to the
    /// declared digest.
    pub fn insert(&mut self, registry: &str, digest: &str, data: Vec<u8>) -> Result<()> {
        verify_digest(digest, &data).map_err(|message| TaskError::RegistryFetchError {
            registry: registry.to_string(),
            message,
        })?;
        self.blobs.insert(digest.to_string(), data);
        Ok(())
    }

    /// Blob for `descriptor`, or `BlobFetchError` if it was never stored.
    pub fn fetch(&self, descriptor: &OciDescriptor) -> Result<&[u8]> {
        self.get(&descriptor.digest)
            .ok_or_else(|| TaskError::BlobFetchError {
                digest: descriptor.digest.clone(),
                message: "blob not present in content store".to_string(),
            })
    }

    pub fn get(&self, digest: &str) -> Option<&[u8]> {
        self.blobs.get(digest).map(Vec::as_slice)
    }

    pub fn contains(&self, digest: &str) -> bool {
        self.blobs.contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total bytes held.
    pub fn size_bytes(&self) -> u64 {
        self.blobs.values().map(|b| b.len() as u64).sum()
    }
}

/// Compute the `sha256:<hex>` digest of `data`.
pub fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

/// Only sha256 is checked; other algorithms are accepted as declared.
fn verify_digest(digest: &str, data: &[u8]) -> std::result::Result<(), String> {
    let Some(expected) = digest.strip_prefix("sha256:") else {
        tracing::debug!(digest = %digest, "Skipping verification of non-sha256 digest");
        return Ok(());
    };
    let actual = hex::encode(Sha256::digest(data));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(format!(
            "digest mismatch for {}: content hashes to sha256:{}",
            digest, actual
        ))
    }
}
