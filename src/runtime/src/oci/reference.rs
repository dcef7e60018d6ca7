//! OCI artifact reference parsing.
//!
//! Parses references like `ghcr.io/example/app:v1.0` into structured components.
//! The registry host is mandatory: a job always names the registry it pulls from,
//! so bare Docker Hub shorthands such as `nginx` are rejected.

use scantask_core::error::{Result, TaskError};

/// Default tag when neither a tag nor a digest is given.
const DEFAULT_TAG: &str = "latest";

/// Longest tag a registry accepts.
const MAX_TAG_LEN: usize = 128;

/// Parsed OCI artifact reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReference {
    /// Registry hostname, optionally with port (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "example/app")
    pub repository: String,
    /// Tag (e.g., "v1.0")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ArtifactReference {
    /// Parse an artifact reference string.
    ///
    /// Supports formats:
    /// - `ghcr.io/org/app` → ghcr.io/org/app:latest
    /// - `ghcr.io/org/app:tag`
    /// - `ghcr.io/org/app@sha256:abc...`
    /// - `registry.local:5000/org/app:tag@sha256:abc...`
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(invalid(reference, "empty reference"));
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => {
                validate_digest(reference, digest)?;
                (name_tag, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // Registry is everything before the first slash
        let (registry, path) = name_tag
            .split_once('/')
            .ok_or_else(|| invalid(reference, "missing registry host"))?;
        if !looks_like_host(registry) {
            return Err(invalid(
                reference,
                &format!("'{}' is not a registry host", registry),
            ));
        }

        // Tag is after a colon in the final path component
        let (repository, tag) = match path.rfind(':') {
            Some(colon) if !path[colon..].contains('/') => {
                (&path[..colon], Some(path[colon + 1..].to_string()))
            }
            _ => (path, None),
        };

        validate_repository(reference, repository)?;
        if let Some(ref tag) = tag {
            validate_tag(reference, tag)?;
        }

        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ArtifactReference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// Same repository, addressed by `digest` instead of tag.
    pub fn with_digest(&self, digest: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.to_string()),
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ArtifactReference {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

fn invalid(reference: &str, reason: &str) -> TaskError {
    TaskError::InvalidReference(format!("'{}': {}", reference, reason))
}

fn looks_like_host(first: &str) -> bool {
    if first.is_empty() {
        return false;
    }
    let (host, port) = match first.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (first, None),
    };
    if let Some(port) = port {
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }
    let host_chars = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    host_chars && (host.contains('.') || port.is_some() || host == "localhost")
}

fn validate_repository(reference: &str, repository: &str) -> Result<()> {
    if repository.is_empty() {
        return Err(invalid(reference, "empty repository"));
    }
    for component in repository.split('/') {
        let valid = !component.is_empty()
            && component
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
            && component.starts_with(|c: char| c.is_ascii_alphanumeric())
            && component.ends_with(|c: char| c.is_ascii_alphanumeric());
        if !valid {
            return Err(invalid(
                reference,
                &format!("invalid repository component '{}'", component),
            ));
        }
    }
    Ok(())
}

fn validate_tag(reference: &str, tag: &str) -> Result<()> {
    let valid = !tag.is_empty()
        && tag.len() <= MAX_TAG_LEN
        && tag.starts_with(|c: char| c.is_ascii_alphanumeric() || c == '_')
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c));
    if valid {
        Ok(())
    } else {
        Err(invalid(reference, &format!("invalid tag '{}'", tag)))
    }
}

fn validate_digest(reference: &str, digest: &str) -> Result<()> {
    let (algorithm, encoded) = digest.split_once(':').ok_or_else(|| {
        invalid(reference, "invalid digest format: expected algorithm:hex")
    })?;
    let valid = !algorithm.is_empty()
        && algorithm
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+._-".contains(c))
        && !encoded.is_empty()
        && encoded.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(invalid(reference, &format!("invalid digest '{}'", digest)))
    }
}
