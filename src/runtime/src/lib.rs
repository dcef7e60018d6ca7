//! scantask runtime - pulls an OCI artifact, packs it as a Docker archive and
//! runs the vulnerability scanner over it.
//!
//! The pieces are usable on their own (the `fetch` command uses everything but
//! the scanner) and are tied together by [`ScanPipeline`].

#![allow(clippy::result_large_err)]

pub mod archive;
pub mod oci;
pub mod pipeline;
pub mod scanner;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use archive::{ArchiveBuilder, ArchiveBundle, DockerManifestEntry};
pub use oci::{ArtifactPuller, ArtifactReference, CredentialMap, RegistryKind, RegistryResolvers};
pub use pipeline::{JobPipeline, ScanPipeline};
pub use scanner::{GrypeScanner, ScanReport, ScanResult, ScannerPort};

/// scantask runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
