//! Media types accepted by the puller.
//!
//! Anything not listed here is rejected before a blob is fetched.

pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const OCI_LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const OCI_LAYER_NONDISTRIBUTABLE_TAR: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar";
pub const OCI_LAYER_NONDISTRIBUTABLE_TAR_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const OCI_LAYER_NONDISTRIBUTABLE_TAR_ZSTD: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+zstd";

pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER_TAR: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";

/// Manifest and index types sent in the `Accept` header.
pub const ACCEPTED_MANIFESTS: &[&str] = &[
    OCI_IMAGE_MANIFEST,
    DOCKER_MANIFEST,
    OCI_IMAGE_INDEX,
    DOCKER_MANIFEST_LIST,
];

pub fn is_config(media_type: &str) -> bool {
    matches!(media_type, OCI_IMAGE_CONFIG | DOCKER_CONFIG)
}

pub fn is_layer(media_type: &str) -> bool {
    matches!(
        media_type,
        OCI_LAYER_TAR
            | OCI_LAYER_TAR_GZIP
            | OCI_LAYER_TAR_ZSTD
            | OCI_LAYER_NONDISTRIBUTABLE_TAR
            | OCI_LAYER_NONDISTRIBUTABLE_TAR_GZIP
            | OCI_LAYER_NONDISTRIBUTABLE_TAR_ZSTD
            | DOCKER_LAYER_TAR
            | DOCKER_LAYER_GZIP
            | DOCKER_FOREIGN_LAYER_GZIP
    )
}

pub fn is_manifest(media_type: &str) -> bool {
    matches!(media_type, OCI_IMAGE_MANIFEST | DOCKER_MANIFEST)
}

pub fn is_index(media_type: &str) -> bool {
    matches!(media_type, OCI_IMAGE_INDEX | DOCKER_MANIFEST_LIST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_types() {
        assert!(is_config(OCI_IMAGE_CONFIG));
        assert!(is_config(DOCKER_CONFIG));
        assert!(!is_config(OCI_LAYER_TAR_GZIP));
        assert!(!is_config("application/vnd.cncf.helm.config.v1+json"));
    }

    #[test]
    fn test_layer_types() {
        assert!(is_layer(OCI_LAYER_TAR_GZIP));
        assert!(is_layer(OCI_LAYER_TAR_ZSTD));
        assert!(is_layer(DOCKER_LAYER_GZIP));
        assert!(!is_layer(OCI_IMAGE_CONFIG));
        assert!(!is_layer("application/vnd.cncf.helm.chart.content.v1.tar+gzip"));
        assert!(!is_layer(""));
    }

    #[test]
    fn test_manifest_and_index_types() {
        assert!(is_manifest(OCI_IMAGE_MANIFEST));
        assert!(is_manifest(DOCKER_MANIFEST));
        assert!(!is_manifest(OCI_IMAGE_INDEX));
        assert!(is_index(OCI_IMAGE_INDEX));
        assert!(is_index(DOCKER_MANIFEST_LIST));
    }

    #[test]
    fn test_accepted_manifests_cover_both_families() {
        assert!(ACCEPTED_MANIFESTS.iter().all(|m| is_manifest(m) || is_index(m)));
        assert_eq!(ACCEPTED_MANIFESTS.len(), 4);
    }
}
