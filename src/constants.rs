//! Constants for the pipeline execution core.
//!
//! All annotation keys, spec versions, and timing values are defined here
//! to ensure consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// OCI Spec
// =============================================================================

/// OCI Runtime Spec version written into every bundle config.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// OCI Image Spec version written into `oci-layout` marker files.
pub const OCI_IMAGE_LAYOUT_VERSION: &str = "1.0.0";

/// Annotation key carrying the original registry-style reference of a
/// stored image.
pub const OCI_REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

// =============================================================================
// OCI Media Types
// =============================================================================

/// OCI Image Manifest media type.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Index media type.
pub const OCI_IMAGE_INDEX_MEDIA_TYPE: &str = "application/vnd.oci.image.index.v1+json";

/// OCI Image Config media type.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI Layer media type (uncompressed).
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Legacy Docker layer media type (gzip compressed).
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

// =============================================================================
// Pipeline Conventions
// =============================================================================

/// Prefix of every container id created by this tool.
pub const CONTAINER_ID_PREFIX: &str = "ar_";

/// Suffix of pipeline template files under the pipelines dir.
pub const TEMPLATE_SUFFIX: &str = ".template.json";

/// Task record file name inside a run directory.
pub const TASK_RECORD_FILE: &str = "pipeline.json";

/// Default PATH appended to a container env when the image supplies none.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Hostname for the loader's self-install container.
pub const LOAD_HOSTNAME: &str = "ar-load";

/// Hostname for pipeline step containers.
pub const RUN_HOSTNAME: &str = "ar-run";

// =============================================================================
// Timing
// =============================================================================

/// Poll interval for the container wait loop.
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and the SIGKILL re-check during a sweep.
pub const SWEEP_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Poll interval for `task log --follow`.
pub const LOG_FOLLOW_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Archive Suffixes
// =============================================================================

/// Returns true when a file name looks like an image archive the loader
/// accepts.
pub fn is_archive_file(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".tar") || lower.ends_with(".tar.gz") || lower.ends_with(".tgz")
}

/// Strips a recognised archive suffix from a file name, if present.
pub fn strip_archive_ext(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for ext in [".tar.gz", ".tgz", ".tar"] {
        if lower.ends_with(ext) {
            return &name[..name.len() - ext.len()];
        }
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_file_detection() {
        assert!(is_archive_file("alpine.tar"));
        assert!(is_archive_file("alpine.TAR.GZ"));
        assert!(is_archive_file("alpine.tgz"));
        assert!(!is_archive_file("alpine.zip"));
        assert!(!is_archive_file("alpine"));
    }

    #[test]
    fn archive_ext_stripping() {
        assert_eq!(strip_archive_ext("alpine.tar"), "alpine");
        assert_eq!(strip_archive_ext("alpine.tar.gz"), "alpine");
        assert_eq!(strip_archive_ext("alpine.tgz"), "alpine");
        assert_eq!(strip_archive_ext("alpine"), "alpine");
    }
}
