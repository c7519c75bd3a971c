//! Error types for the pipeline execution core.

use std::path::PathBuf;

/// Result type alias for pipeline core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pipeline execution core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Input Errors
    // =========================================================================
    /// A required field or argument was empty or malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Pipeline template contains a cycle or references an unknown step.
    #[error("pipeline template has a cycle or an unknown step reference, no topological order exists")]
    InvalidDag,

    // =========================================================================
    // Not-Found Errors
    // =========================================================================
    /// Image absent from the local store.
    #[error("image not found: {0} (run `allrun load` first)")]
    ImageNotFound(String),

    /// Pipeline template file absent.
    #[error("pipeline template not found: {path} (load the pipeline image first)")]
    TemplateNotFound { path: PathBuf },

    /// No run directory matches the task id.
    #[error("no pipeline task found for task id: {0}")]
    TaskNotFound(String),

    // =========================================================================
    // Archive/Image Errors
    // =========================================================================
    /// Neither docker-archive nor OCI-archive decoding succeeded.
    #[error("unsupported image archive format: {path}")]
    UnsupportedArchive { path: PathBuf },

    /// Archive is structurally broken.
    #[error("malformed image archive: {reason}")]
    ArchiveMalformed { reason: String },

    /// Tar entry resolves outside the extraction root.
    #[error("illegal tar entry path: {path}")]
    PathTraversal { path: String },

    /// Layer extraction failed.
    #[error("failed to extract layer {digest}: {reason}")]
    LayerExtractionFailed { digest: String, reason: String },

    // =========================================================================
    // Rootfs/Bundle Errors
    // =========================================================================
    /// The extracted rootfs is missing something the container needs.
    #[error("pipeline image rootfs is unusable: {reason}")]
    RootfsDefect { reason: String },

    /// Invalid bundle (missing config.json, empty process, terminal, ...).
    #[error("invalid bundle at {path}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    // =========================================================================
    // Container Runtime Errors
    // =========================================================================
    /// Container create failed.
    #[error("failed to create container '{id}': {reason}")]
    CreateFailed { id: String, reason: String },

    /// Container start failed.
    #[error("failed to start container '{id}': {reason}")]
    StartFailed { id: String, reason: String },

    /// Signal delivery failed.
    #[error("failed to send signal to container '{id}': {reason}")]
    SignalFailed { id: String, reason: String },

    /// Container delete failed.
    #[error("failed to delete container '{id}': {reason}")]
    DeleteFailed { id: String, reason: String },

    /// Container process exited with a non-zero code. Output is the merged
    /// stdout/stderr captured during the run.
    #[error("container '{id}' exited with code {code}, output: {output}")]
    ContainerExitNonZero {
        id: String,
        code: i32,
        output: String,
    },

    /// The ambient cancellation token fired while the container was running.
    #[error("container '{id}' cancelled, output: {output}")]
    Cancelled { id: String, output: String },

    /// A pipeline step failed; wraps the underlying cause.
    #[error("step '{step}' failed: {source}")]
    StepFailed {
        step: String,
        #[source]
        source: Box<Error>,
    },

    /// Operation not supported on this platform.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// I/O error with the path that produced it.
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON encode/decode error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Wraps an I/O error with the path it occurred at.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Wraps an error as a step failure so the task record points at the
    /// offending step by name.
    pub fn step(step: impl Into<String>, source: Error) -> Self {
        Self::StepFailed {
            step: step.into(),
            source: Box::new(source),
        }
    }
}
