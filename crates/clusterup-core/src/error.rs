//! Core error types for clusterup-core

use std::path::PathBuf;

use thiserror::Error;

use clusterup_exec::ExecError;

/// Errors raised before or around a phase run.
///
/// Remote stage failures are not errors: they are reported per node in the
/// returned results.
#[derive(Error, Debug, Clone)]
pub enum CoreError {
    /// Missing or malformed configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A local file the phase needs is absent
    #[error("{} not found", .0.display())]
    MissingArtifact(PathBuf),

    /// The bootstrap tarball is absent from the bootstrap directory
    #[error("bootstrap tarball not found in {}", dir.display())]
    MissingBootstrap {
        /// Directory that was searched
        dir: PathBuf,
        /// Expected tarball path
        expected: PathBuf,
    },

    /// A required environment variable is unset
    #[error("{0} must be set")]
    MissingEnv(&'static str),

    /// A package referenced by the manifest has no local file
    #[error("package {package} not found at {}", path.display())]
    PackageCopyError {
        /// Package identifier from the manifest
        package: String,
        /// Local path that was expected
        path: PathBuf,
    },

    /// Transport could not be set up (e.g. SSH key)
    #[error("transport error: {0}")]
    Exec(#[from] ExecError),

    /// The driver task failed to complete
    #[error("driver error: {0}")]
    Driver(String),
}
