//! Local artifact resolution: bootstrap tarball, package set, scripts

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, error};

use crate::error::CoreError;

pub const BOOTSTRAP_ID_ENV: &str = "BOOTSTRAP_ID";
pub const DEFAULT_SERVE_DIR: &str = "genconf/serve";
pub const DEFAULT_BOOTSTRAP_DIR: &str = "genconf/serve/bootstrap";
pub const DEFAULT_CLUSTER_PACKAGES_PATH: &str = "genconf/cluster_packages.json";
pub const INSTALL_SCRIPT_NAME: &str = "dcos_install.sh";

/// Where the installer expects its local inputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    /// Directory holding the install script and package files
    pub serve_dir: PathBuf,
    /// Directory holding `<id>.bootstrap.tar.xz`
    pub bootstrap_dir: PathBuf,
    /// JSON manifest `{package: {filename}}`
    pub cluster_packages_path: PathBuf,
    /// Bundle identifier, normally from `BOOTSTRAP_ID`
    pub bootstrap_id: Option<String>,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            serve_dir: PathBuf::from(DEFAULT_SERVE_DIR),
            bootstrap_dir: PathBuf::from(DEFAULT_BOOTSTRAP_DIR),
            cluster_packages_path: PathBuf::from(DEFAULT_CLUSTER_PACKAGES_PATH),
            bootstrap_id: None,
        }
    }
}

/// A package from the manifest and where its file should be locally
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageArtifact {
    pub package: String,
    pub filename: String,
    pub local_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    filename: String,
}

impl ArtifactLayout {
    /// Default layout rooted at `serve_dir`, with the bundle id from the
    /// environment
    pub fn from_env(serve_dir: impl Into<PathBuf>) -> Self {
        let serve_dir = serve_dir.into();
        Self {
            bootstrap_dir: serve_dir.join("bootstrap"),
            serve_dir,
            bootstrap_id: std::env::var(BOOTSTRAP_ID_ENV)
                .ok()
                .filter(|id| !id.is_empty()),
            ..Self::default()
        }
    }

    /// Local install script, also used for preflight
    #[must_use]
    pub fn install_script(&self) -> PathBuf {
        self.serve_dir.join(INSTALL_SCRIPT_NAME)
    }

    /// Path of the bootstrap tarball for the configured bundle id
    ///
    /// # Errors
    /// `MissingEnv` when no bundle id is known, `MissingBootstrap` when the
    /// tarball is not on disk
    pub fn locate_bootstrap(&self) -> Result<PathBuf, CoreError> {
        let Some(id) = self.bootstrap_id.as_deref() else {
            error!("{BOOTSTRAP_ID_ENV} must be set");
            return Err(CoreError::MissingEnv(BOOTSTRAP_ID_ENV));
        };

        let tarball = self.bootstrap_dir.join(format!("{id}.bootstrap.tar.xz"));
        if !tarball.is_file() {
            error!(
                dir = %self.bootstrap_dir.display(),
                expected = %tarball.display(),
                "bootstrap tarball not found, check {BOOTSTRAP_ID_ENV} and rerun genconf"
            );
            return Err(CoreError::MissingBootstrap {
                dir: self.bootstrap_dir.clone(),
                expected: tarball,
            });
        }

        debug!(tarball = %tarball.display(), "local bootstrap found");
        Ok(tarball)
    }

    /// Packages listed in the manifest, resolved against `serve_dir`.
    ///
    /// Individual package files are not checked here.
    ///
    /// # Errors
    /// `MissingArtifact` when the manifest is absent, `ConfigError` when it is
    /// not a `{package: {filename}}` object
    pub fn locate_packages(&self) -> Result<Vec<PackageArtifact>, CoreError> {
        let manifest = read_manifest(&self.cluster_packages_path)?;
        Ok(manifest
            .into_iter()
            .map(|(package, entry)| PackageArtifact {
                local_path: self.serve_dir.join(&entry.filename),
                filename: entry.filename,
                package,
            })
            .collect())
    }
}

fn read_manifest(path: &Path) -> Result<BTreeMap<String, ManifestEntry>, CoreError> {
    if !path.is_file() {
        error!(path = %path.display(), "package manifest not found");
        return Err(CoreError::MissingArtifact(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| CoreError::ConfigError(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| CoreError::ConfigError(format!("{}: {e}", path.display())))
}
