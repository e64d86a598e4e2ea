//! Configuration file lookup and loading

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use tracing::{debug, warn};

use clusterup_core::ClusterConfig;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "CLUSTERUP_CONFIG";

/// Load a TOML cluster configuration
///
/// # Errors
/// Returns error if the file cannot be read or parsed
pub fn load(path: &Path) -> eyre::Result<ClusterConfig> {
    let content = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    let config: ClusterConfig =
        toml::from_str(&content).wrap_err_with(|| format!("invalid config {}", path.display()))?;
    debug!(path = %path.display(), "loaded configuration");
    Ok(config)
}

/// Candidate paths, most specific first
fn candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        paths.push(PathBuf::from(path));
    }
    paths.push(PathBuf::from("genconf/config.toml"));
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("clusterup/config.toml"));
    }
    paths
}

/// Load `explicit` if given, otherwise the first existing default location
///
/// # Errors
/// Returns error if the chosen file cannot be read or parsed
pub fn load_default(explicit: Option<&Path>) -> eyre::Result<ClusterConfig> {
    if let Some(path) = explicit {
        return load(path);
    }

    for path in candidates() {
        if path.exists() {
            return load(&path);
        }
    }

    // resolving an empty config reports the missing keys
    warn!("no config file found, using defaults");
    Ok(ClusterConfig::default())
}
