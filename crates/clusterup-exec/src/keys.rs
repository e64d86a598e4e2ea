//! SSH private key loading
//!
//! A key is read and parsed once per run; every host's session then
//! authenticates with the same in-memory key.

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

/// Where the private key comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Key file, readable by its owner only
    Path(PathBuf),
    /// Environment variable holding the base64-encoded key file
    Env(String),
}

impl fmt::Display for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Path(path) => write!(f, "{}", path.display()),
            KeySource::Env(var) => write!(f, "${var}"),
        }
    }
}

impl KeySource {
    /// Read and parse the key
    ///
    /// # Errors
    /// Returns `KeyError` if the file is missing or too open, the variable is
    /// unset or not base64, or the content is not an unencrypted private key
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        let key = match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                load_secret_key(path, None).map_err(|e| KeyError::InvalidKey(e.to_string()))?
            }
            KeySource::Env(var_name) => {
                let encoded =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let decoded = base64::engine::general_purpose::STANDARD
                    .decode(encoded.trim())
                    .map_err(|_| KeyError::InvalidBase64)?;
                let text = String::from_utf8(decoded)
                    .map_err(|_| KeyError::InvalidKey("not a text key file".to_string()))?;
                decode_secret_key(&text, None).map_err(|e| KeyError::InvalidKey(e.to_string()))?
            }
        };

        debug!(source = %self, "loaded SSH key");
        Ok(ResolvedKey {
            origin: self.to_string(),
            key: Arc::new(key),
        })
    }
}

/// A parsed private key, cheap to clone
#[derive(Clone)]
pub struct ResolvedKey {
    origin: String,
    key: Arc<PrivateKey>,
}

impl ResolvedKey {
    /// Where the key was loaded from
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn private_key(&self) -> Arc<PrivateKey> {
        self.key.clone()
    }
}

impl fmt::Debug for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedKey")
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

/// Key loading errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("unusable private key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(KeyError::NotFound(path.display().to_string()));
        }
        Err(e) => return Err(KeyError::Io(e)),
    };

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}
