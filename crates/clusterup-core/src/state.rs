//! Persisted run state and retry bookkeeping
//!
//! Each phase run owns one JSON document. Absence or corruption of the file
//! is never an error: it reads as an empty document. Callers must not run
//! two retries against the same file at once.

use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use clusterup_api::RunState;

/// `<state_dir>/<phase>.json`
#[must_use]
pub fn state_file_path(state_dir: &Path, phase: &str) -> PathBuf {
    state_dir.join(format!("{phase}.json"))
}

/// Handle on one state document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_phase(state_dir: &Path, phase: &str) -> Self {
        Self::new(state_file_path(state_dir, phase))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current document, or an empty one if the file is absent or unreadable
    #[must_use]
    pub fn read(&self) -> RunState {
        self.read_raw()
            .and_then(|doc| {
                serde_json::from_value(doc)
                    .inspect_err(|e| {
                        warn!(path = %self.path.display(), error = %e, "unexpected state file layout, treating as empty");
                    })
                    .ok()
            })
            .unwrap_or_default()
    }

    /// The document as untyped JSON, `None` if absent or not a JSON object
    fn read_raw(&self) -> Option<Value> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read state file, treating as empty");
                return None;
            }
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(doc) if doc.is_object() => Some(doc),
            Ok(_) => {
                warn!(path = %self.path.display(), "state file is not a JSON object, treating as empty");
                None
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "malformed state file, treating as empty");
                None
            }
        }
    }

    /// Replace the document
    ///
    /// # Errors
    /// Returns the underlying I/O error
    pub fn write(&self, state: &RunState) -> io::Result<()> {
        self.write_bytes(&encode(state)?)
    }

    /// Replace the document with already encoded JSON. Written to a sibling
    /// file then renamed so readers never observe a partial document.
    ///
    /// # Errors
    /// Returns the underlying I/O error
    pub fn write_bytes(&self, json: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)
    }

    /// Drop the record of `host` (`address:port`), leaving every other byte
    /// of the document's content as it was.
    ///
    /// Returns false when the file or the host is absent, or when the updated
    /// document cannot be written.
    pub fn remove_host(&self, host: &str) -> bool {
        let Some(mut doc) = self.read_raw() else {
            return false;
        };
        let removed = doc
            .get_mut("hosts")
            .and_then(Value::as_object_mut)
            .and_then(|hosts| hosts.remove(host))
            .is_some();
        if !removed {
            return false;
        }

        debug!(host, path = %self.path.display(), "removing host from state file");
        match serde_json::to_vec_pretty(&doc)
            .map_err(io::Error::other)
            .and_then(|json| self.write_bytes(&json))
        {
            Ok(()) => true,
            Err(e) => {
                warn!(host, path = %self.path.display(), error = %e, "failed to rewrite state file");
                false
            }
        }
    }

    /// Forget the given hosts ahead of a retry and return the recorded
    /// `total_hosts`, which is kept as is so the report's denominator still
    /// covers the whole cluster.
    pub fn prepare_retry<S: AsRef<str>>(&self, hosts: &[S]) -> Option<u64> {
        for host in hosts {
            self.remove_host(host.as_ref());
        }
        self.read_raw()?.get("total_hosts")?.as_u64()
    }
}

/// Pretty JSON encoding of a state document
///
/// # Errors
/// Returns an I/O error wrapping the serialization failure
pub fn encode(state: &RunState) -> io::Result<Vec<u8>> {
    serde_json::to_vec_pretty(state).map_err(io::Error::other)
}
