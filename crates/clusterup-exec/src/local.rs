//! Local transport: commands through `sh -c`, copies as filesystem copies

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::RemoteExecutor;

/// Runs every stage on this machine
///
/// The "remote" path of a copy is a local path. Useful for dry runs against
/// `localhost` and for exercising phases in tests.
#[derive(Debug, Clone, Default)]
pub struct LocalExecutor;

impl LocalExecutor {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

async fn bounded<F>(what: &str, limit: Duration, op: F) -> Result<CommandResult, ExecError>
where
    F: Future<Output = Result<CommandResult, ExecError>>,
{
    tokio::time::timeout(limit, op).await.unwrap_or_else(|_| {
        warn!(operation = what, timeout = ?limit, "local operation timed out");
        Err(ExecError::Timeout { timeout: limit })
    })
}

async fn shell(cmd: &str) -> Result<CommandResult, ExecError> {
    let start = Instant::now();
    let output = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExecError::SpawnError(e.to_string()))?
        .wait_with_output()
        .await
        .map_err(|e| ExecError::IoError(e.to_string()))?;

    let result = CommandResult::from_bytes(
        output.status.code().unwrap_or(-1),
        &output.stdout,
        &output.stderr,
        start.elapsed(),
    );
    debug!(status = result.status, duration = ?result.duration, "local command finished");
    Ok(result)
}

async fn copy_file(local_path: &Path, target: &Path) -> Result<CommandResult, ExecError> {
    let start = Instant::now();
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
    }

    let bytes = tokio::fs::copy(local_path, target)
        .await
        .map_err(|e| ExecError::LocalFile {
            path: local_path.display().to_string(),
            message: e.to_string(),
        })?;
    debug!(to = %target.display(), bytes, "copied file");
    Ok(CommandResult::empty(start.elapsed()))
}

#[async_trait]
impl RemoteExecutor for LocalExecutor {
    #[instrument(skip(self), level = "debug")]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        bounded("execute", timeout, shell(cmd)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn copy(
        &self,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        bounded("copy", timeout, copy_file(local_path, Path::new(remote_path))).await
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn executor_type(&self) -> &'static str {
        "local"
    }
}
