//! Remote executor trait

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

/// A transport able to run commands and place files on a single host.
///
/// A non-zero exit status is *not* an error: it is reported in the returned
/// [`CommandResult`]. `Err` is reserved for transport failures (connect, auth,
/// timeout, local I/O).
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run a shell command line, bounded by `timeout`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Copy a local file to `remote_path`, creating the parent directory
    async fn copy(
        &self,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Run an argv. Elements are joined with spaces and interpreted by the
    /// remote shell, so an element may itself be a whole script.
    async fn execute(&self, argv: &[String], timeout: Duration) -> Result<CommandResult, ExecError> {
        self.run_with_timeout(&join_argv(argv), timeout).await
    }

    /// Release any session held for this host
    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn executor_type(&self) -> &'static str;
}

/// Join an argv into one command line
#[must_use]
pub fn join_argv(argv: &[String]) -> String {
    argv.join(" ")
}

/// Quote a string for POSIX shells using single quotes
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
