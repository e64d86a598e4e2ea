//! Command outcome and connection target

use std::fmt;
use std::time::Duration;

/// Outcome of one command or copy on a host
///
/// A non-zero `status` is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    /// Exit status, `-1` when the process reported none
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandResult {
    /// Build from raw process output, decoding lossily
    #[must_use]
    pub fn from_bytes(status: i32, stdout: &[u8], stderr: &[u8], duration: Duration) -> Self {
        Self {
            status,
            stdout: String::from_utf8_lossy(stdout).into_owned(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
            duration,
        }
    }

    /// Successful outcome with no output, as reported by copies
    #[must_use]
    pub fn empty(duration: Duration) -> Self {
        Self::from_bytes(0, &[], &[], duration)
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// SSH login target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl ConnectionInfo {
    /// Target on the standard SSH port
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            user: user.into(),
        }
    }

    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}
