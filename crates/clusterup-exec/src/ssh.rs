//! SSH transport over russh: one lazily opened session per host

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::{PrivateKeyWithHashAlg, ssh_key};
use russh::{ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::result::{CommandResult, ConnectionInfo};
use crate::traits::{RemoteExecutor, shell_quote};

type Session = client::Handle<AcceptAnyHostKey>;

/// Accepts every host key, like `StrictHostKeyChecking=no`
struct AcceptAnyHostKey;

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// SSH executor for a single host
///
/// The session is opened by the first operation and reused until
/// [`RemoteExecutor::close`]. Operations on one executor are serialised.
pub struct SshExecutor {
    target: ConnectionInfo,
    key: Arc<ResolvedKey>,
    session: Mutex<Option<Session>>,
}

impl std::fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshExecutor")
            .field("target", &self.target)
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

impl SshExecutor {
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the key cannot be loaded
    pub fn new(target: ConnectionInfo, key_source: &KeySource) -> Result<Self, ExecError> {
        let key = key_source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        Ok(Self::with_resolved_key(target, Arc::new(key)))
    }

    /// Executor sharing an already loaded key
    #[must_use]
    pub fn with_resolved_key(target: ConnectionInfo, key: Arc<ResolvedKey>) -> Self {
        Self {
            target,
            key,
            session: Mutex::new(None),
        }
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.target
    }

    #[instrument(skip(self), fields(target = %self.target))]
    async fn open_session(&self) -> Result<Session, ExecError> {
        debug!(key = %self.key.origin(), "opening SSH session");

        let mut session = client::connect(
            Arc::new(client::Config::default()),
            (self.target.host.as_str(), self.target.port),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        let hash_alg = session
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let auth = session
            .authenticate_publickey(
                &self.target.user,
                PrivateKeyWithHashAlg::new(self.key.private_key(), hash_alg),
            )
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;
        if !auth.success() {
            return Err(ExecError::AuthenticationFailed(format!(
                "public key rejected for {}",
                self.target.user
            )));
        }

        info!(target = %self.target, "SSH session established");
        Ok(session)
    }

    /// Run `cmd` on the session, opening it first if needed
    async fn exchange(
        &self,
        cmd: &str,
        stdin: Option<tokio::fs::File>,
    ) -> Result<CommandResult, ExecError> {
        let mut guard = self.session.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_session().await?);
        }
        let session = guard.as_mut().ok_or(ExecError::NotConnected)?;
        run_channel(session, cmd, stdin).await
    }

    async fn bounded(
        &self,
        what: &str,
        limit: Duration,
        cmd: &str,
        stdin: Option<tokio::fs::File>,
    ) -> Result<CommandResult, ExecError> {
        tokio::time::timeout(limit, self.exchange(cmd, stdin))
            .await
            .unwrap_or_else(|_| {
                warn!(target = %self.target, operation = what, timeout = ?limit, "remote operation timed out");
                Err(ExecError::Timeout { timeout: limit })
            })
    }

    /// Close the session if one is open
    ///
    /// # Errors
    /// Returns `ExecError::IoError` if the disconnect message cannot be sent
    pub async fn disconnect(&self) -> Result<(), ExecError> {
        if let Some(session) = self.session.lock().await.take() {
            session
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            debug!(target = %self.target, "SSH session closed");
        }
        Ok(())
    }
}

/// Execute one command on a fresh channel, feeding `stdin` if given
async fn run_channel(
    session: &mut Session,
    cmd: &str,
    stdin: Option<tokio::fs::File>,
) -> Result<CommandResult, ExecError> {
    let io = |e: russh::Error| ExecError::IoError(e.to_string());
    let start = Instant::now();

    let mut channel = session.channel_open_session().await.map_err(io)?;
    channel.exec(true, cmd).await.map_err(io)?;
    if let Some(file) = stdin {
        channel.data(file).await.map_err(io)?;
        channel.eof().await.map_err(io)?;
    }

    let mut status = -1;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    // exit-status may arrive after EOF, so drain until the channel closes
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } => status = exit_status.cast_signed(),
            ChannelMsg::Close => break,
            _ => {}
        }
    }

    let result = CommandResult::from_bytes(status, &stdout, &stderr, start.elapsed());
    debug!(status, duration = ?result.duration, "remote command finished");
    Ok(result)
}

/// Remote shell line that writes stdin to `remote_path`
fn upload_command(remote_path: &str) -> String {
    let parent = Path::new(remote_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    format!(
        "mkdir -p {} && cat > {}",
        shell_quote(&parent),
        shell_quote(remote_path)
    )
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    #[instrument(skip(self, cmd), fields(target = %self.target))]
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        debug!(command = %cmd, "executing");
        self.bounded("execute", timeout, cmd, None).await
    }

    #[instrument(skip(self), fields(target = %self.target))]
    async fn copy(
        &self,
        local_path: &Path,
        remote_path: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| ExecError::LocalFile {
                path: local_path.display().to_string(),
                message: e.to_string(),
            })?;
        self.bounded("copy", timeout, &upload_command(remote_path), Some(file))
            .await
    }

    async fn close(&self) -> Result<(), ExecError> {
        self.disconnect().await
    }

    fn is_connected(&self) -> bool {
        // a held lock means an operation is in flight on an open session
        self.session
            .try_lock()
            .map(|session| session.is_some())
            .unwrap_or(true)
    }

    fn executor_type(&self) -> &'static str {
        "ssh"
    }
}
