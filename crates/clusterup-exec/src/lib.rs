//! clusterup-exec: Remote execution abstraction
//!
//! Provides the per-host transport used by the cluster driver: run a command
//! or copy a file on one host, bounded by a timeout. Implementations exist for
//! SSH (russh) and for the local machine.

pub mod error;
pub mod keys;
pub mod local;
pub mod result;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use keys::{KeyError, KeySource, ResolvedKey};
pub use local::LocalExecutor;
pub use result::{CommandResult, ConnectionInfo};
pub use ssh::SshExecutor;
pub use traits::{RemoteExecutor, join_argv, shell_quote};
