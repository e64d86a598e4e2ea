//! Cluster configuration
//!
//! [`ClusterConfig`] mirrors the user's config file: every key optional.
//! [`ClusterConfig::resolve`] applies defaults once and checks required keys,
//! producing the immutable [`ResolvedConfig`] every phase works from.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_SSH_PARALLELISM: usize = 20;
pub const DEFAULT_PROCESS_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_SSH_KEY_PATH: &str = "genconf/ssh_key";

/// Cluster topology and SSH settings as written by the user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Master hosts (required)
    pub master_list: Option<Vec<String>>,
    /// Private agent hosts
    pub agent_list: Option<Vec<String>>,
    /// Public agent hosts
    pub public_agent_list: Option<Vec<String>>,
    /// SSH login user (required)
    pub ssh_user: Option<String>,
    /// Private key used for every host
    pub ssh_key_path: Option<PathBuf>,
    /// Port used for hosts that do not carry their own
    pub ssh_port: Option<u16>,
    /// Maximum number of hosts worked on at once
    pub ssh_parallelism: Option<usize>,
    /// Per remote operation timeout, in seconds
    pub process_timeout: Option<u64>,
    /// Extra OpenSSH options
    pub extra_ssh_options: Option<String>,
}

/// SSH settings with defaults applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub user: String,
    pub key_path: PathBuf,
    pub port: u16,
    pub parallelism: usize,
    pub process_timeout: Duration,
    pub extra_options: String,
}

/// Fully resolved configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub master_list: Vec<String>,
    pub agent_list: Vec<String>,
    pub public_agent_list: Vec<String>,
    pub ssh: SshSettings,
}

impl ClusterConfig {
    /// Apply defaults and validate required keys
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` if `master_list` or `ssh_user` is
    /// missing, or if `ssh_parallelism` is zero
    pub fn resolve(&self) -> Result<ResolvedConfig, CoreError> {
        let master_list = self
            .master_list
            .clone()
            .ok_or_else(|| CoreError::ConfigError("master_list is required".to_string()))?;

        let user = self
            .ssh_user
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| CoreError::ConfigError("ssh_user is required".to_string()))?;

        let parallelism = self.ssh_parallelism.unwrap_or(DEFAULT_SSH_PARALLELISM);
        if parallelism == 0 {
            return Err(CoreError::ConfigError(
                "ssh_parallelism must be at least 1".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            master_list,
            agent_list: self.agent_list.clone().unwrap_or_default(),
            public_agent_list: self.public_agent_list.clone().unwrap_or_default(),
            ssh: SshSettings {
                user,
                key_path: self
                    .ssh_key_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SSH_KEY_PATH)),
                port: self.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
                parallelism,
                process_timeout: Duration::from_secs(
                    self.process_timeout.unwrap_or(DEFAULT_PROCESS_TIMEOUT_SECS),
                ),
                extra_options: self.extra_ssh_options.clone().unwrap_or_default(),
            },
        })
    }
}
