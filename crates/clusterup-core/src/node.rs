//! Cluster nodes and role-based target resolution

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::ResolvedConfig;
use crate::error::CoreError;

pub const ROLE_TAG: &str = "role";
pub const INSTALL_PARAM_TAG: &str = "dcos_install_param";

/// Role a host plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Master,
    Agent,
    PublicAgent,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "agent",
            Role::PublicAgent => "public_agent",
        }
    }

    /// Argument handed to the install script for this role
    #[must_use]
    pub fn install_param(self) -> &'static str {
        match self {
            Role::Master => "master",
            Role::Agent => "slave",
            Role::PublicAgent => "slave_public",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Role::Master),
            "agent" => Ok(Role::Agent),
            "public_agent" => Ok(Role::PublicAgent),
            other => Err(CoreError::ConfigError(format!("unknown role: {other}"))),
        }
    }
}

/// One addressable host plus its tags.
///
/// Equality and hashing only consider `address:port`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    address: String,
    port: u16,
    #[serde(default)]
    tags: BTreeMap<String, String>,
}

impl Node {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tags: BTreeMap::new(),
        }
    }

    /// Parse `host` or `host:port`; bare hosts get `default_port`
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` for an empty host or a bad port
    pub fn parse(host: &str, default_port: u16) -> Result<Self, CoreError> {
        let host = host.trim();
        if host.is_empty() {
            return Err(CoreError::ConfigError("empty host in node list".to_string()));
        }

        // [v6]:port, v4:port, name:port; a bare v6 address has several colons
        let (address, port) = if let Some(rest) = host.strip_prefix('[') {
            let (addr, tail) = rest
                .split_once(']')
                .ok_or_else(|| CoreError::ConfigError(format!("malformed host: {host}")))?;
            match tail.strip_prefix(':') {
                Some(port) => (addr, Some(port)),
                None if tail.is_empty() => (addr, None),
                None => return Err(CoreError::ConfigError(format!("malformed host: {host}"))),
            }
        } else {
            match host.split_once(':') {
                Some((addr, port)) if !port.contains(':') => (addr, Some(port)),
                _ => (host, None),
            }
        };

        let port = match port {
            Some(p) => p
                .parse::<u16>()
                .map_err(|_| CoreError::ConfigError(format!("invalid port in host: {host}")))?,
            None => default_port,
        };

        Ok(Self::new(address, port))
    }

    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_role(self, role: Role) -> Self {
        self.with_tag(ROLE_TAG, role.as_str())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn role(&self) -> Option<Role> {
        self.tag(ROLE_TAG).and_then(|r| r.parse().ok())
    }

    pub fn install_param(&self) -> Option<&str> {
        self.tag(INSTALL_PARAM_TAG)
    }

    /// `address:port`, the identity used in state files
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

fn role_lists(config: &ResolvedConfig) -> [(Role, &[String]); 3] {
    [
        (Role::Master, config.master_list.as_slice()),
        (Role::Agent, config.agent_list.as_slice()),
        (Role::PublicAgent, config.public_agent_list.as_slice()),
    ]
}

/// Every configured host tagged with its role: masters, agents, public agents.
///
/// # Errors
/// Returns `CoreError::ConfigError` if a host string is malformed
pub fn resolve_nodes(config: &ResolvedConfig) -> Result<Vec<Node>, CoreError> {
    let mut targets = Vec::new();
    for (role, hosts) in role_lists(config) {
        for host in hosts {
            targets.push(Node::parse(host, config.ssh.port)?.with_role(role));
        }
    }
    debug!(count = targets.len(), "resolved full target list");
    Ok(targets)
}

/// Like [`resolve_nodes`], with each node also tagged with the install
/// script argument for its role
///
/// # Errors
/// Returns `CoreError::ConfigError` if a host string is malformed
pub fn install_targets(config: &ResolvedConfig) -> Result<Vec<Node>, CoreError> {
    Ok(resolve_nodes(config)?
        .into_iter()
        .map(|node| match node.role() {
            Some(role) => node.with_tag(INSTALL_PARAM_TAG, role.install_param()),
            None => node,
        })
        .collect())
}

/// Host counts by role, reported at the top level of state documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCounts {
    pub total_masters: usize,
    /// Private and public agents together
    pub total_agents: usize,
}

impl RoleCounts {
    /// As top-level report fields
    #[must_use]
    pub fn to_fields(self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("total_masters".to_string(), json!(self.total_masters));
        fields.insert("total_agents".to_string(), json!(self.total_agents));
        fields
    }
}

#[must_use]
pub fn count_by_role(config: &ResolvedConfig) -> RoleCounts {
    RoleCounts {
        total_masters: config.master_list.len(),
        total_agents: config.agent_list.len() + config.public_agent_list.len(),
    }
}
