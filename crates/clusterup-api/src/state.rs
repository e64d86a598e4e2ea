//! Persisted run-state document
//!
//! One JSON file per phase run (`<state_dir>/<phase>.json`). The `hosts` map is
//! keyed by `address:port`; counters live at the top level because consumers
//! read them from there. Host records are kept as raw JSON so entries written
//! by other tools survive a read/write cycle untouched, as do unknown
//! top-level fields.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::report::{HostStatus, NodeResult, StageOutcome};

/// Outcome of one host as this driver records it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    #[serde(default)]
    pub host_status: HostStatus,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<StageOutcome>,
}

impl From<&NodeResult> for HostRecord {
    fn from(result: &NodeResult) -> Self {
        Self {
            host_status: result.status,
            tags: result.tags.clone(),
            commands: result.outcomes.clone(),
        }
    }
}

/// Top-level state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default)]
    pub hosts: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_hosts: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_masters: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_agents: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RunState {
    /// Merge caller-supplied fields into the top level. Known counters are
    /// overwritten; anything else lands in `extra`.
    pub fn merge_fields(&mut self, fields: &Map<String, Value>) {
        for (key, value) in fields {
            match key.as_str() {
                "total_hosts" => self.total_hosts = value.as_u64(),
                "total_masters" => self.total_masters = value.as_u64(),
                "total_agents" => self.total_agents = value.as_u64(),
                "chain_name" => self.chain_name = value.as_str().map(ToString::to_string),
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
    }

    /// Replace the entry of `host` with `record`
    pub fn set_host(&mut self, host: impl Into<String>, record: &HostRecord) {
        let value = serde_json::to_value(record).unwrap_or_else(|_| {
            serde_json::json!({ "host_status": record.host_status })
        });
        self.hosts.insert(host.into(), value);
    }

    /// Status of `host`, if recorded in a form this driver understands
    #[must_use]
    pub fn host_status(&self, host: &str) -> Option<HostStatus> {
        self.hosts.get(host).and_then(status_of)
    }

    /// Number of hosts currently holding the given status
    #[must_use]
    pub fn count(&self, status: HostStatus) -> usize {
        self.hosts
            .values()
            .filter(|record| status_of(record) == Some(status))
            .count()
    }

    /// True when every host with a known status reached a terminal one
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let mut statuses = self.hosts.values().filter_map(status_of).peekable();
        statuses.peek().is_some() && statuses.all(HostStatus::is_terminal)
    }
}

fn status_of(record: &Value) -> Option<HostStatus> {
    record
        .get("host_status")
        .and_then(|status| HostStatus::deserialize(status).ok())
}
