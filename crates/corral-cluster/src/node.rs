//! Worker node model.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Metadata key naming the node's pool. Nodes without it are invisible
/// to the autoscaler.
pub const POOL_METADATA: &str = "pool";
/// Metadata key naming the IaaS provider that created the node.
pub const IAAS_METADATA: &str = "iaas";
/// Metadata key holding the IaaS machine id. Ignored when comparing
/// node metadata: nodes registered by hand may lack it.
pub const IAAS_ID_METADATA: &str = "iaas-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCreationStatus {
    /// Registered but still bootstrapping; not eligible for placement.
    Pending,
    Created,
    /// Pulled from rotation after repeated failures.
    Disabled,
}

/// A worker host able to run containers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Endpoint URL, e.g. `http://10.0.0.5:2375`.
    pub address: String,
    pub metadata: BTreeMap<String, String>,
    pub status: NodeCreationStatus,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_success: Option<u64>,
}

impl Node {
    pub fn new(address: impl Into<String>, pool: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert(POOL_METADATA.to_string(), pool.to_string());
        Node {
            address: address.into(),
            metadata,
            status: NodeCreationStatus::Created,
            failure_count: 0,
            last_success: None,
        }
    }

    pub fn pool(&self) -> Option<&str> {
        self.metadata.get(POOL_METADATA).map(String::as_str)
    }

    pub fn iaas(&self) -> Option<&str> {
        self.metadata.get(IAAS_METADATA).map(String::as_str)
    }

    pub fn iaas_id(&self) -> Option<&str> {
        self.metadata.get(IAAS_ID_METADATA).map(String::as_str)
    }

    /// Host part of the address, used to match containers' `host_addr`.
    pub fn host(&self) -> &str {
        let rest = self
            .address
            .split_once("://")
            .map_or(self.address.as_str(), |(_, rest)| rest);
        rest.split(':').next().unwrap_or(rest)
    }
}

/// A machine created by an IaaS provider, backing a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_strips_scheme_and_port() {
        let node = Node::new("http://10.0.0.5:2375", "pool1");
        assert_eq!(node.host(), "10.0.0.5");

        let bare = Node::new("10.0.0.5", "pool1");
        assert_eq!(bare.host(), "10.0.0.5");
    }

    #[test]
    fn pool_comes_from_metadata() {
        let mut node = Node::new("http://h:1", "pool1");
        assert_eq!(node.pool(), Some("pool1"));
        node.metadata.remove(POOL_METADATA);
        assert_eq!(node.pool(), None);
    }
}
