use std::collections::BTreeMap;

use corral_provision::ProvisionError;
use corral_state::StateError;

pub type AutoscaleResult<T> = std::result::Result<T, AutoscaleError>;

#[derive(Debug, thiserror::Error)]
pub enum AutoscaleError {
    /// Two nodes share part but not all of an exclusive metadata set;
    /// there is no way to group them for diversity accounting.
    #[error("unbalanced metadata for node group: {first:?} vs {second:?}")]
    UnbalancedMetadata {
        first: BTreeMap<String, String>,
        second: BTreeMap<String, String>,
    },

    /// New machines can only be cloned from nodes that say which IaaS
    /// created them.
    #[error("no IaaS information in nodes metadata: {0:?}")]
    MissingIaas(BTreeMap<String, String>),

    #[error("node {address} has no {key:?} metadata, required by the memory scaler")]
    MissingMemoryMetadata { address: String, key: String },

    #[error("not all required nodes were created: {0}")]
    PartialNodeAdd(String),

    #[error("errors removing nodes: {}", errors.join("; "))]
    NodeRemoval { errors: Vec<String> },

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
