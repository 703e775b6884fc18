use corral_provision::ProvisionError;
use corral_state::StateError;

pub type HealerResult<T> = std::result::Result<T, HealerError>;

#[derive(Debug, thiserror::Error)]
pub enum HealerError {
    /// The healing-event chain for this entity is already too long to
    /// keep reacting inside the window.
    #[error("number of healings for {lineage:?} in the last 30 minutes exceeds limit of {limit}: {count}")]
    StormLimit {
        lineage: String,
        limit: usize,
        count: usize,
    },

    #[error("machine creation for healing {address:?} failed: {source}")]
    MachineCreation {
        address: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
