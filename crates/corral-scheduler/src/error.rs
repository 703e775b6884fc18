use thiserror::Error;

use corral_state::StateError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("no candidate nodes for placement")]
    NoNodes,

    #[error(
        "no nodes found with enough memory for container of {app:?}: {needed_mb:.4}MB needed"
    )]
    NoMemory { app: String, needed_mb: f64 },

    #[error("invalid scheduler input: {0}")]
    InvalidInput(String),

    #[error("no removable container found for {app:?} process {process:?}")]
    NoVictim { app: String, process: String },

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
