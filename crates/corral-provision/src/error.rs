use thiserror::Error;

use corral_pipeline::PipelineError;
use corral_scheduler::SchedulerError;
use corral_state::StateError;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("app {0:?} is locked by another operation")]
    AppLocked(String),

    #[error("container {0:?} no longer exists")]
    ContainerGone(String),

    #[error("some containers failed to move: {}", errors.join("; "))]
    MoveFailures { errors: Vec<String> },

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
