//! Cluster model and collaborator interfaces.
//!
//! This crate defines the pieces the orchestrator talks to but does not
//! implement: the node registry, the per-node container runtime, the
//! IaaS provider, the router, the app service, and the bootstrap work
//! queue. Everything is an async trait so real backends and the fakes
//! under [`testing`] are interchangeable.
//!
//! It also carries two small shared utilities: the per-host admission
//! limiter bounding concurrent runtime calls against one host, and the
//! progress log that pipelines write operator-facing lines to.

pub mod app;
pub mod limiter;
pub mod node;
pub mod progress;
pub mod runtime;
pub mod testing;

pub use app::{App, AppService, HealthcheckSpec};
pub use limiter::{HostLimiter, LimiterGuard, LocalLimiter, NoopLimiter};
pub use node::{Machine, Node, NodeCreationStatus, IAAS_ID_METADATA, IAAS_METADATA, POOL_METADATA};
pub use progress::{ProgressBuffer, ProgressLog};
pub use runtime::{
    ContainerRuntime, ContainerSpec, Iaas, InspectedContainer, NodeRegistry, Router, WorkQueue,
};
