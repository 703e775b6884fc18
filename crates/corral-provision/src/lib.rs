//! Container provisioning: pipelines, mover, and the façade.
//!
//! This crate turns intents ("this app needs two more web units",
//! "drain that host") into sequences of reversible actions over the
//! cluster collaborators. The layering:
//!
//! ```text
//!   Provisioner ──▶ unit-change pipelines ──▶ per-container pipelines
//!        │                   │
//!        ├─ AppLocker        └─ run_in_containers (parallel fan-out)
//!        ├─ image naming
//!        └─ mover / rebalancer
//! ```

pub mod actions;
pub mod error;
pub mod images;
pub mod locker;
pub mod mover;
pub mod provisioner;
pub mod runner;
#[cfg(test)]
pub(crate) mod testutil;

pub use error::{ProvisionError, ProvisionResult};
pub use images::ImageConfig;
pub use locker::AppLocker;
pub use mover::RebalanceFilter;
pub use provisioner::{ProvisionConfig, Provisioner};
