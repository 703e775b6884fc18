//! corral-state — embedded state store for the corral orchestrator.
//!
//! The metadata store is the source of truth for the fleet: container
//! records, per-app image history, the healing event log, and autoscale
//! rules/events all live here. Values are JSON-serialized into redb
//! tables; an in-memory backend is available for tests.
//!
//! # Architecture
//!
//! ```text
//! StateStore
//!   ├── containers        (repository: CRUD + fleet queries)
//!   ├── images            (per-app version counter + ordered history)
//!   ├── healing_events    (append-only log with lineage chains)
//!   ├── autoscale_rules   (per-pool scaling configuration)
//!   └── autoscale_events  (exclusive per-pool event guard + last result)
//! ```

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
