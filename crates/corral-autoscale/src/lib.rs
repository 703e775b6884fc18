//! Node autoscaling: a periodic loop that grows or shrinks each pool.
//!
//! Every run groups the fleet's nodes by pool and, per pool, takes an
//! exclusive autoscale event, loads the pool's rule (falling back to
//! the default rule), and asks a scaler what to do:
//!
//! * the count scaler keeps `max_container_count` slots per node;
//! * the memory scaler keeps room for the largest app plan on at
//!   least one node.
//!
//! Node additions clone the metadata of the least-represented node
//! configuration so pools stay diverse; removals refuse to delete the
//! last node of any configuration. After scaling, a dry-run rebalance
//! decides whether a real one is worth the churn.

pub mod autoscaler;
pub mod error;
pub mod metadata;
pub mod scalers;

pub use autoscaler::{Autoscaler, AutoscaleConfig};
pub use error::{AutoscaleError, AutoscaleResult};
pub use scalers::ScalerResult;

/// Container-count spread between hosts tolerated before a rebalance.
pub(crate) const REBALANCE_GAP_THRESHOLD: i64 = 2;
