//! Self-healing: replacement of dead hosts and unresponsive containers.
//!
//! Two healers share the durable healing-event log in the state store:
//!
//! * the node healer reacts to the cluster's error hook, replacing a
//!   repeatedly-failing host with a fresh IaaS machine and draining
//!   the old one;
//! * the container healer is a periodic loop that finds containers
//!   whose status reports went silent and moves them.
//!
//! Both refuse to act when the event log shows a healing chain longer
//! than the storm limit inside a 30 minute window.

pub mod container;
pub mod error;
pub mod node;

pub use container::{ContainerHealer, ContainerHealerConfig};
pub use error::{HealerError, HealerResult};
pub use node::{NodeHealer, NodeHealerConfig};

/// Window for counting consecutive healings of one lineage.
pub(crate) const STORM_WINDOW_SECS: u64 = 30 * 60;
/// Maximum follow-up healings tolerated inside the window.
pub(crate) const STORM_LIMIT: usize = 3;
