//! Pool-segregated container placement.
//!
//! The scheduler picks a host for each new container and a victim
//! container when units are removed. Candidates arrive already filtered
//! to the app's pool; placement then applies a memory admission filter
//! and a load score favoring the host with the fewest containers of the
//! same app+process, tie-broken by fewest containers overall.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{ScheduleOpts, Scheduler, SchedulerOpts};
