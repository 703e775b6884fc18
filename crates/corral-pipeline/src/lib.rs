//! Rollback-capable action pipelines.
//!
//! A pipeline is an ordered list of actions sharing a context type `C`
//! and a result type `R`. Forwards run in order, each seeing the result
//! of its predecessor. When a forward fails, the failing action's error
//! hook fires and every *previously completed* action is rolled back in
//! reverse order with its own forward result. The failing action itself
//! is never rolled back: its forward did not complete, so it owns its
//! partial cleanup inside `forward`.
//!
//! ```text
//!   A.forward ──▶ B.forward ──▶ C.forward ✗
//!                                   │
//!                B.backward ◀── A.backward
//! ```
//!
//! Long multi-step operations pass a [`Cancellation`] handle through
//! their context so individual actions can bail out between steps.

pub mod action;
pub mod cancel;
pub mod pipeline;

pub use action::Action;
pub use cancel::{Cancellation, CancellationSource};
pub use pipeline::{Pipeline, PipelineError, PipelineResult};
