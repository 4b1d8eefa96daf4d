//! HITL orchestrator for spice
//!
//! The [`Arbiter`] consumes human responses from a [`ResponseQueue`],
//! correlates each one to a WAITING checkpoint by
//! `(run_id, node_id, invocation_index)`, locates the owning graph through
//! a [`GraphProvider`], and drives [`GraphRunner::resume`]. Responses
//! addressed to subgraph children are routed to the root run so the whole
//! ancestor chain resumes.
//!
//! [`GraphRunner::resume`]: spice_core::GraphRunner

pub mod arbiter;
pub mod error;
pub mod provider;
pub mod queue;

pub use arbiter::{Arbiter, ArbiterConfig};
pub use error::{ArbiterError, Result};
pub use provider::{GraphProvider, GraphRegistry};
pub use queue::{InMemoryResponseQueue, QueuedResponse, ResponseQueue};
