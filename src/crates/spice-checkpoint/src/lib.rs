//! Checkpoint and idempotency persistence for the spice runtime
//!
//! This crate defines the storage abstractions the graph runner relies on to
//! survive process restarts and to keep side effects at-most-once:
//!
//! - [`CheckpointStore`] - persists run state at node boundaries so a paused
//!   or crashed run can resume from its last checkpoint
//! - [`IdempotencyStore`] - deduplicates in-flight operations by fingerprint
//!
//! Both traits are storage-agnostic; checkpoints carry the message snapshot
//! as plain JSON so backends never depend on runtime types. In-memory
//! reference implementations are provided for development and testing.

pub mod checkpoint;
pub mod error;
pub mod idempotency;
pub mod memory;
pub mod traits;

pub use checkpoint::Checkpoint;
pub use error::{CheckpointError, Result};
pub use idempotency::{
    fingerprint, BeginOutcome, IdempotencyEntry, IdempotencyStatus, IdempotencyStore,
    InMemoryIdempotencyStore,
};
pub use memory::InMemoryCheckpointStore;
pub use traits::CheckpointStore;
