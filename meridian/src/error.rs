//! Error types for graph registration, runtime mutation, and node hooks.
//!
//! Flow-control outcomes (blocked, dropped, replaced, coalesced) are *not*
//! errors; they are [`PutResult`](crate::policy::PutResult) values. The types
//! here cover programmer errors and structural problems only.

use thiserror::Error;

use crate::subgraph::Issue;

/// Errors surfaced by registration, mutators, and enqueue-time schema checks.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The graph failed structural validation; no node was started.
    ///
    /// The attached issues include every problem found, not only the first.
    #[error("graph validation failed with {} issue(s)", .0.len())]
    Validation(Vec<Issue>),

    /// A caller misused the runtime surface: unknown edge id, zero capacity,
    /// malformed headers, a second `run`, and similar.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A payload failed the destination port's schema at enqueue time.
    ///
    /// Raised into the emitting node's `emit` call; the scheduler treats it
    /// as a node error, never as a flow-control signal.
    #[error("type mismatch on edge {edge}: expected {expected}, found {found}")]
    TypeMismatch {
        /// Id of the edge that rejected the payload.
        edge: String,
        /// Schema label the destination port expects.
        expected: String,
        /// Concrete type of the rejected payload.
        found: String,
    },

    /// Draining exceeded the configured timeout; queued leftovers were
    /// discarded and counted. Reported through stats and events, never
    /// returned from `run`.
    #[error("shutdown timed out; discarded {discarded} queued message(s)")]
    ShutdownTimeout {
        /// Number of messages discarded at teardown.
        discarded: u64,
    },
}

impl RuntimeError {
    /// Shorthand for an [`RuntimeError::InvalidArgument`].
    pub fn invalid(message: impl Into<String>) -> Self {
        RuntimeError::InvalidArgument(message.into())
    }
}

/// An error escaping a node lifecycle hook.
///
/// Nodes report failures by value; the scheduler catches them, logs a
/// `node.error` event with the hook kind, counts them, and keeps running
/// under the default error policy.
pub type NodeError = Box<dyn std::error::Error + Send + Sync + 'static>;
