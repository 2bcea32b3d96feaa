//! Runtime errors.

use thiserror::Error;

/// Errors from the runtime pool and sessions.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The pool is full and nothing is evictable.
    #[error("runtime_capacity_exhausted")]
    CapacityExhausted,

    /// The runtime for an agent could not be created or has gone away.
    #[error("runtime_unavailable: {0}")]
    Unavailable(String),

    /// A session operation failed inside the black-box runtime.
    #[error("session error: {0}")]
    Session(String),
}
