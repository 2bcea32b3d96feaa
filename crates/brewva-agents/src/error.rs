//! Registry errors.
//!
//! Display strings double as the stable error codes surfaced in controller
//! replies, e.g. `agent_not_found:jack`.

use thiserror::Error;

/// Errors from registry operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// No active agent with this id.
    #[error("agent_not_found:{0}")]
    AgentNotFound(String),

    /// An active agent with this id already exists.
    #[error("agent_exists:{0}")]
    AgentExists(String),

    /// The id is reserved (`default`, `all`, `system`).
    #[error("reserved_agent_id:{0}")]
    ReservedAgentId(String),

    /// The default agent cannot be deleted.
    #[error("cannot_delete_default")]
    CannotDeleteDefault,

    /// Nothing usable survived agent-id normalization.
    #[error("invalid_agent_id:{0:?}")]
    InvalidAgentId(String),
}
