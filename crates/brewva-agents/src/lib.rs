//! Brewva Agents - the named-agent registry.
//!
//! Agents are named workers with their own scaffold directory and namespaced
//! runtime state. The registry is one JSON file holding the agent records,
//! the per-scope focus map, and the default agent id; deletes are soft so an
//! agent can be revived with its scaffold intact.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod registry;

pub use error::RegistryError;
pub use registry::{AgentRecord, AgentRegistry, AgentSnapshot, AgentStatus, RegistrySnapshot};
