//! Brewva Runtime - the per-agent runtime pool and conversation sessions.
//!
//! The LLM/tool runtime itself is a black box behind the [`Session`] and
//! [`AgentRuntime`] traits; this crate owns everything around it: bounded
//! runtime creation with LRU and idle-TTL eviction, per-(agent, scope)
//! conversation sessions with FIFO task serialization, and the collector
//! that turns a prompt cycle into tool and assistant outputs.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod collector;
mod error;
mod pool;
mod session;
mod sessions;

pub use collector::{ToolTurnEvent, TurnOutput, run_prompt};
pub use error::RuntimeError;
pub use pool::{RuntimeHandle, RuntimePool};
pub use session::{AgentRuntime, MessageRole, RuntimeFactory, Session, SessionEvent};
pub use sessions::{ConversationSession, SessionMap};
