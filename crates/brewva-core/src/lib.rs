//! Brewva Core - Foundation types for the channel orchestration subsystem.
//!
//! This crate provides:
//! - The turn envelope, the canonical unit of flow between the provider and
//!   the agent runtime
//! - Approval payloads carried by buttoned turns
//! - Deterministic scope keys used for per-conversation serialization
//! - Agent id normalization and the reserved-name policy

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod agent_id;
pub mod envelope;
pub mod fsutil;
pub mod scope;
pub mod time;

pub use agent_id::{DEFAULT_AGENT_ID, is_reserved_agent_id, normalize_agent_id, normalize_slug};
pub use envelope::{
    ActionStyle, ApprovalAction, ApprovalPayload, META_CHANNEL_SESSION_ID, META_IN_REPLY_TO,
    TURN_SCHEMA, TurnEnvelope, TurnKind, TurnPart, approval_decision_line,
};
pub use scope::{
    RoutingStrategy, build_agent_scoped_conversation_key, build_routing_scope_key, wal_scope,
};
pub use time::now_ms;
