//! Brewva Approval - callback tokens and durable approval state.
//!
//! Approvals outlive the turn that rendered them: a button pressed hours
//! later must still resolve to the owning agent and to the UI state the
//! model attached. Two small stores make that durable, and an HMAC-signed
//! token keeps the provider's `callback_data` tamper-evident within its
//! 64-byte budget.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
pub mod routing_store;
pub mod state_store;
pub mod token;

pub use error::TokenError;
pub use routing_store::{ApprovalRoute, ApprovalRoutingStore};
pub use state_store::{ApprovalStateSnapshot, ApprovalStateStore, RecordOutcome};
pub use token::{CallbackPayload, MAX_CALLBACK_BYTES, decode, encode};
