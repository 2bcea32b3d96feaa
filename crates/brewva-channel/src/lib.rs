//! Brewva Channel - the multi-agent channel orchestrator.
//!
//! Ingests provider updates, routes each turn to a logically isolated agent
//! worker through a per-scope serial queue, drives the worker's prompt
//! cycle, and emits replies back to the provider — with at-least-once
//! delivery via the turn WAL, approval-callback routing, and bounded
//! runtime usage under bursty load.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod command;
pub mod coordinator;
mod orchestrator;
pub mod prompt;
mod service;

pub use command::{CommandMatch, route_command};
pub use coordinator::{
    A2aSend, AgentDispatchResult, AgentDispatcher, Coordinator, CoordinatorError,
    CoordinatorLimits, DiscussResult, DiscussRound, DispatchReason, FanOutResult,
};
pub use orchestrator::{ChannelOrchestrator, OutboundTransport};
pub use service::ChannelService;
