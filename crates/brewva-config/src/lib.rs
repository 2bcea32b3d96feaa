//! Brewva Config - configuration loading for the channel orchestrator.
//!
//! Configuration comes from a workspace-rooted `.brewva/channel.toml`, with
//! environment variables overriding file values. Boot-time validation is
//! fatal; once loaded the controller config is read-only and per-agent
//! overlays are applied to deep clones.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod error;
mod loader;
pub mod merge;
mod types;

pub use error::ConfigError;
pub use loader::load;
pub use types::{
    AclMode, AuthMode, ChannelConfig, ChannelSection, IngressSection, RuntimeSection,
    TelegramSection,
};
