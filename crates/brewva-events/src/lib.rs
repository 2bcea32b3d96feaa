//! Brewva Events - event types and broadcast bus.
//!
//! Subsystems never fail a caller because of an observability problem:
//! persistence hiccups, outbound send errors, and eviction decisions are
//! published here and logged, while the turn pipeline keeps moving.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod bus;
pub mod event;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventReceiver};
pub use event::ChannelEvent;
