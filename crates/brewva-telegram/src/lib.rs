//! Brewva Telegram - provider projection and transport.
//!
//! Bidirectional translation between Telegram updates and turn envelopes:
//! inbound messages, edited messages, and button callbacks become turns;
//! assistant turns render back into `sendMessage`/`sendPhoto`/`sendDocument`
//! requests with fence-safe chunking and HMAC-signed inline keyboards. The
//! transport speaks the Bot API JSON directly and provides the long-poll
//! fallback when the webhook ingress is disabled.

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

mod bridge;
mod error;
pub mod projector;
pub mod render;
pub mod split;
mod transport;
pub mod ui;
pub mod wire;

pub use bridge::ApprovalBridge;
pub use error::TelegramError;
pub use projector::{InboundOptions, dedupe_key, project_update};
pub use render::{RenderOptions, render_turn};
pub use split::split_text;
pub use transport::{TelegramTransport, run_polling_loop};
pub use wire::{
    InlineKeyboardButton, InlineKeyboardMarkup, OutboundRequest, SendDocument, SendMessage,
    SendPhoto, TgCallbackQuery, TgMessage, TgUpdate,
};
