//! Telegram transport errors.

use thiserror::Error;

/// Errors from the Bot API transport.
#[derive(Debug, Error)]
pub enum TelegramError {
    /// No bot token configured.
    #[error("telegram bot token is not configured")]
    MissingToken,

    /// HTTP-level failure.
    #[error("telegram http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The Bot API returned `ok: false`.
    #[error("telegram api error: {0}")]
    Api(String),
}
