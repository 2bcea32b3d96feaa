//! Approval errors.

use thiserror::Error;

/// Errors from callback-token encoding.
///
/// Decoding never errors — a token that fails any check is simply not a
/// valid token, so [`crate::decode`] returns `None`.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    /// The request id is empty or outside `[a-z0-9_-]{1,24}`.
    #[error("invalid request id: {0:?}")]
    InvalidRequestId(String),

    /// The action id is empty or outside `[a-z0-9_-]{1,24}`.
    #[error("invalid action id: {0:?}")]
    InvalidActionId(String),

    /// The encoded token would exceed the provider's callback-data budget.
    #[error("callback token too long: {len} bytes (limit {limit})")]
    TokenTooLong {
        /// Encoded length.
        len: usize,
        /// The provider limit.
        limit: usize,
    },
}
