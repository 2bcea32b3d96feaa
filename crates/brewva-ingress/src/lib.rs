//! Brewva Ingress - the authenticated webhook endpoint.
//!
//! Provider updates enter here: bearer and/or HMAC authentication with
//! replay-nonce rejection, a body-size cap, and edge dedupe with rollback
//! when dispatch fails. The alternative long-polling transport lives with
//! the provider crate; both feed the same [`UpdateSink`].

#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod auth;
mod server;
mod sink;

pub use auth::{NonceCache, canonical_hmac_input, sign_hmac, verify_bearer, verify_hmac};
pub use server::{IngressError, IngressServer};
pub use sink::UpdateSink;
