//! Webhook authentication: bearer tokens, HMAC signatures, replay nonces.
//!
//! The canonical HMAC input is `"<timestamp>.<nonce>.<body>"` — decimal
//! seconds, raw UTF-8 body, lower-case hex output. Workers signing requests
//! must produce this string bit-for-bit; [`canonical_hmac_input`] is the
//! single definition both sides use.

use std::collections::HashMap;

use brewva_core::now_ms;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;

type HmacSha256 = Hmac<Sha256>;

/// Build the canonical string covered by the webhook signature.
#[must_use]
pub fn canonical_hmac_input(timestamp: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let mut input = Vec::with_capacity(timestamp.len() + nonce.len() + body.len() + 2);
    input.extend_from_slice(timestamp.as_bytes());
    input.push(b'.');
    input.extend_from_slice(nonce.as_bytes());
    input.push(b'.');
    input.extend_from_slice(body);
    input
}

/// Sign the canonical input, returning lower-case hex.
#[must_use]
pub fn sign_hmac(secret: &str, timestamp: &str, nonce: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(&canonical_hmac_input(timestamp, nonce, body));
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time bearer token comparison.
#[must_use]
pub fn verify_bearer(expected: &str, authorization_header: Option<&str>) -> bool {
    let Some(header) = authorization_header else {
        return false;
    };
    let Some(presented) = header.strip_prefix("Bearer ") else {
        return false;
    };
    presented.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1
}

/// Replay-nonce cache: `(timestamp, nonce)` pairs remembered for a TTL.
pub struct NonceCache {
    ttl_ms: u64,
    seen: Mutex<HashMap<(String, String), i64>>,
}

impl NonceCache {
    /// Cache remembering nonces for `ttl_ms`.
    #[must_use]
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record `(timestamp, nonce)`; false when it was already seen inside
    /// the TTL window. Expired entries are evicted opportunistically.
    pub async fn check_and_insert(&self, timestamp: &str, nonce: &str) -> bool {
        let now = now_ms();
        let mut seen = self.seen.lock().await;
        seen.retain(|_, expires_at| *expires_at > now);
        let key = (timestamp.to_string(), nonce.to_string());
        if seen.contains_key(&key) {
            return false;
        }
        seen.insert(key, now.saturating_add(self.ttl_ms as i64));
        true
    }
}

/// Verify an HMAC-signed request.
///
/// Check order: timestamp parse, skew window (skipped when `max_skew_ms` is
/// `None`), signature, then the replay nonce — only a valid signature may
/// consume a nonce slot.
///
/// # Errors
///
/// Returns the human-readable rejection reason used in the 401 body.
pub async fn verify_hmac(
    secret: &str,
    timestamp: &str,
    nonce: &str,
    signature: &str,
    body: &[u8],
    max_skew_ms: Option<u64>,
    nonces: &NonceCache,
) -> Result<(), &'static str> {
    if timestamp.is_empty() || nonce.is_empty() || signature.is_empty() {
        return Err("missing signature headers");
    }
    let Ok(timestamp_secs) = timestamp.parse::<i64>() else {
        return Err("invalid timestamp");
    };
    if let Some(max_skew) = max_skew_ms
        && max_skew > 0
    {
        let skew = now_ms().abs_diff(timestamp_secs.saturating_mul(1000));
        if skew > max_skew {
            return Err("timestamp skew too large");
        }
    }

    let expected = sign_hmac(secret, timestamp, nonce, body);
    if expected
        .as_bytes()
        .ct_eq(signature.to_ascii_lowercase().as_bytes())
        .unwrap_u8()
        != 1
    {
        return Err("invalid signature");
    }

    if !nonces.check_and_insert(timestamp, nonce).await {
        return Err("replayed nonce");
    }
    Ok(())
}
