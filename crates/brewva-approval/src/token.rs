//! HMAC-signed callback tokens.
//!
//! A pressed inline button delivers only its `callback_data` string, so that
//! string must carry the `(requestId, actionId)` pair and prove it was minted
//! by this process. Format:
//!
//! ```text
//! v1.<requestId>.<actionId>.<mac>
//! ```
//!
//! where `mac` is the first 12 bytes of
//! `HMAC-SHA256(secret, "v1\n<requestId>\n<actionId>\n<context>")`,
//! base64url-encoded without padding. The ids use the `[a-z0-9_-]` alphabet,
//! so `.` is an unambiguous separator. Telegram caps `callback_data` at 64
//! bytes; oversized tokens are an encode error, which callers degrade to a
//! text fallback.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::TokenError;

type HmacSha256 = Hmac<Sha256>;

/// Provider limit on callback data.
pub const MAX_CALLBACK_BYTES: usize = 64;

const TOKEN_VERSION: &str = "v1";
const MAC_BYTES: usize = 12;
const ID_MAX: usize = 24;

/// The signed fields of a callback token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackPayload {
    /// Approval request id.
    pub request_id: String,
    /// Chosen action id.
    pub action_id: String,
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= ID_MAX
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn compute_mac(payload: &CallbackPayload, secret: &str, context: Option<&str>) -> Vec<u8> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(TOKEN_VERSION.as_bytes());
    mac.update(b"\n");
    mac.update(payload.request_id.as_bytes());
    mac.update(b"\n");
    mac.update(payload.action_id.as_bytes());
    mac.update(b"\n");
    mac.update(context.unwrap_or("").as_bytes());
    mac.finalize().into_bytes()[..MAC_BYTES].to_vec()
}

/// Encode a callback token.
///
/// `context` binds the token to a deployment or conversation: a token minted
/// with one context will not decode under another.
///
/// # Errors
///
/// Returns an error for out-of-alphabet ids or a token that would not fit
/// the provider's 64-byte budget.
pub fn encode(
    payload: &CallbackPayload,
    secret: &str,
    context: Option<&str>,
) -> Result<String, TokenError> {
    if !is_valid_id(&payload.request_id) {
        return Err(TokenError::InvalidRequestId(payload.request_id.clone()));
    }
    if !is_valid_id(&payload.action_id) {
        return Err(TokenError::InvalidActionId(payload.action_id.clone()));
    }

    let mac = URL_SAFE_NO_PAD.encode(compute_mac(payload, secret, context));
    let token = format!(
        "{TOKEN_VERSION}.{}.{}.{mac}",
        payload.request_id, payload.action_id
    );
    if token.len() > MAX_CALLBACK_BYTES {
        return Err(TokenError::TokenTooLong {
            len: token.len(),
            limit: MAX_CALLBACK_BYTES,
        });
    }
    Ok(token)
}

/// Decode and verify a callback token.
///
/// Returns `None` on version mismatch, malformed structure, out-of-alphabet
/// ids, a tampered MAC, or a context mismatch.
#[must_use]
pub fn decode(token: &str, secret: &str, context: Option<&str>) -> Option<CallbackPayload> {
    let mut parts = token.split('.');
    let version = parts.next()?;
    let request_id = parts.next()?;
    let action_id = parts.next()?;
    let mac_given = parts.next()?;
    if parts.next().is_some() || version != TOKEN_VERSION {
        return None;
    }
    if !is_valid_id(request_id) || !is_valid_id(action_id) {
        return None;
    }

    let payload = CallbackPayload {
        request_id: request_id.to_string(),
        action_id: action_id.to_string(),
    };
    let mac_given = URL_SAFE_NO_PAD.decode(mac_given).ok()?;
    let mac_expected = compute_mac(&payload, secret, context);
    if mac_given.ct_eq(&mac_expected).unwrap_u8() != 1 {
        return None;
    }
    Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(req: &str, act: &str) -> CallbackPayload {
        CallbackPayload {
            request_id: req.to_string(),
            action_id: act.to_string(),
        }
    }

    #[test]
    fn round_trip() {
        let p = payload("req-1", "approve");
        let token = encode(&p, "secret", None).unwrap();
        assert_eq!(decode(&token, "secret", None), Some(p));
    }

    #[test]
    fn round_trip_with_context() {
        let p = payload("req-1", "approve");
        let token = encode(&p, "secret", Some("telegram:123")).unwrap();
        assert_eq!(decode(&token, "secret", Some("telegram:123")), Some(p));
    }

    #[test]
    fn wrong_secret_rejected() {
        let token = encode(&payload("req-1", "approve"), "secret", None).unwrap();
        assert_eq!(decode(&token, "other", None), None);
    }

    #[test]
    fn context_mismatch_rejected() {
        let token = encode(&payload("req-1", "approve"), "secret", Some("ctx-a")).unwrap();
        assert_eq!(decode(&token, "secret", Some("ctx-b")), None);
        assert_eq!(decode(&token, "secret", None), None);
    }

    #[test]
    fn tampered_action_rejected() {
        let token = encode(&payload("req-1", "approve"), "secret", None).unwrap();
        let tampered = token.replace(".approve.", ".deny.");
        assert_eq!(decode(&tampered, "secret", None), None);
    }

    #[test]
    fn tampered_mac_rejected() {
        let token = encode(&payload("req-1", "approve"), "secret", None).unwrap();
        let mut tampered = token.clone();
        let last = tampered.pop().unwrap();
        tampered.push(if last == 'A' { 'B' } else { 'A' });
        assert_eq!(decode(&tampered, "secret", None), None);
    }

    #[test]
    fn malformed_tokens_rejected() {
        assert_eq!(decode("", "secret", None), None);
        assert_eq!(decode("v1.only-two", "secret", None), None);
        assert_eq!(decode("v2.req.act.mac", "secret", None), None);
        assert_eq!(decode("v1.req.act.not-base64!", "secret", None), None);
        assert_eq!(decode("v1.REQ.act.AAAA", "secret", None), None);
    }

    #[test]
    fn typical_ids_fit_the_budget() {
        let token = encode(&payload("req_approve-edit", "approve"), "secret", None).unwrap();
        assert!(token.len() <= MAX_CALLBACK_BYTES, "{}", token.len());
    }

    #[test]
    fn worst_case_ids_overflow_and_error() {
        let long = "a".repeat(24);
        let result = encode(&payload(&long, &long), "secret", None);
        assert!(matches!(result, Err(TokenError::TokenTooLong { .. })));
    }

    #[test]
    fn invalid_ids_are_encode_errors() {
        assert!(matches!(
            encode(&payload("Bad", "ok"), "s", None),
            Err(TokenError::InvalidRequestId(_))
        ));
        assert!(matches!(
            encode(&payload("ok", ""), "s", None),
            Err(TokenError::InvalidActionId(_))
        ));
    }
}
