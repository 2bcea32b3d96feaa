//! The Bot API transport: outbound sends and the long-poll fallback.

use std::sync::Arc;
use std::time::Duration;

use brewva_config::TelegramSection;
use brewva_ingress::UpdateSink;
use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::TelegramError;
use crate::wire::OutboundRequest;

/// Envelope of every Bot API response.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// HTTP client for the Bot API.
pub struct TelegramTransport {
    http: reqwest::Client,
    api_base: String,
    token: String,
    poll_timeout_secs: u64,
    poll_limit: u32,
    retry_delay: Duration,
}

impl TelegramTransport {
    /// Build a transport from config.
    ///
    /// # Errors
    ///
    /// Fails when no bot token is configured or the HTTP client cannot be
    /// constructed.
    pub fn new(section: &TelegramSection) -> Result<Self, TelegramError> {
        let token = section
            .bot_token
            .clone()
            .filter(|t| !t.is_empty())
            .ok_or(TelegramError::MissingToken)?;
        // Long polls hold the request open for poll_timeout_secs; pad the
        // client timeout past it.
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(section.poll_timeout_secs.saturating_add(30)))
            .build()?;
        Ok(Self {
            http,
            api_base: section.api_base.trim_end_matches('/').to_string(),
            token,
            poll_timeout_secs: section.poll_timeout_secs,
            poll_limit: section.poll_limit,
            retry_delay: Duration::from_millis(section.retry_delay_ms),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token)
    }

    /// Execute one outbound request.
    ///
    /// # Errors
    ///
    /// HTTP failures and `ok: false` API responses.
    pub async fn send(&self, request: &OutboundRequest) -> Result<(), TelegramError> {
        let response = self
            .http
            .post(self.method_url(request.method()))
            .json(request)
            .send()
            .await?;
        let parsed: ApiResponse<Value> = response.json().await?;
        if !parsed.ok {
            return Err(TelegramError::Api(
                parsed
                    .description
                    .unwrap_or_else(|| "unknown api error".to_string()),
            ));
        }
        debug!(method = request.method(), "outbound request delivered");
        Ok(())
    }

    /// Fetch a batch of raw updates.
    ///
    /// # Errors
    ///
    /// HTTP failures and `ok: false` API responses.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Value>, TelegramError> {
        let response = self
            .http
            .post(self.method_url("getUpdates"))
            .json(&serde_json::json!({
                "offset": offset,
                "timeout": self.poll_timeout_secs,
                "limit": self.poll_limit,
            }))
            .send()
            .await?;
        let parsed: ApiResponse<Vec<Value>> = response.json().await?;
        if !parsed.ok {
            return Err(TelegramError::Api(
                parsed
                    .description
                    .unwrap_or_else(|| "unknown api error".to_string()),
            ));
        }
        Ok(parsed.result.unwrap_or_default())
    }
}

/// The long-poll ingestion loop, used when the webhook ingress is disabled.
///
/// Each batch is acknowledged by advancing `offset` past its high-water
/// mark; failed polls retry after the configured delay. Updates flow through
/// the same [`UpdateSink`] as the webhook, including edge dedupe and
/// reservation rollback.
pub async fn run_polling_loop(
    transport: Arc<TelegramTransport>,
    sink: Arc<dyn UpdateSink>,
    cancel: CancellationToken,
) {
    info!("telegram polling loop started");
    let mut offset: i64 = 0;

    loop {
        let batch = tokio::select! {
            () = cancel.cancelled() => break,
            result = transport.get_updates(offset) => result,
        };

        let updates = match batch {
            Ok(updates) => updates,
            Err(e) => {
                warn!(error = %e, "poll failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(transport.retry_delay) => continue,
                }
            },
        };

        for update in updates {
            if let Some(update_id) = update.get("update_id").and_then(Value::as_i64) {
                offset = offset.max(update_id.saturating_add(1));
            }
            let Some(key) = sink.dedupe_key(&update) else {
                continue;
            };
            if !sink.reserve(&key).await {
                debug!(dedupe_key = %key, "duplicate update skipped");
                continue;
            }
            if let Err(e) = sink.dispatch(update, &key).await {
                warn!(dedupe_key = %key, error = %e, "dispatch failed, releasing reservation");
                sink.release(&key).await;
            }
        }
    }
    info!("telegram polling loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(token: Option<&str>) -> TelegramSection {
        TelegramSection {
            bot_token: token.map(str::to_string),
            ..TelegramSection::default()
        }
    }

    #[test]
    fn missing_token_is_an_error() {
        assert!(matches!(
            TelegramTransport::new(&section(None)),
            Err(TelegramError::MissingToken)
        ));
        assert!(matches!(
            TelegramTransport::new(&section(Some(""))),
            Err(TelegramError::MissingToken)
        ));
    }

    #[test]
    fn method_url_embeds_token() {
        let transport = TelegramTransport::new(&section(Some("123:abc"))).unwrap();
        assert_eq!(
            transport.method_url("sendMessage"),
            "https://api.telegram.org/bot123:abc/sendMessage"
        );
    }

    #[test]
    fn api_base_trailing_slash_is_trimmed() {
        let mut s = section(Some("t"));
        s.api_base = "http://localhost:9000/".to_string();
        let transport = TelegramTransport::new(&s).unwrap();
        assert_eq!(transport.method_url("getUpdates"), "http://localhost:9000/bott/getUpdates");
    }
}
