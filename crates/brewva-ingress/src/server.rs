//! The webhook HTTP server.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use brewva_config::{AuthMode, IngressSection};
use brewva_events::{ChannelEvent, EventBus};
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::auth::{NonceCache, verify_bearer, verify_hmac};
use crate::sink::UpdateSink;

/// Ingress startup errors.
#[derive(Debug, Error)]
pub enum IngressError {
    /// Bind or accept failure.
    #[error("ingress io error: {0}")]
    Io(#[from] std::io::Error),

    /// The auth configuration cannot work, e.g. hmac mode without a secret.
    #[error("ingress misconfigured: {0}")]
    Config(String),
}

struct IngressState {
    config: IngressSection,
    nonces: NonceCache,
    sink: Arc<dyn UpdateSink>,
    events: EventBus,
}

/// The running webhook server.
pub struct IngressServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl IngressServer {
    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Fails on bind errors or a mode/secret mismatch (which should already
    /// have been caught at boot validation).
    pub async fn start(
        config: IngressSection,
        sink: Arc<dyn UpdateSink>,
        events: EventBus,
    ) -> Result<Self, IngressError> {
        match config.auth_mode {
            AuthMode::Bearer | AuthMode::Both
                if config.bearer_token.as_deref().unwrap_or("").is_empty() =>
            {
                return Err(IngressError::Config(
                    "bearer auth requires a bearer token".to_string(),
                ));
            },
            AuthMode::Hmac | AuthMode::Both
                if config.hmac_secret.as_deref().unwrap_or("").is_empty() =>
            {
                return Err(IngressError::Config(
                    "hmac auth requires a secret".to_string(),
                ));
            },
            _ => {},
        }

        let max_body_bytes = config.max_body_bytes;
        let path = config.path.clone();
        let bind_addr = format!("{}:{}", config.host, config.port);
        let state = Arc::new(IngressState {
            nonces: NonceCache::new(config.nonce_ttl_ms),
            config,
            sink,
            events,
        });

        let app = Router::new()
            .route(&path, post(handle_update))
            .layer(DefaultBodyLimit::max(max_body_bytes))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, path = %path, "webhook ingress listening");

        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                warn!(error = %e, "webhook ingress exited with error");
            }
        });

        Ok(Self {
            addr,
            shutdown,
            handle,
        })
    }

    /// The bound address (useful when the configured port was 0).
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting and wait for in-flight requests to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "webhook ingress task join failed");
        }
    }
}

fn reply(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}

fn unauthorized(state: &IngressState, message: &str) -> Response {
    state.events.publish(ChannelEvent::IngressRejected {
        reason: message.to_string(),
    });
    reply(
        StatusCode::UNAUTHORIZED,
        json!({"ok": false, "code": "unauthorized", "message": message}),
    )
}

async fn authenticate(state: &IngressState, headers: &HeaderMap, body: &[u8]) -> Result<(), Response> {
    let mode = state.config.auth_mode;

    if matches!(mode, AuthMode::Bearer | AuthMode::Both) {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        let expected = state.config.bearer_token.as_deref().unwrap_or("");
        if !verify_bearer(expected, authorization) {
            return Err(unauthorized(state, "invalid bearer token"));
        }
    }

    if matches!(mode, AuthMode::Hmac | AuthMode::Both) {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        let timestamp = get("x-brewva-timestamp");
        let nonce = get("x-brewva-nonce");
        let signature = get("x-brewva-signature");
        let secret = state.config.hmac_secret.as_deref().unwrap_or("");
        if let Err(reason) = verify_hmac(
            secret,
            &timestamp,
            &nonce,
            &signature,
            body,
            state.config.hmac_max_skew_ms,
            &state.nonces,
        )
        .await
        {
            return Err(unauthorized(state, reason));
        }
    }

    Ok(())
}

async fn handle_update(
    State(state): State<Arc<IngressState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(response) = authenticate(&state, &headers, &body).await {
        return response;
    }

    let update: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(update) => update,
        Err(_) => {
            return reply(
                StatusCode::BAD_REQUEST,
                json!({"ok": false, "code": "invalid_payload", "message": "body is not valid JSON"}),
            );
        },
    };

    let Some(dedupe_key) = state.sink.dedupe_key(&update) else {
        // Nothing we consume (e.g. an update kind we ignore).
        return reply(StatusCode::ACCEPTED, json!({"ok": true, "code": "ignored"}));
    };

    if !state.sink.reserve(&dedupe_key).await {
        return reply(
            StatusCode::OK,
            json!({"ok": true, "code": "duplicate", "dedupeKey": dedupe_key}),
        );
    }

    match state.sink.dispatch(update, &dedupe_key).await {
        Ok(()) => reply(
            StatusCode::ACCEPTED,
            json!({"ok": true, "code": "accepted", "dedupeKey": dedupe_key}),
        ),
        Err(e) => {
            warn!(dedupe_key = %dedupe_key, error = %e, "dispatch failed, releasing reservation");
            state.sink.release(&dedupe_key).await;
            reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({"ok": false, "code": "internal_error", "message": "failed to dispatch update"}),
            )
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::sign_hmac;
    use async_trait::async_trait;
    use brewva_core::now_ms;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct TestSink {
        reserved: Mutex<HashSet<String>>,
        dispatched: AtomicUsize,
        fail_dispatch: std::sync::atomic::AtomicBool,
    }

    impl TestSink {
        fn new() -> Self {
            Self {
                reserved: Mutex::new(HashSet::new()),
                dispatched: AtomicUsize::new(0),
                fail_dispatch: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl UpdateSink for TestSink {
        fn dedupe_key(&self, update: &serde_json::Value) -> Option<String> {
            update
                .get("update_id")
                .and_then(serde_json::Value::as_i64)
                .map(|id| format!("telegram:update:{id}"))
        }

        async fn reserve(&self, dedupe_key: &str) -> bool {
            self.reserved.lock().await.insert(dedupe_key.to_string())
        }

        async fn release(&self, dedupe_key: &str) {
            self.reserved.lock().await.remove(dedupe_key);
        }

        async fn dispatch(&self, _update: serde_json::Value, _key: &str) -> anyhow::Result<()> {
            if self.fail_dispatch.load(Ordering::SeqCst) {
                anyhow::bail!("simulated dispatch failure");
            }
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config(auth_mode: AuthMode) -> IngressSection {
        IngressSection {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 0,
            auth_mode,
            bearer_token: Some("test-token".to_string()),
            hmac_secret: Some("test-secret".to_string()),
            ..IngressSection::default()
        }
    }

    async fn start_server(
        auth_mode: AuthMode,
    ) -> (IngressServer, Arc<TestSink>, String, reqwest::Client) {
        let sink = Arc::new(TestSink::new());
        let server = IngressServer::start(test_config(auth_mode), sink.clone(), EventBus::new())
            .await
            .unwrap();
        let url = format!("http://{}/ingest/telegram", server.addr());
        (server, sink, url, reqwest::Client::new())
    }

    #[tokio::test]
    async fn accepted_then_duplicate() {
        let (server, sink, url, client) = start_server(AuthMode::Bearer).await;
        let body = r#"{"update_id":7003}"#;

        let first = client
            .post(&url)
            .bearer_auth("test-token")
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 202);
        let first_body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(first_body["code"], "accepted");
        assert_eq!(first_body["dedupeKey"], "telegram:update:7003");

        let second = client
            .post(&url)
            .bearer_auth("test-token")
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 200);
        let second_body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(second_body["code"], "duplicate");

        assert_eq!(sink.dispatched.load(Ordering::SeqCst), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn failed_dispatch_releases_reservation() {
        let (server, sink, url, client) = start_server(AuthMode::Bearer).await;
        let body = r#"{"update_id":7010}"#;

        sink.fail_dispatch.store(true, Ordering::SeqCst);
        let first = client
            .post(&url)
            .bearer_auth("test-token")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(first.status(), 500);
        let first_body: serde_json::Value = first.json().await.unwrap();
        assert_eq!(first_body["code"], "internal_error");

        sink.fail_dispatch.store(false, Ordering::SeqCst);
        let second = client
            .post(&url)
            .bearer_auth("test-token")
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(second.status(), 202);
        server.stop().await;
    }

    #[tokio::test]
    async fn bad_bearer_is_unauthorized() {
        let (server, sink, url, client) = start_server(AuthMode::Bearer).await;
        let response = client
            .post(&url)
            .bearer_auth("wrong")
            .body(r#"{"update_id":1}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "unauthorized");
        assert_eq!(sink.dispatched.load(Ordering::SeqCst), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn hmac_mode_accepts_signed_and_rejects_replay() {
        let (server, _sink, url, client) = start_server(AuthMode::Hmac).await;
        let body = r#"{"update_id":8001}"#;
        let timestamp = (now_ms() / 1000).to_string();
        let signature = sign_hmac("test-secret", &timestamp, "nonce-1", body.as_bytes());

        let send = |update_id_body: &'static str| {
            let client = client.clone();
            let url = url.clone();
            let timestamp = timestamp.clone();
            let signature = signature.clone();
            async move {
                client
                    .post(&url)
                    .header("x-brewva-timestamp", timestamp)
                    .header("x-brewva-nonce", "nonce-1")
                    .header("x-brewva-signature", signature)
                    .body(update_id_body)
                    .send()
                    .await
                    .unwrap()
            }
        };

        let first = send(body).await;
        assert_eq!(first.status(), 202);

        // Same nonce again: replay.
        let second = send(body).await;
        assert_eq!(second.status(), 401);
        let rejected: serde_json::Value = second.json().await.unwrap();
        assert_eq!(rejected["message"], "replayed nonce");
        server.stop().await;
    }

    #[tokio::test]
    async fn both_mode_requires_both() {
        let (server, _sink, url, client) = start_server(AuthMode::Both).await;
        let body = r#"{"update_id":9001}"#;
        let timestamp = (now_ms() / 1000).to_string();
        let signature = sign_hmac("test-secret", &timestamp, "nonce-b", body.as_bytes());

        // Signature only: bearer check fails first.
        let response = client
            .post(&url)
            .header("x-brewva-timestamp", &timestamp)
            .header("x-brewva-nonce", "nonce-b")
            .header("x-brewva-signature", &signature)
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 401);

        // Both: accepted.
        let response = client
            .post(&url)
            .bearer_auth("test-token")
            .header("x-brewva-timestamp", &timestamp)
            .header("x-brewva-nonce", "nonce-b2")
            .header("x-brewva-signature", sign_hmac("test-secret", &timestamp, "nonce-b2", body.as_bytes()))
            .body(body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        server.stop().await;
    }

    #[tokio::test]
    async fn non_post_is_method_not_allowed() {
        let (server, _sink, url, client) = start_server(AuthMode::Bearer).await;
        let response = client.get(&url).send().await.unwrap();
        assert_eq!(response.status(), 405);
        server.stop().await;
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let (server, _sink, url, client) = start_server(AuthMode::Bearer).await;
        let response = client
            .post(&url)
            .bearer_auth("test-token")
            .body("not json")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);
        server.stop().await;
    }

    #[tokio::test]
    async fn update_without_key_is_ignored() {
        let (server, sink, url, client) = start_server(AuthMode::Bearer).await;
        let response = client
            .post(&url)
            .bearer_auth("test-token")
            .body(r#"{"something_else":true}"#)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["code"], "ignored");
        assert_eq!(sink.dispatched.load(Ordering::SeqCst), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn misconfigured_auth_fails_to_start() {
        let mut config = test_config(AuthMode::Hmac);
        config.hmac_secret = None;
        let result =
            IngressServer::start(config, Arc::new(TestSink::new()), EventBus::new()).await;
        assert!(matches!(result, Err(IngressError::Config(_))));
    }
}
