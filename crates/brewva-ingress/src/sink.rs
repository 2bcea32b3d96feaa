//! The seam between ingress transports and the orchestrator.

use async_trait::async_trait;
use serde_json::Value;

/// Consumer of authenticated provider updates.
///
/// Both the webhook and the long-poll loop drive this interface, so edge
/// dedupe and dispatch behave identically regardless of how an update
/// arrived.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// Derive the provider dedupe key; `None` means the update carries
    /// nothing we consume.
    fn dedupe_key(&self, update: &Value) -> Option<String>;

    /// Reserve a dedupe key. Returns false when the key is already held,
    /// in which case the caller reports a duplicate without dispatching.
    async fn reserve(&self, dedupe_key: &str) -> bool;

    /// Release a reservation after a failed dispatch so a redelivery can be
    /// accepted.
    async fn release(&self, dedupe_key: &str);

    /// Hand the update to the pipeline.
    async fn dispatch(&self, update: Value, dedupe_key: &str) -> anyhow::Result<()>;
}
