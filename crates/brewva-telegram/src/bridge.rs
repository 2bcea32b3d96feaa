//! The approval-state seam between projector and stores.

use async_trait::async_trait;
use brewva_approval::{ApprovalStateSnapshot, ApprovalStateStore};

/// Resolve and persist approval-state snapshots.
///
/// The projector takes this small interface instead of the full store so
/// tests (and future channels) can supply their own.
#[async_trait]
pub trait ApprovalBridge: Send + Sync {
    /// Look up the snapshot recorded for `(conversation_id, request_id)`.
    async fn resolve_state(
        &self,
        conversation_id: &str,
        request_id: &str,
    ) -> Option<ApprovalStateSnapshot>;

    /// Persist a snapshot extracted from rendered output.
    async fn persist_state(
        &self,
        conversation_id: &str,
        request_id: &str,
        snapshot: ApprovalStateSnapshot,
    );
}

#[async_trait]
impl ApprovalBridge for ApprovalStateStore {
    async fn resolve_state(
        &self,
        conversation_id: &str,
        request_id: &str,
    ) -> Option<ApprovalStateSnapshot> {
        self.resolve(conversation_id, request_id).await
    }

    async fn persist_state(
        &self,
        conversation_id: &str,
        request_id: &str,
        snapshot: ApprovalStateSnapshot,
    ) {
        let _ = self.record(conversation_id, request_id, snapshot).await;
    }
}
