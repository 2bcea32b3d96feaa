//! Durable approval routing: which agent owns a pending request.
//!
//! When an assistant turn renders buttons, the orchestrator records
//! `(conversationId, requestId) → agentId` here so the eventual button press
//! — possibly hours later, possibly after the agent lost focus — still lands
//! on the agent that asked.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use brewva_core::fsutil::write_json_atomic;
use brewva_core::now_ms;
use brewva_events::{ChannelEvent, EventBus};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

const SCHEMA: &str = "brewva.approval-routing.v1";
const INDEX_FILE: &str = "approval-routing.json";
const STORE_NAME: &str = "approval-routing";

/// One routing record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRoute {
    /// The agent that rendered the approval.
    pub agent_id: String,
    /// Millisecond epoch of the record.
    pub recorded_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RoutingIndex {
    schema: String,
    updated_at: String,
    conversations: BTreeMap<String, BTreeMap<String, ApprovalRoute>>,
}

impl Default for RoutingIndex {
    fn default() -> Self {
        Self {
            schema: SCHEMA.to_string(),
            updated_at: String::new(),
            conversations: BTreeMap::new(),
        }
    }
}

/// Durable map `(conversationId, requestId)` → owning agent.
pub struct ApprovalRoutingStore {
    index_path: PathBuf,
    max_entries: usize,
    events: EventBus,
    index: Mutex<RoutingIndex>,
}

impl ApprovalRoutingStore {
    /// Open (or create) the store under `channel_dir`.
    pub fn open(channel_dir: &Path, max_entries: usize, events: EventBus) -> Self {
        let index_path = channel_dir.join(INDEX_FILE);
        let index = match std::fs::read(&index_path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %index_path.display(), error = %e, "unreadable approval-routing index, starting empty");
                RoutingIndex::default()
            }),
            Err(_) => RoutingIndex::default(),
        };
        Self {
            index_path,
            max_entries,
            events,
            index: Mutex::new(index),
        }
    }

    /// Record the owning agent for a request at the current time.
    pub async fn record(&self, conversation_id: &str, request_id: &str, agent_id: &str) {
        self.record_at(conversation_id, request_id, agent_id, now_ms())
            .await;
    }

    /// Record with an explicit timestamp.
    pub async fn record_at(
        &self,
        conversation_id: &str,
        request_id: &str,
        agent_id: &str,
        recorded_at: i64,
    ) {
        if conversation_id.is_empty() || request_id.is_empty() || agent_id.is_empty() {
            return;
        }
        let mut index = self.index.lock().await;
        let conversation = index
            .conversations
            .entry(conversation_id.to_string())
            .or_default();
        conversation.insert(
            request_id.to_string(),
            ApprovalRoute {
                agent_id: agent_id.to_string(),
                recorded_at,
            },
        );
        while conversation.len() > self.max_entries {
            let Some(oldest) = conversation
                .iter()
                .min_by_key(|(_, r)| r.recorded_at)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            conversation.remove(&oldest);
        }
        self.persist(&index);
    }

    /// Pure lookup.
    pub async fn resolve(&self, conversation_id: &str, request_id: &str) -> Option<ApprovalRoute> {
        let index = self.index.lock().await;
        index
            .conversations
            .get(conversation_id)?
            .get(request_id)
            .cloned()
    }

    fn persist(&self, index: &RoutingIndex) {
        let on_disk = RoutingIndex {
            schema: SCHEMA.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            conversations: index.conversations.clone(),
        };
        if let Err(e) = write_json_atomic(&self.index_path, &on_disk) {
            warn!(error = %e, "failed to persist approval-routing index");
            self.events.publish(ChannelEvent::StorePersistFailed {
                store: STORE_NAME.to_string(),
                error: e.to_string(),
            });
        }
    }
}
