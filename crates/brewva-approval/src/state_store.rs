//! Durable approval-state snapshots.
//!
//! The index file stays small: when a snapshot carries a `state` blob the
//! blob is spilled to `<stateDir>/<stateKey>.json` and only the key is kept
//! in the index. Resolution re-reads the blob. Persistence failures are
//! reported on the event bus and never propagate to callers — the in-memory
//! index stays authoritative for the life of the process.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use brewva_core::fsutil::write_json_atomic;
use brewva_core::now_ms;
use brewva_events::{ChannelEvent, EventBus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const SCHEMA: &str = "brewva.approval-state.v2";
const INDEX_FILE: &str = "approval-state.json";
const BLOB_DIR: &str = "approval-state";
const STORE_NAME: &str = "approval-state";

/// `{screenId?, stateKey?, state?}` attached to an approval.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApprovalStateSnapshot {
    /// Screen identifier from the UI payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screen_id: Option<String>,
    /// Key of the spilled state blob.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Opaque UI state. Spilled to a blob file on record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

impl ApprovalStateSnapshot {
    /// True when every field is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.screen_id.is_none() && self.state_key.is_none() && self.state.is_none()
    }
}

/// Result of a [`ApprovalStateStore::record`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    /// False only for unusable input (empty conversation or request id).
    pub ok: bool,
    /// The effective state key, when any state handling happened.
    pub state_key: Option<String>,
    /// Whether the key was computed rather than supplied or inherited.
    pub generated_state_key: bool,
    /// Whether a state blob was written to disk.
    pub stored_state: bool,
}

impl RecordOutcome {
    fn rejected() -> Self {
        Self {
            ok: false,
            state_key: None,
            generated_state_key: false,
            stored_state: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StateRecord {
    recorded_at: i64,
    snapshot: ApprovalStateSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StateIndex {
    schema: String,
    updated_at: String,
    conversations: BTreeMap<String, BTreeMap<String, StateRecord>>,
}

impl Default for StateIndex {
    fn default() -> Self {
        Self {
            schema: SCHEMA.to_string(),
            updated_at: String::new(),
            conversations: BTreeMap::new(),
        }
    }
}

/// Compute the deterministic state key `st_<12 hex>` for a record.
#[must_use]
pub fn compute_state_key(conversation_id: &str, request_id: &str) -> String {
    let digest = Sha256::digest(format!("{conversation_id}:{request_id}").as_bytes());
    format!("st_{}", &hex::encode(digest)[..12])
}

/// Keep a model-supplied state key filesystem-safe.
fn sanitize_state_key(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .take(64)
        .collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Durable map `(conversationId, requestId)` → approval-state snapshot.
pub struct ApprovalStateStore {
    index_path: PathBuf,
    blob_dir: PathBuf,
    max_entries: usize,
    events: EventBus,
    index: Mutex<StateIndex>,
}

impl ApprovalStateStore {
    /// Open (or create) the store under `channel_dir`.
    ///
    /// Older v1 indexes with embedded state are normalized on load: each
    /// embedded blob moves to its side file and the index is rewritten.
    pub fn open(channel_dir: &Path, max_entries: usize, events: EventBus) -> Self {
        let index_path = channel_dir.join(INDEX_FILE);
        let blob_dir = channel_dir.join(BLOB_DIR);
        let mut index = load_index(&index_path);

        let migrated = normalize_v1(&mut index, &blob_dir);
        if migrated {
            persist_index(&index_path, &events, &index);
        }
        Self {
            index_path,
            blob_dir,
            max_entries,
            events,
            index: Mutex::new(index),
        }
    }

    /// Record a snapshot for `(conversation_id, request_id)` at the current
    /// time.
    pub async fn record(
        &self,
        conversation_id: &str,
        request_id: &str,
        snapshot: ApprovalStateSnapshot,
    ) -> RecordOutcome {
        self.record_at(conversation_id, request_id, snapshot, now_ms())
            .await
    }

    /// Record a snapshot with an explicit timestamp.
    pub async fn record_at(
        &self,
        conversation_id: &str,
        request_id: &str,
        snapshot: ApprovalStateSnapshot,
        recorded_at: i64,
    ) -> RecordOutcome {
        if conversation_id.is_empty() || request_id.is_empty() {
            return RecordOutcome::rejected();
        }

        let mut index = self.index.lock().await;
        let conversation = index
            .conversations
            .entry(conversation_id.to_string())
            .or_default();

        // Key precedence: existing record, then a sanitized supplied key,
        // then the deterministic hash.
        let existing_key = conversation
            .get(request_id)
            .and_then(|r| r.snapshot.state_key.clone());
        let supplied_key = snapshot.state_key.as_deref().and_then(sanitize_state_key);
        let mut generated = false;
        let state_key = existing_key.or(supplied_key).unwrap_or_else(|| {
            generated = true;
            compute_state_key(conversation_id, request_id)
        });

        let mut stored = ApprovalStateSnapshot {
            screen_id: snapshot.screen_id,
            state_key: Some(state_key.clone()),
            state: None,
        };

        let mut stored_state = false;
        if let Some(state) = snapshot.state {
            let blob_path = self.blob_path(&state_key);
            match write_json_atomic(&blob_path, &state) {
                Ok(()) => {
                    debug!(state_key = %state_key, "approval state spilled to blob");
                    stored_state = true;
                },
                Err(e) => {
                    warn!(state_key = %state_key, error = %e, "failed to write state blob");
                    self.events.publish(ChannelEvent::StorePersistFailed {
                        store: STORE_NAME.to_string(),
                        error: e.to_string(),
                    });
                    // Keep the state embedded so resolve still works.
                    stored.state = Some(state);
                },
            }
        }

        conversation.insert(
            request_id.to_string(),
            StateRecord {
                recorded_at,
                snapshot: stored,
            },
        );
        prune_conversation(conversation, self.max_entries);

        self.persist(&index);
        RecordOutcome {
            ok: true,
            state_key: Some(state_key),
            generated_state_key: generated,
            stored_state,
        }
    }

    /// Resolve a snapshot, re-reading the state blob when one exists.
    pub async fn resolve(
        &self,
        conversation_id: &str,
        request_id: &str,
    ) -> Option<ApprovalStateSnapshot> {
        let index = self.index.lock().await;
        let record = index.conversations.get(conversation_id)?.get(request_id)?;
        let mut snapshot = record.snapshot.clone();
        if snapshot.state.is_none()
            && let Some(key) = snapshot.state_key.as_deref()
            && let Ok(bytes) = std::fs::read(self.blob_path(key))
            && let Ok(state) = serde_json::from_slice::<Value>(&bytes)
        {
            snapshot.state = Some(state);
        }
        Some(snapshot)
    }

    fn blob_path(&self, state_key: &str) -> PathBuf {
        self.blob_dir.join(format!("{state_key}.json"))
    }

    fn persist(&self, index: &StateIndex) {
        persist_index(&self.index_path, &self.events, index);
    }
}

fn persist_index(index_path: &Path, events: &EventBus, index: &StateIndex) {
    let mut on_disk = StateIndex {
        schema: SCHEMA.to_string(),
        updated_at: chrono::Utc::now().to_rfc3339(),
        conversations: index.conversations.clone(),
    };
    // Embedded state only survives in memory after a blob-write failure;
    // the index on disk never carries it.
    for conversation in on_disk.conversations.values_mut() {
        for record in conversation.values_mut() {
            record.snapshot.state = None;
        }
    }
    if let Err(e) = write_json_atomic(index_path, &on_disk) {
        warn!(error = %e, "failed to persist approval-state index");
        events.publish(ChannelEvent::StorePersistFailed {
            store: STORE_NAME.to_string(),
            error: e.to_string(),
        });
    }
}

fn load_index(path: &Path) -> StateIndex {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(index) => index,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable approval-state index, starting empty");
                StateIndex::default()
            },
        },
        Err(_) => StateIndex::default(),
    }
}

/// Move any embedded state blobs (v1 layout) to side files. Returns whether
/// anything changed.
fn normalize_v1(index: &mut StateIndex, blob_dir: &Path) -> bool {
    let mut changed = false;
    for (conversation_id, records) in &mut index.conversations {
        for (request_id, record) in records.iter_mut() {
            let Some(state) = record.snapshot.state.take() else {
                continue;
            };
            changed = true;
            let key = record
                .snapshot
                .state_key
                .clone()
                .unwrap_or_else(|| compute_state_key(conversation_id, request_id));
            let blob_path = blob_dir.join(format!("{key}.json"));
            if let Err(e) = write_json_atomic(&blob_path, &state) {
                warn!(state_key = %key, error = %e, "failed to migrate embedded state, keeping in memory");
                record.snapshot.state = Some(state);
            } else {
                record.snapshot.state_key = Some(key);
            }
        }
    }
    if changed {
        index.schema = SCHEMA.to_string();
    }
    changed
}

/// Evict the smallest `recorded_at` entries until the map fits `max_entries`.
fn prune_conversation(records: &mut BTreeMap<String, StateRecord>, max_entries: usize) {
    while records.len() > max_entries {
        let Some(oldest) = records
            .iter()
            .min_by_key(|(_, r)| r.recorded_at)
            .map(|(k, _)| k.clone())
        else {
            break;
        };
        records.remove(&oldest);
    }
}
