//! The agent registry store.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use brewva_core::fsutil::write_json_atomic;
use brewva_core::{DEFAULT_AGENT_ID, is_reserved_agent_id, normalize_agent_id, now_ms};
use brewva_events::{ChannelEvent, EventBus};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::RegistryError;

const SCHEMA: &str = "brewva.agent-registry.v1";
const REGISTRY_FILE: &str = "agent-registry.json";
const STORE_NAME: &str = "agent-registry";

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Routable.
    Active,
    /// Soft-deleted; scaffold kept, can be revived by `create_agent`.
    Deleted,
}

/// One registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// Normalized id.
    pub agent_id: String,
    /// Lifecycle state.
    pub status: AgentStatus,
    /// Millisecond epoch of creation.
    pub created_at: i64,
    /// Millisecond epoch of the last record change.
    pub updated_at: i64,
    /// Set while soft-deleted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<i64>,
    /// Last time a turn was dispatched to this agent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
    /// Model override, `provider/id`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl AgentRecord {
    fn new(agent_id: String, model: Option<String>, now: i64) -> Self {
        Self {
            agent_id,
            status: AgentStatus::Active,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            last_active_at: None,
            model,
        }
    }

    /// Whether the agent is routable.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }
}

/// An agent in a [`RegistrySnapshot`], flagged with scope focus.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    /// The record.
    #[serde(flatten)]
    pub record: AgentRecord,
    /// Whether this agent is the focus of the snapshot's scope.
    pub is_focused: bool,
}

/// Point-in-time registry view for one scope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySnapshot {
    /// Focus resolution for the scope.
    pub focused_agent_id: String,
    /// The default agent.
    pub default_agent_id: String,
    /// All agents, sorted by id.
    pub agents: Vec<AgentSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RegistryFile {
    schema: String,
    updated_at: String,
    default_agent_id: String,
    focus_by_scope: BTreeMap<String, String>,
    agents: BTreeMap<String, AgentRecord>,
}

impl Default for RegistryFile {
    fn default() -> Self {
        Self {
            schema: SCHEMA.to_string(),
            updated_at: String::new(),
            default_agent_id: DEFAULT_AGENT_ID.to_string(),
            focus_by_scope: BTreeMap::new(),
            agents: BTreeMap::new(),
        }
    }
}

/// The registry: one JSON file plus per-agent scaffold directories.
pub struct AgentRegistry {
    path: PathBuf,
    agents_root: PathBuf,
    events: EventBus,
    inner: RwLock<RegistryFile>,
}

impl AgentRegistry {
    /// Open (or create) the registry.
    ///
    /// The default agent always exists after this returns: it is created on
    /// first boot and re-activated if a previous process soft-deleted it.
    pub fn open(channel_dir: &Path, agents_root: &Path, events: EventBus) -> Self {
        let path = channel_dir.join(REGISTRY_FILE);
        let mut file = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable agent registry, starting empty");
                RegistryFile::default()
            }),
            Err(_) => RegistryFile::default(),
        };

        if file.default_agent_id.is_empty() {
            file.default_agent_id = DEFAULT_AGENT_ID.to_string();
        }
        let now = now_ms();
        let default_id = file.default_agent_id.clone();
        match file.agents.get_mut(&default_id) {
            Some(record) if !record.is_active() => {
                info!(agent_id = %default_id, "re-activating deleted default agent");
                record.status = AgentStatus::Active;
                record.deleted_at = None;
                record.updated_at = now;
            },
            Some(_) => {},
            None => {
                file.agents
                    .insert(default_id.clone(), AgentRecord::new(default_id.clone(), None, now));
            },
        }

        let registry = Self {
            path,
            agents_root: agents_root.to_path_buf(),
            events,
            inner: RwLock::new(file),
        };
        registry.ensure_scaffold(&default_id);
        registry.persist_blocking();
        registry
    }

    /// Create a new agent, or revive a soft-deleted one.
    ///
    /// # Errors
    ///
    /// `invalid_agent_id`, `reserved_agent_id`, or `agent_exists`.
    pub async fn create_agent(
        &self,
        requested_agent_id: &str,
        model: Option<String>,
    ) -> Result<AgentRecord, RegistryError> {
        let agent_id = normalize_agent_id(requested_agent_id)
            .ok_or_else(|| RegistryError::InvalidAgentId(requested_agent_id.to_string()))?;
        if is_reserved_agent_id(&agent_id) {
            return Err(RegistryError::ReservedAgentId(agent_id));
        }

        let record = {
            let mut inner = self.inner.write().await;
            let now = now_ms();
            match inner.agents.get_mut(&agent_id) {
                Some(existing) if existing.is_active() => {
                    return Err(RegistryError::AgentExists(agent_id));
                },
                Some(existing) => {
                    // Revive with the new model overlay.
                    existing.status = AgentStatus::Active;
                    existing.deleted_at = None;
                    existing.updated_at = now;
                    if model.is_some() {
                        existing.model = model;
                    }
                    existing.clone()
                },
                None => {
                    let record = AgentRecord::new(agent_id.clone(), model, now);
                    inner.agents.insert(agent_id.clone(), record.clone());
                    record
                },
            }
        };

        self.ensure_scaffold(&agent_id);
        self.persist().await;
        self.events.publish(ChannelEvent::AgentCreated {
            agent_id: agent_id.clone(),
        });
        info!(agent_id = %agent_id, "agent created");
        Ok(record)
    }

    /// Soft-delete an agent and clear any focus entries pointing at it.
    ///
    /// # Errors
    ///
    /// `cannot_delete_default` or `agent_not_found`.
    pub async fn soft_delete(&self, agent_id: &str) -> Result<(), RegistryError> {
        let agent_id = normalize_agent_id(agent_id)
            .ok_or_else(|| RegistryError::InvalidAgentId(agent_id.to_string()))?;
        {
            let mut inner = self.inner.write().await;
            if agent_id == inner.default_agent_id {
                return Err(RegistryError::CannotDeleteDefault);
            }
            let now = now_ms();
            match inner.agents.get_mut(&agent_id) {
                Some(record) if record.is_active() => {
                    record.status = AgentStatus::Deleted;
                    record.deleted_at = Some(now);
                    record.updated_at = now;
                },
                _ => return Err(RegistryError::AgentNotFound(agent_id)),
            }
            inner.focus_by_scope.retain(|_, focused| *focused != agent_id);
        }
        self.persist().await;
        self.events.publish(ChannelEvent::AgentDeleted {
            agent_id: agent_id.clone(),
        });
        info!(agent_id = %agent_id, "agent soft-deleted");
        Ok(())
    }

    /// Focus `agent_id` for `scope_key`.
    ///
    /// # Errors
    ///
    /// `agent_not_found` when the agent is missing or deleted.
    pub async fn set_focus(&self, scope_key: &str, agent_id: &str) -> Result<(), RegistryError> {
        let agent_id = normalize_agent_id(agent_id)
            .ok_or_else(|| RegistryError::InvalidAgentId(agent_id.to_string()))?;
        {
            let mut inner = self.inner.write().await;
            let active = inner.agents.get(&agent_id).is_some_and(AgentRecord::is_active);
            if !active {
                return Err(RegistryError::AgentNotFound(agent_id));
            }
            inner
                .focus_by_scope
                .insert(scope_key.to_string(), agent_id.clone());
        }
        self.persist().await;
        Ok(())
    }

    /// Resolve the focused agent for a scope.
    ///
    /// A focus entry pointing at a deleted agent is cleared and the default
    /// agent is returned.
    pub async fn resolve_focus(&self, scope_key: &str) -> String {
        let stale = {
            let inner = self.inner.read().await;
            match inner.focus_by_scope.get(scope_key) {
                Some(focused)
                    if inner.agents.get(focused).is_some_and(AgentRecord::is_active) =>
                {
                    return focused.clone();
                },
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            let mut inner = self.inner.write().await;
            inner.focus_by_scope.remove(scope_key);
            drop(inner);
            self.persist().await;
        }
        self.inner.read().await.default_agent_id.clone()
    }

    /// Point-in-time view for one scope: focus, default, sorted agents.
    pub async fn snapshot(&self, scope_key: &str) -> RegistrySnapshot {
        let focused_agent_id = self.resolve_focus(scope_key).await;
        let inner = self.inner.read().await;
        let agents = inner
            .agents
            .values()
            .map(|record| AgentSnapshot {
                is_focused: record.agent_id == focused_agent_id,
                record: record.clone(),
            })
            .collect();
        RegistrySnapshot {
            focused_agent_id,
            default_agent_id: inner.default_agent_id.clone(),
            agents,
        }
    }

    /// Fetch one record.
    pub async fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.inner.read().await.agents.get(agent_id).cloned()
    }

    /// Whether an agent exists and is active.
    pub async fn is_active(&self, agent_id: &str) -> bool {
        self.inner
            .read()
            .await
            .agents
            .get(agent_id)
            .is_some_and(AgentRecord::is_active)
    }

    /// The default agent id.
    pub async fn default_agent_id(&self) -> String {
        self.inner.read().await.default_agent_id.clone()
    }

    /// Update `last_active_at` in memory. Call [`persist_now`](Self::persist_now)
    /// to flush.
    pub async fn touch_agent(&self, agent_id: &str, at: i64) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.agents.get_mut(agent_id) {
            record.last_active_at = Some(at);
        }
    }

    /// Flush the in-memory registry to disk.
    pub async fn persist_now(&self) {
        self.persist().await;
    }

    /// Path of an agent's scaffold directory.
    #[must_use]
    pub fn agent_dir(&self, agent_id: &str) -> PathBuf {
        self.agents_root.join(agent_id)
    }

    /// The agent's `config.json` overlay, `{}` when missing or unreadable.
    pub fn agent_config_overlay(&self, agent_id: &str) -> serde_json::Value {
        let path = self.agent_dir(agent_id).join("config.json");
        std::fs::read(&path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_else(|| serde_json::json!({}))
    }

    /// Create `identity.md` and `config.json` when missing.
    fn ensure_scaffold(&self, agent_id: &str) {
        let dir = self.agent_dir(agent_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(agent_id, error = %e, "failed to create agent scaffold dir");
            return;
        }
        let identity = dir.join("identity.md");
        if !identity.exists() {
            let body = format!(
                "# Agent: {agent_id}\n\nCreated {}.\n\nDescribe this agent's charter, tone, and standing instructions here.\n",
                chrono::Utc::now().to_rfc3339()
            );
            if let Err(e) = std::fs::write(&identity, body) {
                warn!(agent_id, error = %e, "failed to write identity.md");
            }
        }
        let config = dir.join("config.json");
        if !config.exists()
            && let Err(e) = std::fs::write(&config, "{}\n")
        {
            warn!(agent_id, error = %e, "failed to write config.json");
        }
    }

    async fn persist(&self) {
        let inner = self.inner.read().await;
        self.persist_file(&inner);
    }

    fn persist_blocking(&self) {
        if let Ok(inner) = self.inner.try_read() {
            self.persist_file(&inner);
        }
    }

    fn persist_file(&self, inner: &RegistryFile) {
        let on_disk = RegistryFile {
            schema: SCHEMA.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            default_agent_id: inner.default_agent_id.clone(),
            focus_by_scope: inner.focus_by_scope.clone(),
            agents: inner.agents.clone(),
        };
        if let Err(e) = write_json_atomic(&self.path, &on_disk) {
            warn!(error = %e, "failed to persist agent registry");
            self.events.publish(ChannelEvent::StorePersistFailed {
                store: STORE_NAME.to_string(),
                error: e.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        registry: AgentRegistry,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = AgentRegistry::open(
            &dir.path().join("channel"),
            &dir.path().join("agents"),
            EventBus::new(),
        );
        Fixture {
            _dir: dir,
            registry,
        }
    }

    #[tokio::test]
    async fn default_agent_exists_after_open() {
        let f = fixture();
        assert!(f.registry.is_active(DEFAULT_AGENT_ID).await);
        assert!(f.registry.agent_dir(DEFAULT_AGENT_ID).join("identity.md").exists());
        assert!(f.registry.agent_dir(DEFAULT_AGENT_ID).join("config.json").exists());
    }

    #[tokio::test]
    async fn create_normalizes_and_scaffolds() {
        let f = fixture();
        let record = f.registry.create_agent("Jack", None).await.unwrap();
        assert_eq!(record.agent_id, "jack");
        assert!(f.registry.agent_dir("jack").join("identity.md").exists());
    }

    #[tokio::test]
    async fn create_rejects_reserved_and_duplicate() {
        let f = fixture();
        assert_eq!(
            f.registry.create_agent("all", None).await.unwrap_err(),
            RegistryError::ReservedAgentId("all".to_string())
        );
        f.registry.create_agent("jack", None).await.unwrap();
        assert_eq!(
            f.registry.create_agent("jack", None).await.unwrap_err(),
            RegistryError::AgentExists("jack".to_string())
        );
    }

    #[tokio::test]
    async fn create_rejects_unusable_names() {
        let f = fixture();
        assert!(matches!(
            f.registry.create_agent("!!!", None).await,
            Err(RegistryError::InvalidAgentId(_))
        ));
    }

    #[tokio::test]
    async fn soft_delete_then_focus_fails_then_revive() {
        let f = fixture();
        f.registry.create_agent("jack", None).await.unwrap();
        f.registry.soft_delete("jack").await.unwrap();

        let err = f.registry.set_focus("telegram:123", "jack").await.unwrap_err();
        assert_eq!(err.to_string(), "agent_not_found:jack");

        f.registry.create_agent("jack", None).await.unwrap();
        f.registry.set_focus("telegram:123", "jack").await.unwrap();
        assert_eq!(f.registry.resolve_focus("telegram:123").await, "jack");
    }

    #[tokio::test]
    async fn cannot_delete_default() {
        let f = fixture();
        assert_eq!(
            f.registry.soft_delete(DEFAULT_AGENT_ID).await.unwrap_err(),
            RegistryError::CannotDeleteDefault
        );
    }

    #[tokio::test]
    async fn delete_clears_focus_entries() {
        let f = fixture();
        f.registry.create_agent("jack", None).await.unwrap();
        f.registry.set_focus("telegram:1", "jack").await.unwrap();
        f.registry.set_focus("telegram:2", "jack").await.unwrap();

        f.registry.soft_delete("jack").await.unwrap();

        assert_eq!(f.registry.resolve_focus("telegram:1").await, DEFAULT_AGENT_ID);
        assert_eq!(f.registry.resolve_focus("telegram:2").await, DEFAULT_AGENT_ID);
    }

    #[tokio::test]
    async fn stale_focus_falls_back_to_default() {
        let f = fixture();
        f.registry.create_agent("jack", None).await.unwrap();
        f.registry.set_focus("telegram:1", "jack").await.unwrap();

        // Delete under the registry's feet, then resolve.
        f.registry.soft_delete("jack").await.unwrap();
        assert_eq!(f.registry.resolve_focus("telegram:1").await, DEFAULT_AGENT_ID);
    }

    #[tokio::test]
    async fn revive_applies_new_model() {
        let f = fixture();
        f.registry
            .create_agent("jack", Some("anthropic/claude-a".to_string()))
            .await
            .unwrap();
        f.registry.soft_delete("jack").await.unwrap();
        let revived = f
            .registry
            .create_agent("jack", Some("anthropic/claude-b".to_string()))
            .await
            .unwrap();
        assert_eq!(revived.model.as_deref(), Some("anthropic/claude-b"));
        assert!(revived.is_active());
    }

    #[tokio::test]
    async fn snapshot_sorts_and_flags_focus() {
        let f = fixture();
        f.registry.create_agent("zoe", None).await.unwrap();
        f.registry.create_agent("abe", None).await.unwrap();
        f.registry.set_focus("telegram:1", "zoe").await.unwrap();

        let snapshot = f.registry.snapshot("telegram:1").await;
        assert_eq!(snapshot.focused_agent_id, "zoe");
        let ids: Vec<&str> = snapshot.agents.iter().map(|a| a.record.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["abe", "default", "zoe"]);
        assert!(snapshot.agents.iter().any(|a| a.record.agent_id == "zoe" && a.is_focused));
        assert!(snapshot.agents.iter().all(|a| a.record.agent_id == "zoe" || !a.is_focused));
    }

    #[tokio::test]
    async fn registry_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = AgentRegistry::open(
                &dir.path().join("channel"),
                &dir.path().join("agents"),
                EventBus::new(),
            );
            registry.create_agent("jack", None).await.unwrap();
            registry.set_focus("telegram:1", "jack").await.unwrap();
        }
        let registry = AgentRegistry::open(
            &dir.path().join("channel"),
            &dir.path().join("agents"),
            EventBus::new(),
        );
        assert!(registry.is_active("jack").await);
        assert_eq!(registry.resolve_focus("telegram:1").await, "jack");
    }

    #[tokio::test]
    async fn deleted_default_is_revived_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let channel_dir = dir.path().join("channel");
        {
            let registry =
                AgentRegistry::open(&channel_dir, &dir.path().join("agents"), EventBus::new());
            // Forcibly corrupt: mark default deleted on disk.
            drop(registry);
            let path = channel_dir.join(REGISTRY_FILE);
            let mut file: serde_json::Value =
                serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
            file["agents"][DEFAULT_AGENT_ID]["status"] = serde_json::json!("deleted");
            std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();
        }
        let registry =
            AgentRegistry::open(&channel_dir, &dir.path().join("agents"), EventBus::new());
        assert!(registry.is_active(DEFAULT_AGENT_ID).await);
    }

    #[tokio::test]
    async fn touch_updates_last_active() {
        let f = fixture();
        f.registry.create_agent("jack", None).await.unwrap();
        f.registry.touch_agent("jack", 42).await;
        assert_eq!(f.registry.get("jack").await.unwrap().last_active_at, Some(42));
    }

    #[tokio::test]
    async fn config_overlay_defaults_to_empty_object() {
        let f = fixture();
        f.registry.create_agent("jack", None).await.unwrap();
        assert_eq!(f.registry.agent_config_overlay("jack"), serde_json::json!({}));

        std::fs::write(
            f.registry.agent_dir("jack").join("config.json"),
            r#"{"model":{"id":"x"}}"#,
        )
        .unwrap();
        assert_eq!(
            f.registry.agent_config_overlay("jack")["model"]["id"],
            "x"
        );
    }
}
