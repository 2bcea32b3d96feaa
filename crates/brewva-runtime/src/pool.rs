//! The bounded runtime pool.
//!
//! One live runtime per agent, at most `max_live` in total. Creation for the
//! same agent is serialized; concurrent callers wait on the first creation
//! instead of racing. When the pool is full, zero-ref least-recently-used
//! handles are reclaimed before giving up with `runtime_capacity_exhausted`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

use brewva_config::merge::{deep_merge, namespace_agent_config};
use brewva_core::now_ms;
use brewva_events::{ChannelEvent, EventBus};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info};

use crate::error::RuntimeError;
use crate::session::{AgentRuntime, RuntimeFactory};

/// A pooled runtime with refcount and recency tracking.
pub struct RuntimeHandle {
    /// The runtime itself.
    pub runtime: Arc<dyn AgentRuntime>,
    session_refs: AtomicUsize,
    last_used_at: AtomicI64,
}

impl std::fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("agent_id", &self.runtime.agent_id())
            .field("session_refs", &self.session_refs)
            .field("last_used_at", &self.last_used_at)
            .finish()
    }
}

impl RuntimeHandle {
    fn new(runtime: Arc<dyn AgentRuntime>) -> Self {
        Self {
            runtime,
            session_refs: AtomicUsize::new(0),
            last_used_at: AtomicI64::new(now_ms()),
        }
    }

    /// Increment the session refcount.
    pub fn retain(&self) {
        self.session_refs.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    /// Decrement the session refcount.
    pub fn release(&self) {
        let _ = self
            .session_refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Bump recency.
    pub fn touch(&self) {
        self.last_used_at.store(now_ms(), Ordering::SeqCst);
    }

    /// Current refcount.
    #[must_use]
    pub fn session_refs(&self) -> usize {
        self.session_refs.load(Ordering::SeqCst)
    }

    /// Last-used millisecond epoch.
    #[must_use]
    pub fn last_used_at(&self) -> i64 {
        self.last_used_at.load(Ordering::SeqCst)
    }
}

struct PoolInner {
    handles: HashMap<String, Arc<RuntimeHandle>>,
    creating: HashMap<String, watch::Receiver<bool>>,
}

/// Bounded pool of per-agent runtimes.
pub struct RuntimePool {
    factory: Arc<dyn RuntimeFactory>,
    base_config: Value,
    agents_root: String,
    max_live: usize,
    events: EventBus,
    inner: Mutex<PoolInner>,
}

impl RuntimePool {
    /// Build a pool.
    ///
    /// `base_config` is the controller runtime's config; every created
    /// runtime gets a deep clone with the agent overlay merged in and all
    /// state paths namespaced under `<agents_root>/<agentId>/state`.
    #[must_use]
    pub fn new(
        factory: Arc<dyn RuntimeFactory>,
        base_config: Value,
        agents_root: impl Into<String>,
        max_live: usize,
        events: EventBus,
    ) -> Self {
        Self {
            factory,
            base_config,
            agents_root: agents_root.into(),
            max_live: max_live.max(1),
            events,
            inner: Mutex::new(PoolInner {
                handles: HashMap::new(),
                creating: HashMap::new(),
            }),
        }
    }

    /// Current number of live runtimes.
    pub async fn size(&self) -> usize {
        self.inner.lock().await.handles.len()
    }

    /// Fetch the runtime handle for `agent_id`, creating it when missing.
    ///
    /// # Errors
    ///
    /// `runtime_capacity_exhausted` when the pool is full of in-use
    /// runtimes, or whatever the factory returns for a failed creation.
    pub async fn get_or_create(
        &self,
        agent_id: &str,
        overlay: &Value,
    ) -> Result<Arc<RuntimeHandle>, RuntimeError> {
        let (tx, victims) = loop {
            let mut inner = self.inner.lock().await;
            if let Some(handle) = inner.handles.get(agent_id) {
                handle.touch();
                return Ok(Arc::clone(handle));
            }
            if let Some(rx) = inner.creating.get(agent_id).cloned() {
                drop(inner);
                let mut rx = rx;
                // Either the value flips or the creator dropped the sender;
                // both mean "re-check the map".
                let _ = rx.changed().await;
                continue;
            }

            let victims = reclaim_for_capacity(&mut inner.handles, self.max_live)?;
            let (tx, rx) = watch::channel(false);
            inner.creating.insert(agent_id.to_string(), rx);
            break (tx, victims);
        };

        for (victim_id, victim) in victims {
            debug!(agent_id = %victim_id, "evicting zero-ref runtime for capacity");
            victim.runtime.dispose().await;
            self.events.publish(ChannelEvent::RuntimeEvicted {
                agent_id: victim_id,
                reason: "lru".to_string(),
            });
        }

        let config = self.agent_config(agent_id, overlay);
        let created = self.factory.create_runtime(agent_id, config).await;

        let mut inner = self.inner.lock().await;
        inner.creating.remove(agent_id);
        let result = match created {
            Ok(runtime) => {
                let handle = Arc::new(RuntimeHandle::new(runtime));
                inner
                    .handles
                    .insert(agent_id.to_string(), Arc::clone(&handle));
                info!(agent_id, "runtime created");
                Ok(handle)
            },
            Err(e) => Err(e),
        };
        drop(inner);
        let _ = tx.send(true);
        result
    }

    /// The merged, namespaced config for one agent.
    #[must_use]
    pub fn agent_config(&self, agent_id: &str, overlay: &Value) -> Value {
        let mut config = self.base_config.clone();
        deep_merge(&mut config, overlay);
        let state_root = format!("{}/{agent_id}/state", self.agents_root);
        namespace_agent_config(&mut config, &state_root);
        config
    }

    /// Evict zero-ref runtimes idle for at least `ttl_ms`. Returns the
    /// evicted agent ids.
    pub async fn evict_idle(&self, ttl_ms: u64) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(ttl_ms as i64);
        let victims: Vec<(String, Arc<RuntimeHandle>)> = {
            let mut inner = self.inner.lock().await;
            let ids: Vec<String> = inner
                .handles
                .iter()
                .filter(|(_, h)| h.session_refs() == 0 && h.last_used_at() <= cutoff)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| inner.handles.remove(&id).map(|h| (id, h)))
                .collect()
        };

        let mut evicted = Vec::with_capacity(victims.len());
        for (agent_id, handle) in victims {
            handle.runtime.dispose().await;
            self.events.publish(ChannelEvent::RuntimeEvicted {
                agent_id: agent_id.clone(),
                reason: "idle_ttl".to_string(),
            });
            evicted.push(agent_id);
        }
        evicted
    }

    /// Remove one agent's runtime from the pool without disposing it;
    /// the caller owns teardown ordering.
    pub async fn remove(&self, agent_id: &str) -> Option<Arc<RuntimeHandle>> {
        self.inner.lock().await.handles.remove(agent_id)
    }

    /// Dispose every runtime. Used at shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, Arc<RuntimeHandle>)> = {
            let mut inner = self.inner.lock().await;
            inner.creating.clear();
            inner.handles.drain().collect()
        };
        for (agent_id, handle) in handles {
            debug!(agent_id = %agent_id, "disposing runtime at shutdown");
            handle.runtime.dispose().await;
        }
    }
}

/// Select and remove zero-ref victims so one more runtime fits, oldest
/// `last_used_at` first.
fn reclaim_for_capacity(
    handles: &mut HashMap<String, Arc<RuntimeHandle>>,
    max_live: usize,
) -> Result<Vec<(String, Arc<RuntimeHandle>)>, RuntimeError> {
    if handles.len() < max_live {
        return Ok(Vec::new());
    }
    let needed = handles.len() + 1 - max_live;

    let mut candidates: Vec<(String, i64)> = handles
        .iter()
        .filter(|(_, h)| h.session_refs() == 0)
        .map(|(id, h)| (id.clone(), h.last_used_at()))
        .collect();
    if candidates.len() < needed {
        return Err(RuntimeError::CapacityExhausted);
    }
    candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    Ok(candidates
        .into_iter()
        .take(needed)
        .filter_map(|(id, _)| handles.remove(&id).map(|h| (id, h)))
        .collect())
}
