//! Per-(agent, scope) conversation sessions.
//!
//! One [`ConversationSession`] pairs an agent runtime session with the scope
//! it serves: a monotonic outbound sequence, an in-flight task counter, a
//! recency stamp, and a task lock that serializes prompt cycles the way a
//! queue tail would.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use brewva_core::now_ms;
use tokio::sync::{Mutex, MutexGuard, watch};
use tracing::debug;

use crate::error::RuntimeError;
use crate::pool::RuntimeHandle;
use crate::session::Session;

/// One agent session bound to one scope.
pub struct ConversationSession {
    /// `agent:<agentId>:<scopeKey>`.
    pub session_key: String,
    /// The scope this session serves.
    pub scope_key: String,
    /// Owning agent.
    pub agent_id: String,
    /// The black-box session.
    pub session: Arc<dyn Session>,
    handle: Arc<RuntimeHandle>,
    outbound_seq: AtomicU64,
    in_flight: AtomicUsize,
    last_used_at: AtomicI64,
    task_lock: Mutex<()>,
}

impl ConversationSession {
    /// Bind a session. Retains the runtime handle until [`Self::release`].
    #[must_use]
    pub fn new(
        session_key: impl Into<String>,
        scope_key: impl Into<String>,
        agent_id: impl Into<String>,
        session: Arc<dyn Session>,
        handle: Arc<RuntimeHandle>,
    ) -> Self {
        handle.retain();
        Self {
            session_key: session_key.into(),
            scope_key: scope_key.into(),
            agent_id: agent_id.into(),
            session,
            handle,
            outbound_seq: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            last_used_at: AtomicI64::new(now_ms()),
            task_lock: Mutex::new(()),
        }
    }

    /// Next value of the outbound sequence.
    pub fn next_outbound_seq(&self) -> u64 {
        self.outbound_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Acquire the task lock, serializing prompt cycles on this session.
    /// Marks the session in-flight for the guard's lifetime.
    pub async fn begin_task(&self) -> TaskGuard<'_> {
        let guard = self.task_lock.lock().await;
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
        TaskGuard {
            session: self,
            _guard: guard,
        }
    }

    /// Wait until any running task finishes, without starting one.
    pub async fn wait_for_tail(&self) {
        drop(self.task_lock.lock().await);
    }

    /// Number of tasks currently holding the session.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Last-used millisecond epoch.
    #[must_use]
    pub fn last_used_at(&self) -> i64 {
        self.last_used_at.load(Ordering::SeqCst)
    }

    /// Bump recency on both the session and its runtime handle.
    pub fn touch(&self) {
        self.last_used_at.store(now_ms(), Ordering::SeqCst);
        self.handle.touch();
    }

    /// Dispose the session and release the runtime handle.
    pub async fn dispose(&self) {
        self.session.dispose().await;
        self.handle.release();
    }
}

/// RAII guard for one serialized session task.
pub struct TaskGuard<'a> {
    session: &'a ConversationSession,
    _guard: MutexGuard<'a, ()>,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .session
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.session.touch();
    }
}

struct MapInner {
    sessions: HashMap<String, Arc<ConversationSession>>,
    creating: HashMap<String, watch::Receiver<bool>>,
}

/// All live conversation sessions, keyed by session key.
pub struct SessionMap {
    inner: Mutex<MapInner>,
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MapInner {
                sessions: HashMap::new(),
                creating: HashMap::new(),
            }),
        }
    }

    /// Fetch a session.
    pub async fn get(&self, session_key: &str) -> Option<Arc<ConversationSession>> {
        self.inner.lock().await.sessions.get(session_key).cloned()
    }

    /// Fetch or create the session for `session_key`, serializing concurrent
    /// creation for the same key.
    ///
    /// # Errors
    ///
    /// Propagates the creation error; waiters re-check and retry the
    /// creation themselves.
    pub async fn get_or_create<F, Fut>(
        &self,
        session_key: &str,
        create: F,
    ) -> Result<Arc<ConversationSession>, RuntimeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConversationSession, RuntimeError>>,
    {
        let tx = loop {
            let mut inner = self.inner.lock().await;
            if let Some(session) = inner.sessions.get(session_key) {
                return Ok(Arc::clone(session));
            }
            if let Some(rx) = inner.creating.get(session_key).cloned() {
                drop(inner);
                let mut rx = rx;
                let _ = rx.changed().await;
                continue;
            }
            let (tx, rx) = watch::channel(false);
            inner.creating.insert(session_key.to_string(), rx);
            break tx;
        };

        let created = create().await;

        let mut inner = self.inner.lock().await;
        inner.creating.remove(session_key);
        let result = match created {
            Ok(session) => {
                let session = Arc::new(session);
                inner
                    .sessions
                    .insert(session_key.to_string(), Arc::clone(&session));
                debug!(session_key, "conversation session created");
                Ok(session)
            },
            Err(e) => Err(e),
        };
        drop(inner);
        let _ = tx.send(true);
        result
    }

    /// Remove one session without disposing it.
    pub async fn remove(&self, session_key: &str) -> Option<Arc<ConversationSession>> {
        self.inner.lock().await.sessions.remove(session_key)
    }

    /// Remove every session belonging to `agent_id`.
    pub async fn remove_agent(&self, agent_id: &str) -> Vec<Arc<ConversationSession>> {
        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner
            .sessions
            .iter()
            .filter(|(_, s)| s.agent_id == agent_id)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| inner.sessions.remove(&k))
            .collect()
    }

    /// All sessions for one agent.
    pub async fn sessions_for_agent(&self, agent_id: &str) -> Vec<Arc<ConversationSession>> {
        self.inner
            .lock()
            .await
            .sessions
            .values()
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect()
    }

    /// Every live session.
    pub async fn all(&self) -> Vec<Arc<ConversationSession>> {
        self.inner.lock().await.sessions.values().cloned().collect()
    }

    /// Agents whose *every* session is idle for at least `ttl_ms` with zero
    /// in-flight tasks, sorted ascending by the agent's most recent use
    /// (ties broken lexicographically).
    pub async fn idle_agents(&self, ttl_ms: u64) -> Vec<String> {
        let cutoff = now_ms().saturating_sub(ttl_ms as i64);
        let stats = self.agent_stats().await;
        let mut idle: Vec<(String, i64)> = stats
            .into_iter()
            .filter(|(_, s)| s.in_flight == 0 && s.max_last_used <= cutoff)
            .map(|(id, s)| (id, s.max_last_used))
            .collect();
        idle.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        idle.into_iter().map(|(id, _)| id).collect()
    }

    /// The single agent with zero in-flight tasks and the smallest most
    /// recent use (tie: smaller agent id). LRU eviction victim.
    pub async fn lru_agent(&self) -> Option<String> {
        let stats = self.agent_stats().await;
        stats
            .into_iter()
            .filter(|(_, s)| s.in_flight == 0)
            .min_by(|a, b| a.1.max_last_used.cmp(&b.1.max_last_used).then_with(|| a.0.cmp(&b.0)))
            .map(|(id, _)| id)
    }

    async fn agent_stats(&self) -> HashMap<String, AgentStats> {
        let inner = self.inner.lock().await;
        let mut stats: HashMap<String, AgentStats> = HashMap::new();
        for session in inner.sessions.values() {
            let entry = stats.entry(session.agent_id.clone()).or_default();
            entry.in_flight += session.in_flight();
            entry.max_last_used = entry.max_last_used.max(session.last_used_at());
        }
        stats
    }
}

#[derive(Default)]
struct AgentStats {
    in_flight: usize,
    max_last_used: i64,
}
