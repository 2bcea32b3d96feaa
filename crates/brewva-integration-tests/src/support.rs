//! Shared fakes: a scripted runtime factory, a capturing transport, and a
//! fully wired orchestrator harness over a temp workspace.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use brewva_agents::AgentRegistry;
use brewva_approval::{ApprovalRoutingStore, ApprovalStateStore};
use brewva_channel::{ChannelOrchestrator, OutboundTransport};
use brewva_config::ChannelConfig;
use brewva_core::wal_scope;
use brewva_events::EventBus;
use brewva_runtime::{
    AgentRuntime, MessageRole, RuntimeError, RuntimeFactory, RuntimePool, Session, SessionEvent,
    SessionMap,
};
use brewva_telegram::OutboundRequest;
use brewva_wal::TurnWal;
use tokio::sync::{Mutex, broadcast};

/// Shared secret used across harness tests for callback signing.
pub const CALLBACK_SECRET: &str = "it-callback-secret";

/// Computes the scripted events for one prompt.
pub type Responder = Arc<dyn Fn(&str, &str) -> Vec<SessionEvent> + Send + Sync>;

/// A responder that answers every prompt with one assistant message.
#[must_use]
pub fn echo_responder() -> Responder {
    Arc::new(|agent_id, prompt| {
        let first_line = prompt.lines().last().unwrap_or("").to_string();
        vec![SessionEvent::MessageEnd {
            role: MessageRole::Assistant,
            text: format!("{agent_id} answered: {first_line}"),
        }]
    })
}

struct ScriptedSession {
    id: String,
    agent_id: String,
    responder: Responder,
    prompts: Arc<Mutex<Vec<(String, String)>>>,
    events: broadcast::Sender<SessionEvent>,
}

#[async_trait]
impl Session for ScriptedSession {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn send_user_message(&self, text: &str) -> Result<(), RuntimeError> {
        self.prompts
            .lock()
            .await
            .push((self.agent_id.clone(), text.to_string()));
        // A slow "first" prompt makes FIFO violations observable.
        if text.contains("[slow]") {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        for event in (self.responder)(&self.agent_id, text) {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    async fn wait_for_idle(&self) {}

    fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn dispose(&self) {}
}

struct ScriptedRuntime {
    agent_id: String,
    responder: Responder,
    prompts: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl AgentRuntime for ScriptedRuntime {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    async fn open_session(&self, session_key: &str) -> Result<Arc<dyn Session>, RuntimeError> {
        let (events, _) = broadcast::channel(64);
        Ok(Arc::new(ScriptedSession {
            id: session_key.to_string(),
            agent_id: self.agent_id.clone(),
            responder: Arc::clone(&self.responder),
            prompts: Arc::clone(&self.prompts),
            events,
        }))
    }

    async fn dispose(&self) {}
}

/// Factory producing scripted runtimes and recording every prompt.
pub struct ScriptedFactory {
    responder: Responder,
    /// `(agent_id, prompt)` pairs in dispatch order.
    pub prompts: Arc<Mutex<Vec<(String, String)>>>,
}

impl ScriptedFactory {
    /// Factory whose sessions answer via `responder`.
    #[must_use]
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[async_trait]
impl RuntimeFactory for ScriptedFactory {
    async fn create_runtime(
        &self,
        agent_id: &str,
        _config: serde_json::Value,
    ) -> Result<Arc<dyn AgentRuntime>, RuntimeError> {
        Ok(Arc::new(ScriptedRuntime {
            agent_id: agent_id.to_string(),
            responder: Arc::clone(&self.responder),
            prompts: Arc::clone(&self.prompts),
        }))
    }
}

/// Captures outbound requests instead of calling the Bot API.
#[derive(Default)]
pub struct CapturingTransport {
    /// Requests in send order.
    pub requests: Mutex<Vec<OutboundRequest>>,
}

#[async_trait]
impl OutboundTransport for CapturingTransport {
    async fn send(&self, request: &OutboundRequest) -> anyhow::Result<()> {
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}

/// A wired orchestrator over a temp workspace.
pub struct Harness {
    _dir: Option<tempfile::TempDir>,
    /// The orchestrator under test.
    pub orchestrator: ChannelOrchestrator,
    /// Captured outbound traffic.
    pub transport: Arc<CapturingTransport>,
    /// Recorded `(agent_id, prompt)` dispatches.
    pub prompts: Arc<Mutex<Vec<(String, String)>>>,
    /// The registry, for direct assertions.
    pub registry: Arc<AgentRegistry>,
    /// The routing store, for direct assertions.
    pub routing: Arc<ApprovalRoutingStore>,
    /// The event bus.
    pub events: EventBus,
}

impl Harness {
    /// Wait until at least `count` outbound requests were captured.
    ///
    /// # Panics
    ///
    /// Panics after ~2 seconds without reaching the count.
    pub async fn wait_for_requests(&self, count: usize) -> Vec<OutboundRequest> {
        for _ in 0..200 {
            {
                let requests = self.transport.requests.lock().await;
                if requests.len() >= count {
                    return requests.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let requests = self.transport.requests.lock().await;
        panic!(
            "expected {count} outbound requests, saw {}: {requests:?}",
            requests.len()
        );
    }

    /// Snapshot of captured request texts (sendMessage only).
    pub async fn message_texts(&self) -> Vec<String> {
        self.transport
            .requests
            .lock()
            .await
            .iter()
            .filter_map(|r| match r {
                OutboundRequest::SendMessage(m) => Some(m.text.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Default harness config: orchestration on, open ACL, callback signing on.
#[must_use]
pub fn harness_config(state_dir: &std::path::Path) -> ChannelConfig {
    let mut config = ChannelConfig::default();
    config.runtime.state_dir = state_dir.to_path_buf();
    config.channel.callback_secret = Some(CALLBACK_SECRET.to_string());
    config
}

/// Build a harness over a fresh temp workspace.
pub async fn build_harness(
    responder: Responder,
    tweak: impl FnOnce(&mut ChannelConfig),
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().join(".brewva");
    let mut harness = build_harness_at(&state_dir, responder, tweak).await;
    harness._dir = Some(dir);
    harness
}

/// Build a harness over an existing state dir (e.g. to test recovery after
/// a simulated crash). The caller keeps the directory alive.
pub async fn build_harness_at(
    state_dir: &std::path::Path,
    responder: Responder,
    tweak: impl FnOnce(&mut ChannelConfig),
) -> Harness {
    let mut config = harness_config(state_dir);
    tweak(&mut config);

    let events = EventBus::new();
    let channel_dir = config.runtime.channel_dir();
    let agents_root = config.runtime.state_dir.join("agents");

    let registry = Arc::new(AgentRegistry::open(&channel_dir, &agents_root, events.clone()));
    let approval_state = Arc::new(ApprovalStateStore::open(
        &channel_dir,
        config.runtime.approval_max_entries,
        events.clone(),
    ));
    let routing = Arc::new(ApprovalRoutingStore::open(
        &channel_dir,
        config.runtime.approval_max_entries,
        events.clone(),
    ));
    let scope = wal_scope(&config.channel.name);
    let wal = Arc::new(
        TurnWal::open(&config.runtime.effective_wal_dir(), &scope).expect("wal opens"),
    );

    let factory = ScriptedFactory::new(responder);
    let prompts = Arc::clone(&factory.prompts);
    let pool = Arc::new(RuntimePool::new(
        Arc::new(factory),
        serde_json::json!({}),
        agents_root.display().to_string(),
        config.runtime.max_live_runtimes,
        events.clone(),
    ));
    let sessions = Arc::new(SessionMap::new());
    let transport = Arc::new(CapturingTransport::default());

    let orchestrator = ChannelOrchestrator::new(
        config,
        events.clone(),
        Arc::clone(&registry),
        pool,
        sessions,
        wal,
        Arc::clone(&routing),
        approval_state,
        transport.clone(),
    );

    Harness {
        _dir: None,
        orchestrator,
        transport,
        prompts,
        registry,
        routing,
        events,
    }
}
