//! The channel orchestrator: wires ingress, projection, the WAL, the
//! registry, the runtime pool, and the coordinator into one pipeline.
//!
//! Each scope key owns an actor task fed by an unbounded channel; turns for
//! the same scope process strictly in order while scopes proceed
//! independently. The orchestrator is also the [`UpdateSink`] both ingress
//! transports feed.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use brewva_agents::AgentRegistry;
use brewva_approval::{ApprovalRoutingStore, ApprovalStateStore};
use brewva_config::ChannelConfig;
use brewva_core::envelope::{TurnEnvelope, TurnKind, TurnPart};
use brewva_core::{
    META_IN_REPLY_TO, build_agent_scoped_conversation_key, build_routing_scope_key, now_ms,
    wal_scope,
};
use brewva_events::{ChannelEvent, EventBus};
use brewva_ingress::UpdateSink;
use brewva_runtime::{
    ConversationSession, RuntimeError, RuntimePool, SessionMap, TurnOutput, run_prompt,
};
use brewva_telegram::projector::{self, InboundOptions};
use brewva_telegram::render::{RenderOptions, render_turn};
use brewva_telegram::{ApprovalBridge, OutboundRequest, TelegramTransport, TgUpdate};
use brewva_wal::TurnWal;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::{CommandMatch, route_command};
use crate::coordinator::{
    AgentDispatcher, Coordinator, CoordinatorError, CoordinatorLimits, DispatchReason,
};
use crate::prompt::{build_inbound_prompt, channel_skill_policy};

/// Floor for timer periods derived from config.
const MIN_TIMER_PERIOD_MS: u64 = 30_000;

/// Outbound provider seam, so tests can capture requests instead of calling
/// the Bot API.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Deliver one request to the provider.
    async fn send(&self, request: &OutboundRequest) -> anyhow::Result<()>;
}

#[async_trait]
impl OutboundTransport for TelegramTransport {
    async fn send(&self, request: &OutboundRequest) -> anyhow::Result<()> {
        TelegramTransport::send(self, request).await?;
        Ok(())
    }
}

struct ScopeHandle {
    sender: mpsc::UnboundedSender<ScopeJob>,
    task: JoinHandle<()>,
}

struct ScopeJob {
    turn: TurnEnvelope,
    wal_id: Option<String>,
}

struct Inner {
    config: ChannelConfig,
    events: EventBus,
    registry: Arc<AgentRegistry>,
    pool: Arc<RuntimePool>,
    sessions: Arc<SessionMap>,
    wal: Arc<TurnWal>,
    routing: Arc<ApprovalRoutingStore>,
    approval_state: Arc<ApprovalStateStore>,
    transport: Arc<dyn OutboundTransport>,
    scopes: Mutex<HashMap<String, ScopeHandle>>,
    reservations: Mutex<HashSet<String>>,
    controller_seq: Mutex<HashMap<String, u64>>,
    maintenance: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

/// The channel orchestrator. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ChannelOrchestrator {
    inner: Arc<Inner>,
}

impl ChannelOrchestrator {
    /// Wire an orchestrator from its collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelConfig,
        events: EventBus,
        registry: Arc<AgentRegistry>,
        pool: Arc<RuntimePool>,
        sessions: Arc<SessionMap>,
        wal: Arc<TurnWal>,
        routing: Arc<ApprovalRoutingStore>,
        approval_state: Arc<ApprovalStateStore>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                registry,
                pool,
                sessions,
                wal,
                routing,
                approval_state,
                transport,
                scopes: Mutex::new(HashMap::new()),
                reservations: Mutex::new(HashSet::new()),
                controller_seq: Mutex::new(HashMap::new()),
                maintenance: Mutex::new(Vec::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Accept a projected turn into the pipeline. Public for recovery and
    /// tests; live traffic arrives through [`UpdateSink::dispatch`].
    ///
    /// # Errors
    ///
    /// Fails when the WAL append fails; the turn is then not queued.
    pub async fn accept_turn(
        &self,
        turn: TurnEnvelope,
        dedupe_key: Option<&str>,
    ) -> anyhow::Result<()> {
        let outcome = self
            .inner
            .wal
            .append_pending(&turn, dedupe_key)
            .await
            .context("wal_append_failed")?;
        if outcome.deduped {
            debug!(turn_id = %turn.turn_id, "turn already recorded, skipping");
            return Ok(());
        }

        let scope_key = self.inner.scope_key_for(&turn);
        self.inner.events.publish(ChannelEvent::ChannelTurnAccepted {
            scope_key: scope_key.clone(),
            turn_id: turn.turn_id.clone(),
            wal_id: outcome.wal_id.clone(),
        });
        self.inner
            .enqueue(
                scope_key,
                ScopeJob {
                    turn,
                    wal_id: outcome.wal_id,
                },
            )
            .await;
        Ok(())
    }

    /// Replay non-terminal WAL records into the pipeline. Call once per
    /// process start, before ingress begins.
    pub async fn recover(&self) {
        let records = self.inner.wal.non_terminal_records().await;
        let replayed = records.len();
        for record in records {
            let scope_key = self.inner.scope_key_for(&record.envelope);
            self.inner
                .enqueue(
                    scope_key,
                    ScopeJob {
                        turn: record.envelope,
                        wal_id: Some(record.wal_id),
                    },
                )
                .await;
        }
        if replayed > 0 {
            info!(replayed, "replayed wal records");
        }
        self.inner.events.publish(ChannelEvent::WalRecovered {
            scope: wal_scope(&self.inner.config.channel.name),
            replayed,
        });
    }

    /// Start the compaction and idle-eviction timers.
    pub async fn start_maintenance(&self) {
        let mut tasks = self.inner.maintenance.lock().await;

        let compaction = {
            let inner = Arc::clone(&self.inner);
            let window = inner.config.runtime.compact_after_ms;
            let period = Duration::from_millis((window / 2).max(MIN_TIMER_PERIOD_MS));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = inner.cancel.cancelled() => break,
                        () = tokio::time::sleep(period) => {},
                    }
                    match inner.wal.compact(window as i64).await {
                        Ok(dropped) if dropped > 0 => {
                            inner.events.publish(ChannelEvent::WalCompacted {
                                scope: wal_scope(&inner.config.channel.name),
                                dropped,
                            });
                        },
                        Ok(_) => {},
                        Err(e) => warn!(error = %e, "wal compaction failed"),
                    }
                }
            })
        };
        tasks.push(compaction);

        let idle_sweep = {
            let inner = Arc::clone(&self.inner);
            let ttl = inner.config.runtime.idle_runtime_ttl_ms;
            let period = Duration::from_millis((ttl / 2).max(MIN_TIMER_PERIOD_MS));
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = inner.cancel.cancelled() => break,
                        () = tokio::time::sleep(period) => {},
                    }
                    for agent_id in inner.sessions.idle_agents(ttl).await {
                        inner.evict_agent(&agent_id, "idle_ttl").await;
                    }
                    let _ = inner.pool.evict_idle(ttl).await;
                }
            })
        };
        tasks.push(idle_sweep);
    }

    /// Graceful shutdown: stop timers, drain scope actors up to the
    /// configured budget, then dispose sessions and runtimes. Idempotent;
    /// in-flight WAL records stay for the next start.
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.events.publish(ChannelEvent::ShutdownStarted);
        self.inner.cancel.cancel();

        for task in self.inner.maintenance.lock().await.drain(..) {
            let _ = task.await;
        }

        let handles: Vec<ScopeHandle> = {
            let mut scopes = self.inner.scopes.lock().await;
            scopes.drain().map(|(_, handle)| handle).collect()
        };
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.inner.config.channel.graceful_timeout_ms);
        for handle in handles {
            drop(handle.sender);
            if tokio::time::timeout_at(deadline, handle.task).await.is_err() {
                warn!("scope queue did not drain before the graceful deadline");
            }
        }

        for session in self.inner.sessions.all().await {
            let _ = tokio::time::timeout_at(deadline, session.wait_for_tail()).await;
            session.dispose().await;
        }
        self.inner.pool.shutdown().await;
        self.inner.events.publish(ChannelEvent::ShutdownComplete);
        info!("channel orchestrator shut down");
    }

    /// The coordinator bound to this orchestrator's dispatch path.
    #[must_use]
    pub fn coordinator(&self) -> Coordinator {
        self.inner.coordinator()
    }
}

#[async_trait]
impl UpdateSink for ChannelOrchestrator {
    fn dedupe_key(&self, update: &Value) -> Option<String> {
        let parsed: TgUpdate = serde_json::from_value(update.clone()).ok()?;
        projector::dedupe_key(&self.inner.config.channel.name, &parsed)
    }

    async fn reserve(&self, dedupe_key: &str) -> bool {
        self.inner
            .reservations
            .lock()
            .await
            .insert(dedupe_key.to_string())
    }

    async fn release(&self, dedupe_key: &str) {
        self.inner.reservations.lock().await.remove(dedupe_key);
    }

    async fn dispatch(&self, update: Value, dedupe_key: &str) -> anyhow::Result<()> {
        let parsed: TgUpdate =
            serde_json::from_value(update).context("unparseable provider update")?;
        let channel_cfg = &self.inner.config.channel;
        let opts = InboundOptions {
            channel: &channel_cfg.name,
            allow_bot_messages: self.inner.config.telegram.allow_bot_messages,
            callback_secret: channel_cfg.callback_secret.as_deref(),
            callback_context: Some(&channel_cfg.name),
        };
        let bridge: &dyn ApprovalBridge = self.inner.approval_state.as_ref();
        let Some(turn) = projector::project_update(&parsed, opts, Some(bridge)).await else {
            return Ok(());
        };
        self.accept_turn(turn, Some(dedupe_key)).await
    }
}

impl Inner {
    fn scope_key_for(&self, turn: &TurnEnvelope) -> String {
        build_routing_scope_key(
            self.config.channel.routing_strategy,
            &turn.channel,
            &turn.conversation_id,
            turn.thread_id.as_deref(),
        )
    }

    fn coordinator(self: &Arc<Self>) -> Coordinator {
        let channel = &self.config.channel;
        Coordinator::new(
            Arc::new(DispatchSeam {
                inner: Arc::clone(self),
            }),
            CoordinatorLimits {
                fanout_max_agents: channel.fanout_max_agents,
                max_discussion_rounds: channel.max_discussion_rounds,
                a2a_max_depth: channel.a2a_max_depth,
                a2a_max_hops: channel.a2a_max_hops,
                forbid_self_a2a: channel.forbid_self_a2a,
            },
            self.events.clone(),
        )
    }

    /// Hand a job to the scope's actor, spawning or respawning it as needed.
    async fn enqueue(self: &Arc<Self>, scope_key: String, job: ScopeJob) {
        let mut job = Some(job);
        loop {
            let sender = {
                let mut scopes = self.scopes.lock().await;
                match scopes.get(&scope_key) {
                    Some(handle) => handle.sender.clone(),
                    None => {
                        let handle = self.spawn_scope_actor(scope_key.clone());
                        let sender = handle.sender.clone();
                        scopes.insert(scope_key.clone(), handle);
                        sender
                    },
                }
            };
            let Some(current) = job.take() else { return };
            match sender.send(current) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // The actor retired between lookup and send.
                    job = Some(returned);
                    self.scopes.lock().await.remove(&scope_key);
                },
            }
        }
    }

    /// One actor per scope: strict FIFO, retired after an idle period.
    fn spawn_scope_actor(self: &Arc<Self>, scope_key: String) -> ScopeHandle {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ScopeJob>();
        let inner = Arc::clone(self);
        let idle = Duration::from_millis(self.config.runtime.idle_runtime_ttl_ms.max(1000));
        let task = tokio::spawn(async move {
            debug!(scope_key = %scope_key, "scope actor started");
            loop {
                match tokio::time::timeout(idle, receiver.recv()).await {
                    Ok(Some(job)) => inner.process_turn(&scope_key, job).await,
                    Ok(None) => break,
                    Err(_) => {
                        // Idle: deregister (dropping the map's sender), then
                        // drain until the channel closes so a racing enqueue
                        // cannot lose its job.
                        inner.scopes.lock().await.remove(&scope_key);
                        while let Some(job) = receiver.recv().await {
                            inner.process_turn(&scope_key, job).await;
                        }
                        break;
                    },
                }
            }
            debug!(scope_key = %scope_key, "scope actor stopped");
        });
        ScopeHandle { sender, task }
    }

    async fn process_turn(self: &Arc<Self>, scope_key: &str, job: ScopeJob) {
        let turn_id = job.turn.turn_id.clone();
        if let Some(wal_id) = &job.wal_id {
            self.wal.mark_inflight(wal_id).await;
        }

        match self.handle_turn(scope_key, job.turn).await {
            Ok(()) => {
                if let Some(wal_id) = &job.wal_id
                    && let Err(e) = self.wal.mark_done(wal_id).await
                {
                    warn!(wal_id, error = %e, "failed to mark wal record done");
                }
                self.events.publish(ChannelEvent::ChannelTurnDone {
                    scope_key: scope_key.to_string(),
                    turn_id,
                });
            },
            Err(e) => {
                warn!(scope_key, turn_id = %turn_id, error = %e, "turn processing failed");
                if let Some(wal_id) = &job.wal_id
                    && let Err(mark_err) = self.wal.mark_failed(wal_id, &e.to_string()).await
                {
                    warn!(wal_id, error = %mark_err, "failed to mark wal record failed");
                }
                self.events.publish(ChannelEvent::ChannelTurnFailed {
                    scope_key: scope_key.to_string(),
                    turn_id,
                    error: e.to_string(),
                });
            },
        }
    }

    /// Pipeline for one turn, already serialized under its scope.
    async fn handle_turn(self: &Arc<Self>, scope_key: &str, mut turn: TurnEnvelope) -> anyhow::Result<()> {
        let mut explicit_target: Option<String> = None;

        if self.config.channel.orchestration_enabled
            && turn.kind == TurnKind::User
            && let Some(text) = turn.text()
        {
            match route_command(&text) {
                CommandMatch::None => {},
                CommandMatch::Error { message } => {
                    self.controller_reply(scope_key, &turn, &format!("Command failed: {message}"))
                        .await;
                    return Ok(());
                },
                CommandMatch::RouteAgent { agent_id, task } => {
                    if !self.registry.is_active(&agent_id).await {
                        self.controller_reply(
                            scope_key,
                            &turn,
                            &format!("Command failed: agent_not_found:{agent_id}"),
                        )
                        .await;
                        return Ok(());
                    }
                    turn.rewrite_text(task);
                    explicit_target = Some(agent_id);
                },
                command => {
                    self.handle_control_command(scope_key, &turn, command).await;
                    return Ok(());
                },
            }
        }

        let agent_id = match explicit_target {
            Some(agent_id) => agent_id,
            None => self.resolve_target(scope_key, &turn).await,
        };
        self.dispatch_turn(&agent_id, scope_key, turn).await
    }

    /// Approval turns go to the recorded owner when it is still active;
    /// everything else follows focus.
    async fn resolve_target(&self, scope_key: &str, turn: &TurnEnvelope) -> String {
        if turn.kind == TurnKind::Approval
            && let Some(approval) = &turn.approval
            && let Some(route) = self
                .routing
                .resolve(&turn.conversation_id, &approval.request_id)
                .await
            && self.registry.is_active(&route.agent_id).await
        {
            return route.agent_id;
        }
        self.registry.resolve_focus(scope_key).await
    }

    async fn handle_control_command(
        self: &Arc<Self>,
        scope_key: &str,
        turn: &TurnEnvelope,
        command: CommandMatch,
    ) {
        if command.requires_owner() && !self.sender_is_owner(turn) {
            self.controller_reply(scope_key, turn, "Command denied: sender is not an owner")
                .await;
            return;
        }

        let reply = match command {
            CommandMatch::ListAgents => {
                let snapshot = self.registry.snapshot(scope_key).await;
                let mut text = format!("Agents (focus: @{}):", snapshot.focused_agent_id);
                for agent in &snapshot.agents {
                    let marker = if agent.is_focused { "*" } else { "-" };
                    let status = if agent.record.is_active() {
                        ""
                    } else {
                        " (deleted)"
                    };
                    let _ = write!(text, "\n{marker} @{}{status}", agent.record.agent_id);
                    if let Some(model) = &agent.record.model {
                        let _ = write!(text, " [{model}]");
                    }
                }
                text
            },
            CommandMatch::NewAgent { name, model } => {
                match self.registry.create_agent(&name, model).await {
                    Ok(record) => format!("Agent @{} created.", record.agent_id),
                    Err(e) => format!("Command failed: {e}"),
                }
            },
            CommandMatch::DeleteAgent { name } => match self.registry.soft_delete(&name).await {
                Ok(()) => {
                    let agent_id = name.to_lowercase();
                    self.evict_agent(&agent_id, "deleted").await;
                    format!("Agent @{agent_id} deleted.")
                },
                Err(e) => format!("Command failed: {e}"),
            },
            CommandMatch::Focus { name } => match self.registry.set_focus(scope_key, &name).await {
                Ok(()) => format!("Focused @{} for this chat.", name.to_lowercase()),
                Err(e) => format!("Command failed: {e}"),
            },
            CommandMatch::Run { agent_ids, task } => {
                match self.coordinator().fan_out(&agent_ids, &task, scope_key).await {
                    Ok(result) => {
                        let mut text = if result.ok {
                            "Run complete.".to_string()
                        } else {
                            "Run finished with failures.".to_string()
                        };
                        for agent in &result.results {
                            let _ = write!(
                                text,
                                "\n- @{}: {}",
                                agent.agent_id,
                                if agent.ok {
                                    "ok"
                                } else {
                                    agent.error.as_deref().unwrap_or("failed")
                                }
                            );
                        }
                        text
                    },
                    Err(e) => format!("Command failed: {e}"),
                }
            },
            CommandMatch::Discuss {
                agent_ids,
                max_rounds,
                topic,
            } => {
                match self
                    .coordinator()
                    .discuss(&agent_ids, &topic, max_rounds, scope_key)
                    .await
                {
                    Ok(result) => {
                        let rounds = result.rounds.len();
                        if result.stopped_early {
                            format!("Discussion concluded early after {rounds} contributions.")
                        } else {
                            format!("Discussion finished with {rounds} contributions.")
                        }
                    },
                    Err(e) => format!("Command failed: {e}"),
                }
            },
            CommandMatch::None
            | CommandMatch::Error { .. }
            | CommandMatch::RouteAgent { .. } => return,
        };

        self.controller_reply(scope_key, turn, &reply).await;
    }

    fn sender_is_owner(&self, turn: &TurnEnvelope) -> bool {
        let owners = &self.config.channel.owners;
        if owners.is_empty() {
            return matches!(
                self.config.channel.acl_mode_when_owners_empty,
                brewva_config::AclMode::Open
            );
        }
        let sender_id = turn.meta_str("senderId");
        let sender_username = turn.meta_str("senderUsername");
        owners.iter().any(|owner| {
            Some(owner.as_str()) == sender_id
                || Some(owner.trim_start_matches('@')) == sender_username
        })
    }

    /// Steps 5-10 of the pipeline: session, prompt, collect, emit.
    async fn dispatch_turn(
        &self,
        agent_id: &str,
        scope_key: &str,
        mut turn: TurnEnvelope,
    ) -> anyhow::Result<()> {
        let session = self.ensure_session(agent_id, scope_key).await?;
        turn.canonicalize_session(&session.session_key);

        self.events.publish(ChannelEvent::ChannelTurnDispatched {
            scope_key: scope_key.to_string(),
            turn_id: turn.turn_id.clone(),
            agent_id: agent_id.to_string(),
        });
        self.registry.touch_agent(agent_id, now_ms()).await;

        let policy = channel_skill_policy(self.config.channel.preferred_ui_skill.as_deref());
        let prompt = build_inbound_prompt(&turn, Some(&policy));

        let output = {
            let _task = session.begin_task().await;
            run_prompt(&session.session, &prompt).await?
        };

        self.emit_outputs(&session, &turn, output).await;
        Ok(())
    }

    /// Fetch or create the `(agent, scope)` session, retrying once after an
    /// LRU eviction when the pool is at capacity.
    async fn ensure_session(
        &self,
        agent_id: &str,
        scope_key: &str,
    ) -> anyhow::Result<Arc<ConversationSession>> {
        let session_key = build_agent_scoped_conversation_key(agent_id, scope_key);
        let session = self
            .sessions
            .get_or_create(&session_key, || async {
                let overlay = self.registry.agent_config_overlay(agent_id);
                let handle = match self.pool.get_or_create(agent_id, &overlay).await {
                    Ok(handle) => handle,
                    Err(RuntimeError::CapacityExhausted) => {
                        if let Some(victim) = self.sessions.lru_agent().await {
                            info!(victim = %victim, "pool full, evicting lru agent");
                            self.evict_agent(&victim, "lru").await;
                        }
                        self.pool.get_or_create(agent_id, &overlay).await?
                    },
                    Err(e) => return Err(e),
                };
                let session = handle.runtime.open_session(&session_key).await?;
                Ok(ConversationSession::new(
                    session_key.clone(),
                    scope_key,
                    agent_id,
                    session,
                    handle,
                ))
            })
            .await?;
        Ok(session)
    }

    /// Emit tool turns, then the assistant turn. A failed send never aborts
    /// the rest of the emission.
    async fn emit_outputs(
        &self,
        session: &Arc<ConversationSession>,
        inbound: &TurnEnvelope,
        output: TurnOutput,
    ) {
        for tool in &output.tool_events {
            let sequence = session.next_outbound_seq();
            let mut tool_turn = TurnEnvelope::new(
                TurnKind::Tool,
                session.session_key.clone(),
                format!("{}:out:{sequence}", inbound.turn_id),
                inbound.channel.clone(),
                inbound.conversation_id.clone(),
                now_ms(),
                vec![TurnPart::text(format!(
                    "tool {}: {}",
                    tool.tool_name, tool.summary
                ))],
            );
            tool_turn.thread_id = inbound.thread_id.clone();
            tool_turn.meta.insert(
                META_IN_REPLY_TO.to_string(),
                Value::String(inbound.turn_id.clone()),
            );
            self.send_turn(&tool_turn, &session.agent_id).await;
        }

        if !output.assistant_text.is_empty() {
            let sequence = session.next_outbound_seq();
            let mut assistant_turn = TurnEnvelope::new(
                TurnKind::Assistant,
                session.session_key.clone(),
                format!("{}:out:{sequence}", inbound.turn_id),
                inbound.channel.clone(),
                inbound.conversation_id.clone(),
                now_ms(),
                vec![TurnPart::text(output.assistant_text.clone())],
            );
            assistant_turn.thread_id = inbound.thread_id.clone();
            assistant_turn.meta.insert(
                META_IN_REPLY_TO.to_string(),
                Value::String(inbound.turn_id.clone()),
            );
            self.send_turn(&assistant_turn, &session.agent_id).await;
        }
    }

    /// Render and deliver one outbound turn, recording approval routes.
    async fn send_turn(&self, turn: &TurnEnvelope, agent_id: &str) {
        let channel_cfg = &self.config.channel;
        let opts = RenderOptions {
            max_text_length: channel_cfg.max_text_length,
            inline_approvals: channel_cfg.inline_approvals,
            callback_secret: channel_cfg.callback_secret.as_deref(),
            callback_context: Some(&channel_cfg.name),
        };
        let bridge: &dyn ApprovalBridge = self.approval_state.as_ref();
        let rendered = render_turn(turn, opts, Some(bridge)).await;

        for request_id in &rendered.approval_request_ids {
            self.routing
                .record(&turn.conversation_id, request_id, agent_id)
                .await;
        }

        for request in &rendered.requests {
            if let Err(e) = self.transport.send(request).await {
                warn!(turn_id = %turn.turn_id, error = %e, "outbound send failed");
                self.events.publish(ChannelEvent::ChannelTurnOutboundError {
                    turn_id: turn.turn_id.clone(),
                    agent_id: agent_id.to_string(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Controller replies: synthetic assistant turns from
    /// `controller:<controllerAgentId>` with a scope-local sequence.
    async fn controller_reply(&self, scope_key: &str, inbound: &TurnEnvelope, text: &str) {
        let sequence = {
            let mut seq = self.controller_seq.lock().await;
            let entry = seq.entry(scope_key.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let controller = &self.config.channel.controller_agent_id;
        let mut reply = TurnEnvelope::new(
            TurnKind::Assistant,
            format!("controller:{controller}"),
            format!("controller:{scope_key}:{sequence}"),
            inbound.channel.clone(),
            inbound.conversation_id.clone(),
            now_ms(),
            vec![TurnPart::text(text)],
        );
        reply.thread_id = inbound.thread_id.clone();
        reply.meta.insert(
            META_IN_REPLY_TO.to_string(),
            Value::String(inbound.turn_id.clone()),
        );
        self.send_turn(&reply, controller).await;
    }

    /// Evict one agent: drain its session tails (bounded), dispose the
    /// sessions, then dispose the runtime.
    async fn evict_agent(&self, agent_id: &str, reason: &str) {
        let sessions = self.sessions.remove_agent(agent_id).await;
        let handle = self.pool.remove(agent_id).await;
        if sessions.is_empty() && handle.is_none() {
            return;
        }
        let cap = Duration::from_millis(self.config.channel.graceful_timeout_ms);
        for session in sessions {
            if tokio::time::timeout(cap, session.wait_for_tail()).await.is_err() {
                warn!(agent_id, "session tail did not drain before eviction cap");
            }
            if session.in_flight() > 0 {
                warn!(agent_id, "disposing session with in-flight work");
            }
            session.dispose().await;
        }
        if let Some(handle) = handle {
            handle.runtime.dispose().await;
        }
        self.events.publish(ChannelEvent::RuntimeEvicted {
            agent_id: agent_id.to_string(),
            reason: reason.to_string(),
        });
    }

    /// `"<channel>:<conv>"` or `"<channel>:<conv>:thread:<t>"` back into
    /// conversation and thread.
    fn parse_scope_key<'a>(&self, scope_key: &'a str) -> Option<(&'a str, Option<&'a str>)> {
        let rest = scope_key.strip_prefix(&format!("{}:", self.config.channel.name))?;
        match rest.split_once(":thread:") {
            Some((conversation, thread)) => {
                let thread = (thread != "root").then_some(thread);
                Some((conversation, thread))
            },
            None => Some((rest, None)),
        }
    }
}

/// The coordinator's view of the orchestrator.
struct DispatchSeam {
    inner: Arc<Inner>,
}

#[async_trait]
impl AgentDispatcher for DispatchSeam {
    async fn dispatch(
        &self,
        agent_id: &str,
        scope_key: &str,
        prompt: &str,
        reason: DispatchReason,
    ) -> Result<String, CoordinatorError> {
        let inner = &self.inner;
        let (conversation_id, thread_id) = inner
            .parse_scope_key(scope_key)
            .ok_or(CoordinatorError::DispatchScopeUnavailable)?;
        let conversation_id = conversation_id.to_string();
        let thread_id = thread_id.map(str::to_string);

        let session = inner
            .ensure_session(agent_id, scope_key)
            .await
            .map_err(|e| CoordinatorError::Dispatch(e.to_string()))?;

        debug!(agent_id, ?reason, "coordinator dispatch");
        inner.registry.touch_agent(agent_id, now_ms()).await;
        let output = {
            let _task = session.begin_task().await;
            run_prompt(&session.session, prompt)
                .await
                .map_err(|e| CoordinatorError::Dispatch(e.to_string()))?
        };

        // Coordinator dispatches surface their outputs in the channel too.
        let mut synthetic = TurnEnvelope::new(
            TurnKind::User,
            session.session_key.clone(),
            format!("dispatch:{agent_id}:{}", now_ms()),
            inner.config.channel.name.clone(),
            conversation_id,
            now_ms(),
            vec![TurnPart::text(prompt)],
        );
        synthetic.thread_id = thread_id;
        inner.emit_outputs(&session, &synthetic, output.clone()).await;

        Ok(output.assistant_text)
    }

    async fn is_agent_active(&self, agent_id: &str) -> bool {
        self.inner.registry.is_active(agent_id).await
    }
}
