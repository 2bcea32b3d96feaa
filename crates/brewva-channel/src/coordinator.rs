//! Multi-agent coordination: fan-out, round-robin discussion, and A2A.

use std::fmt::Write as _;
use std::sync::Arc;

use async_trait::async_trait;
use brewva_events::{ChannelEvent, EventBus};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info};

/// Stop signal an agent can emit to end a discussion.
const DONE_SIGNAL: &str = "[done]";
/// Case-insensitive marker an agent can include to end a discussion.
const SKIP_SIGNAL: &str = "reply_skip";

/// Coordination errors. Display strings double as stable error codes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoordinatorError {
    /// Empty target list.
    #[error("no_targets")]
    NoTargets,

    /// More targets than the fan-out cap.
    #[error("fanout_limit_exceeded:{0}")]
    FanoutLimitExceeded(usize),

    /// Discussions need at least two distinct agents.
    #[error("requires_two_or_more_agents")]
    RequiresTwoOrMoreAgents,

    /// The A2A chain is already at max depth.
    #[error("a2a_depth_limit_exceeded")]
    DepthLimitExceeded,

    /// The A2A chain is already at max hops.
    #[error("a2a_hops_limit_exceeded")]
    HopsLimitExceeded,

    /// Self-targeting is blocked.
    #[error("a2a_self_target_blocked")]
    SelfTargetBlocked,

    /// The target agent is missing or deleted.
    #[error("agent_not_active:{0}")]
    AgentNotActive(String),

    /// The dispatch scope could not be established.
    #[error("dispatch_scope_unavailable")]
    DispatchScopeUnavailable,

    /// The underlying dispatch failed.
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// Why a prompt is being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchReason {
    /// `/run` fan-out.
    Run,
    /// Discussion round.
    Discuss,
    /// Agent-to-agent message.
    A2a,
}

/// The orchestrator-side dispatch seam the coordinator drives.
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    /// Run `prompt` on `agent_id` within `scope_key`; returns the assistant
    /// reply text.
    async fn dispatch(
        &self,
        agent_id: &str,
        scope_key: &str,
        prompt: &str,
        reason: DispatchReason,
    ) -> Result<String, CoordinatorError>;

    /// Whether the agent exists and is active.
    async fn is_agent_active(&self, agent_id: &str) -> bool;
}

/// Coordination limits, lifted from channel config.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorLimits {
    /// Max agents per fan-out or broadcast.
    pub fanout_max_agents: usize,
    /// Hard cap on discussion rounds.
    pub max_discussion_rounds: u32,
    /// Max A2A chain depth.
    pub a2a_max_depth: u32,
    /// Max A2A hops.
    pub a2a_max_hops: u32,
    /// Block an agent from messaging itself.
    pub forbid_self_a2a: bool,
}

/// One agent's outcome within a fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDispatchResult {
    /// The agent.
    pub agent_id: String,
    /// Whether its dispatch succeeded.
    pub ok: bool,
    /// The reply on success.
    pub reply: Option<String>,
    /// The error code on failure.
    pub error: Option<String>,
}

/// Fan-out outcome. `ok` iff every agent succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanOutResult {
    /// Overall success.
    pub ok: bool,
    /// Per-agent outcomes in list order.
    pub results: Vec<AgentDispatchResult>,
}

/// One discussion contribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscussRound {
    /// 1-based round number.
    pub round: u32,
    /// The contributing agent.
    pub agent_id: String,
    /// Its reply.
    pub reply: String,
}

/// Discussion outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscussResult {
    /// Contributions in order.
    pub rounds: Vec<DiscussRound>,
    /// True when a stop signal ended the discussion before the round cap.
    pub stopped_early: bool,
}

/// An A2A send request.
#[derive(Debug, Clone)]
pub struct A2aSend<'a> {
    /// Originating agent.
    pub from_agent_id: &'a str,
    /// Target agent.
    pub to_agent_id: &'a str,
    /// Message body.
    pub message: &'a str,
    /// Correlation id threaded through replies.
    pub correlation_id: Option<&'a str>,
    /// Depth of the chain so far.
    pub depth: u32,
    /// Hops of the chain so far.
    pub hops: u32,
    /// Scope to dispatch within.
    pub scope_key: &'a str,
}

/// The coordinator: stateless logic over a dispatcher and limits.
pub struct Coordinator {
    dispatcher: Arc<dyn AgentDispatcher>,
    limits: CoordinatorLimits,
    events: EventBus,
}

impl Coordinator {
    /// Build a coordinator.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn AgentDispatcher>, limits: CoordinatorLimits, events: EventBus) -> Self {
        Self {
            dispatcher,
            limits,
            events,
        }
    }

    /// Dispatch `task` to each agent in parallel.
    ///
    /// # Errors
    ///
    /// `no_targets` or `fanout_limit_exceeded`; per-agent failures are
    /// reported in the result, not as errors.
    pub async fn fan_out(
        &self,
        agent_ids: &[String],
        task: &str,
        scope_key: &str,
    ) -> Result<FanOutResult, CoordinatorError> {
        let targets = uniq(agent_ids);
        if targets.is_empty() {
            return Err(CoordinatorError::NoTargets);
        }
        if targets.len() > self.limits.fanout_max_agents {
            return Err(CoordinatorError::FanoutLimitExceeded(targets.len()));
        }

        let dispatches = targets.iter().map(|agent_id| async {
            if !self.dispatcher.is_agent_active(agent_id).await {
                return AgentDispatchResult {
                    agent_id: agent_id.clone(),
                    ok: false,
                    reply: None,
                    error: Some(CoordinatorError::AgentNotActive(agent_id.clone()).to_string()),
                };
            }
            match self
                .dispatcher
                .dispatch(agent_id, scope_key, task, DispatchReason::Run)
                .await
            {
                Ok(reply) => AgentDispatchResult {
                    agent_id: agent_id.clone(),
                    ok: true,
                    reply: Some(reply),
                    error: None,
                },
                Err(e) => AgentDispatchResult {
                    agent_id: agent_id.clone(),
                    ok: false,
                    reply: None,
                    error: Some(e.to_string()),
                },
            }
        });
        let results = join_all(dispatches).await;
        let ok = results.iter().all(|r| r.ok);
        debug!(targets = results.len(), ok, "fan-out complete");
        Ok(FanOutResult { ok, results })
    }

    /// Run a round-robin discussion until the round cap or a stop signal.
    ///
    /// # Errors
    ///
    /// `requires_two_or_more_agents`.
    pub async fn discuss(
        &self,
        agent_ids: &[String],
        topic: &str,
        max_rounds: Option<u32>,
        scope_key: &str,
    ) -> Result<DiscussResult, CoordinatorError> {
        let participants = uniq(agent_ids);
        if participants.len() < 2 {
            return Err(CoordinatorError::RequiresTwoOrMoreAgents);
        }

        let cap = self.limits.max_discussion_rounds.max(1);
        let total_rounds = max_rounds.unwrap_or(cap).clamp(1, cap);

        let mut result = DiscussResult {
            rounds: Vec::new(),
            stopped_early: false,
        };
        let mut context = String::new();

        'rounds: for round in 1..=total_rounds {
            for agent_id in &participants {
                let prompt = discussion_prompt(topic, round, total_rounds, &context);
                let reply = match self
                    .dispatcher
                    .dispatch(agent_id, scope_key, &prompt, DispatchReason::Discuss)
                    .await
                {
                    Ok(reply) => reply,
                    Err(e) => format!("(error: {e})"),
                };

                let stop = is_stop_signal(&reply);
                let _ = writeln!(context, "{agent_id}: {reply}");
                result.rounds.push(DiscussRound {
                    round,
                    agent_id: agent_id.clone(),
                    reply,
                });

                if stop {
                    result.stopped_early = true;
                    info!(agent_id = %agent_id, round, "discussion stopped by signal");
                    self.events.publish(ChannelEvent::DiscussionStopped {
                        stopped_by: agent_id.clone(),
                        round,
                    });
                    break 'rounds;
                }
            }
        }
        Ok(result)
    }

    /// Send one A2A message.
    ///
    /// # Errors
    ///
    /// Depth/hops limits, self-target blocking, inactive targets, and
    /// dispatch failures.
    pub async fn a2a_send(&self, send: A2aSend<'_>) -> Result<String, CoordinatorError> {
        let next_depth = send.depth.saturating_add(1);
        let next_hops = send.hops.saturating_add(1);
        if next_depth > self.limits.a2a_max_depth {
            return Err(CoordinatorError::DepthLimitExceeded);
        }
        if next_hops > self.limits.a2a_max_hops {
            return Err(CoordinatorError::HopsLimitExceeded);
        }
        if self.limits.forbid_self_a2a && send.from_agent_id == send.to_agent_id {
            return Err(CoordinatorError::SelfTargetBlocked);
        }
        if !self.dispatcher.is_agent_active(send.to_agent_id).await {
            return Err(CoordinatorError::AgentNotActive(send.to_agent_id.to_string()));
        }

        let mut prompt = format!(
            "[a2a from {} | depth {next_depth} | hops {next_hops}",
            send.from_agent_id
        );
        if let Some(correlation_id) = send.correlation_id {
            let _ = write!(prompt, " | correlation {correlation_id}");
        }
        let _ = write!(prompt, "]\n{}", send.message);

        self.dispatcher
            .dispatch(send.to_agent_id, send.scope_key, &prompt, DispatchReason::A2a)
            .await
    }

    /// Broadcast one A2A message to several targets.
    ///
    /// # Errors
    ///
    /// `no_targets` or `fanout_limit_exceeded`; per-target failures land in
    /// the result list.
    pub async fn a2a_broadcast(
        &self,
        from_agent_id: &str,
        to_agent_ids: &[String],
        message: &str,
        depth: u32,
        hops: u32,
        scope_key: &str,
    ) -> Result<Vec<AgentDispatchResult>, CoordinatorError> {
        let targets = uniq(to_agent_ids);
        if targets.is_empty() {
            return Err(CoordinatorError::NoTargets);
        }
        if targets.len() > self.limits.fanout_max_agents {
            return Err(CoordinatorError::FanoutLimitExceeded(targets.len()));
        }

        let mut results = Vec::with_capacity(targets.len());
        for target in &targets {
            let outcome = self
                .a2a_send(A2aSend {
                    from_agent_id,
                    to_agent_id: target,
                    message,
                    correlation_id: None,
                    depth,
                    hops,
                    scope_key,
                })
                .await;
            results.push(match outcome {
                Ok(reply) => AgentDispatchResult {
                    agent_id: target.clone(),
                    ok: true,
                    reply: Some(reply),
                    error: None,
                },
                Err(e) => AgentDispatchResult {
                    agent_id: target.clone(),
                    ok: false,
                    reply: None,
                    error: Some(e.to_string()),
                },
            });
        }
        Ok(results)
    }
}

fn uniq(agent_ids: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    agent_ids
        .iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

fn discussion_prompt(topic: &str, round: u32, total_rounds: u32, context: &str) -> String {
    let mut prompt = format!("Discussion topic: {topic}\nRound {round}/{total_rounds}.\n");
    if context.is_empty() {
        prompt.push_str("You open the discussion.\n");
    } else {
        let _ = write!(prompt, "Discussion so far:\n{context}");
    }
    prompt.push_str(
        "Contribute your view. Reply with exactly [DONE] when the discussion \
         has concluded, or include REPLY_SKIP to end it without adding more.",
    );
    prompt
}

fn is_stop_signal(reply: &str) -> bool {
    let lowered = reply.trim().to_lowercase();
    lowered == DONE_SIGNAL || lowered.contains(SKIP_SIGNAL)
}
