//! Capability interfaces over the black-box agent runtime.
//!
//! The orchestrator never sees the LLM runtime directly — only these traits.
//! Events flow out of a session on a broadcast channel so a collector can
//! subscribe before sending a prompt and observe everything the prompt
//! produced.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::RuntimeError;

/// Who produced a message inside the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    /// The model.
    Assistant,
    /// The user prompt echoed back.
    User,
    /// A tool result message.
    Tool,
}

/// Events a session emits while working a prompt.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A tool call finished.
    ToolExecutionEnd {
        /// Unique id of the call; duplicates are collapsed downstream.
        tool_call_id: String,
        /// Tool name.
        tool_name: String,
        /// Short human-readable result summary.
        summary: String,
    },
    /// A message finished streaming.
    MessageEnd {
        /// Message author.
        role: MessageRole,
        /// Full message text.
        text: String,
    },
}

/// One live conversation inside an agent runtime.
#[async_trait]
pub trait Session: Send + Sync {
    /// Stable session id.
    fn id(&self) -> String;

    /// Deliver a user prompt. Returns once the runtime accepted it.
    async fn send_user_message(&self, text: &str) -> Result<(), RuntimeError>;

    /// Resolve when the session has no in-progress work.
    async fn wait_for_idle(&self);

    /// Subscribe to session events. Dropping the receiver releases the
    /// subscription.
    fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// Abort in-progress work, clean up, and clear state. Idempotent.
    async fn dispose(&self);
}

/// A per-agent runtime able to open sessions.
#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// The agent this runtime belongs to.
    fn agent_id(&self) -> &str;

    /// Open (or reopen) the session for `session_key`.
    async fn open_session(&self, session_key: &str) -> Result<Arc<dyn Session>, RuntimeError>;

    /// Tear the runtime down. Idempotent.
    async fn dispose(&self);
}

/// Creates agent runtimes from a merged, namespaced config.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    /// Create the runtime for `agent_id`.
    ///
    /// `config` is the controller base config deep-merged with the agent's
    /// overlay, with all state paths already namespaced under the agent's
    /// state root.
    async fn create_runtime(
        &self,
        agent_id: &str,
        config: serde_json::Value,
    ) -> Result<Arc<dyn AgentRuntime>, RuntimeError>;
}
