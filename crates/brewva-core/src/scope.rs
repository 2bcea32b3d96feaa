//! Deterministic scope keys.
//!
//! A scope key identifies the unit of FIFO serialization: one chat, or one
//! thread inside a chat, depending on the configured routing strategy. The
//! agent-scoped conversation key additionally pins the key to one agent so
//! that two agents serving the same chat keep independent sessions.

use serde::{Deserialize, Serialize};

/// How inbound turns are grouped into serial scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// One scope per conversation.
    #[default]
    Chat,
    /// One scope per thread; threadless messages land in `thread:root`.
    Thread,
}

impl std::str::FromStr for RoutingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chat" => Ok(Self::Chat),
            "thread" => Ok(Self::Thread),
            other => Err(format!("unknown routing strategy: {other}")),
        }
    }
}

/// Build the routing scope key for a conversation.
///
/// - `chat` strategy: `"<channel>:<conversationId>"`
/// - `thread` strategy: `"<channel>:<conversationId>:thread:<threadId|root>"`
#[must_use]
pub fn build_routing_scope_key(
    strategy: RoutingStrategy,
    channel: &str,
    conversation_id: &str,
    thread_id: Option<&str>,
) -> String {
    match strategy {
        RoutingStrategy::Chat => format!("{channel}:{conversation_id}"),
        RoutingStrategy::Thread => {
            let thread = thread_id.filter(|t| !t.is_empty()).unwrap_or("root");
            format!("{channel}:{conversation_id}:thread:{thread}")
        },
    }
}

/// Build the session key for one agent serving one scope:
/// `"agent:<agentId>:<scopeKey>"`.
#[must_use]
pub fn build_agent_scoped_conversation_key(agent_id: &str, scope_key: &str) -> String {
    format!("agent:{agent_id}:{scope_key}")
}

/// WAL scope for a channel: `"channel-<channel>"`.
#[must_use]
pub fn wal_scope(channel: &str) -> String {
    format!("channel-{channel}")
}
