//! The turn envelope — the canonical bidirectional message unit.
//!
//! Envelopes are created at ingress, appended to the turn WAL, serialized
//! through a per-scope queue, and rendered back into provider requests. The
//! orchestrator mutates them only through [`TurnEnvelope::rewrite_text`] and
//! [`TurnEnvelope::canonicalize_session`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema tag carried by every envelope.
pub const TURN_SCHEMA: &str = "brewva.turn.v1";

/// Meta key: the turn this outbound turn replies to.
pub const META_IN_REPLY_TO: &str = "inReplyToTurnId";

/// Meta key: the provider-side session id preserved by
/// [`TurnEnvelope::canonicalize_session`].
pub const META_CHANNEL_SESSION_ID: &str = "channelSessionId";

/// What produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnKind {
    /// Inbound message from a human.
    User,
    /// Outbound model reply.
    Assistant,
    /// Outbound tool-execution report.
    Tool,
    /// Inbound button-press decision.
    Approval,
}

/// One ordered content part of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnPart {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// An image reference.
    Image {
        /// Provider-resolvable URI, e.g. `telegram:file:<file_id>`.
        uri: String,
        /// Best-known mime type.
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
    /// A generic file reference.
    File {
        /// Provider-resolvable URI.
        uri: String,
        /// Original file name, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        /// Best-known mime type.
        #[serde(skip_serializing_if = "Option::is_none")]
        mime: Option<String>,
    },
}

impl TurnPart {
    /// Shorthand for a text part.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Visual weight of an approval button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStyle {
    /// The suggested action.
    Primary,
    /// No particular emphasis.
    Neutral,
    /// Destructive or irreversible.
    Danger,
}

impl ActionStyle {
    /// Parse from the closed wire set; anything else is `None`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "primary" => Some(Self::Primary),
            "neutral" => Some(Self::Neutral),
            "danger" => Some(Self::Danger),
            _ => None,
        }
    }
}

/// One button of an approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalAction {
    /// Action id, `[a-z0-9_-]{1,24}`.
    pub id: String,
    /// Button label shown to the user.
    pub label: String,
    /// Optional visual style.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<ActionStyle>,
}

/// The buttoned-choice payload of an approval turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalPayload {
    /// Request id, `[a-z0-9_-]{1,24}`; stable across render and callback.
    pub request_id: String,
    /// Prompt title.
    pub title: String,
    /// Optional longer description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Ordered buttons.
    pub actions: Vec<ApprovalAction>,
}

/// The canonical unit of flow between provider and runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnEnvelope {
    /// Always [`TURN_SCHEMA`].
    pub schema: String,
    /// What produced this turn.
    pub kind: TurnKind,
    /// Session the turn belongs to. Rewritten by
    /// [`canonicalize_session`](Self::canonicalize_session) once the target
    /// agent session is known.
    pub session_id: String,
    /// Globally unique, stable for a given provider update.
    pub turn_id: String,
    /// Channel name, e.g. `"telegram"`.
    pub channel: String,
    /// Provider conversation id.
    pub conversation_id: String,
    /// Provider thread id, when the conversation is threaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Provider message id, when the turn maps to one message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Millisecond epoch.
    pub timestamp: i64,
    /// Ordered content parts. Non-empty for user turns.
    pub parts: Vec<TurnPart>,
    /// Present on approval turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalPayload>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl TurnEnvelope {
    /// Build an envelope with the fixed schema tag and empty meta.
    #[must_use]
    pub fn new(
        kind: TurnKind,
        session_id: impl Into<String>,
        turn_id: impl Into<String>,
        channel: impl Into<String>,
        conversation_id: impl Into<String>,
        timestamp: i64,
        parts: Vec<TurnPart>,
    ) -> Self {
        Self {
            schema: TURN_SCHEMA.to_string(),
            kind,
            session_id: session_id.into(),
            turn_id: turn_id.into(),
            channel: channel.into(),
            conversation_id: conversation_id.into(),
            thread_id: None,
            message_id: None,
            timestamp,
            parts,
            approval: None,
            meta: Map::new(),
        }
    }

    /// All text parts joined with newlines; `None` when there is no text.
    #[must_use]
    pub fn text(&self) -> Option<String> {
        let texts: Vec<&str> = self
            .parts
            .iter()
            .filter_map(|p| match p {
                TurnPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        if texts.is_empty() {
            None
        } else {
            Some(texts.join("\n"))
        }
    }

    /// Replace every text part with a single text part holding `text`.
    ///
    /// Media parts keep their positions relative to each other; the new text
    /// part takes the slot of the first original text part (or is prepended
    /// when there was none).
    pub fn rewrite_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        let first_text = self
            .parts
            .iter()
            .position(|p| matches!(p, TurnPart::Text { .. }));
        self.parts.retain(|p| !matches!(p, TurnPart::Text { .. }));
        let insert_at = first_text.unwrap_or(0).min(self.parts.len());
        self.parts.insert(insert_at, TurnPart::text(text));
    }

    /// Point the envelope at the agent session, preserving the original
    /// provider session id under `meta.channelSessionId`.
    pub fn canonicalize_session(&mut self, agent_session_id: impl Into<String>) {
        let original = std::mem::take(&mut self.session_id);
        if !original.is_empty() && !self.meta.contains_key(META_CHANNEL_SESSION_ID) {
            self.meta
                .insert(META_CHANNEL_SESSION_ID.to_string(), Value::String(original));
        }
        self.session_id = agent_session_id.into();
    }

    /// Set a string meta entry, builder-style.
    #[must_use]
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    /// Read a string meta entry.
    #[must_use]
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }
}

/// Render the single text part of an inbound approval turn:
/// `"approval <requestId> -> <actionId>"`.
#[must_use]
pub fn approval_decision_line(request_id: &str, action_id: &str) -> String {
    format!("approval {request_id} -> {action_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_turn() -> TurnEnvelope {
        TurnEnvelope::new(
            TurnKind::User,
            "tg:123",
            "tg:message:123:7",
            "telegram",
            "123",
            1_700_000_000_000,
            vec![TurnPart::text("hello")],
        )
    }

    #[test]
    fn new_sets_schema() {
        assert_eq!(user_turn().schema, TURN_SCHEMA);
    }

    #[test]
    fn text_joins_parts() {
        let mut turn = user_turn();
        turn.parts.push(TurnPart::Image {
            uri: "telegram:file:abc".to_string(),
            mime: Some("image/jpeg".to_string()),
        });
        turn.parts.push(TurnPart::text("world"));
        assert_eq!(turn.text().as_deref(), Some("hello\nworld"));
    }

    #[test]
    fn text_none_without_text_parts() {
        let mut turn = user_turn();
        turn.parts = vec![TurnPart::Image {
            uri: "telegram:file:abc".to_string(),
            mime: None,
        }];
        assert!(turn.text().is_none());
    }

    #[test]
    fn rewrite_text_collapses_text_parts() {
        let mut turn = user_turn();
        turn.parts.push(TurnPart::text("more"));
        turn.rewrite_text("task only");
        assert_eq!(turn.text().as_deref(), Some("task only"));
        assert_eq!(turn.parts.len(), 1);
    }

    #[test]
    fn rewrite_text_keeps_media() {
        let mut turn = user_turn();
        turn.parts.push(TurnPart::Image {
            uri: "telegram:file:abc".to_string(),
            mime: None,
        });
        turn.rewrite_text("task");
        assert_eq!(turn.parts.len(), 2);
        assert!(matches!(&turn.parts[0], TurnPart::Text { text } if text == "task"));
        assert!(matches!(&turn.parts[1], TurnPart::Image { .. }));
    }

    #[test]
    fn canonicalize_preserves_original_session() {
        let mut turn = user_turn();
        turn.canonicalize_session("agent:jack:telegram:123");
        assert_eq!(turn.session_id, "agent:jack:telegram:123");
        assert_eq!(turn.meta_str(META_CHANNEL_SESSION_ID), Some("tg:123"));
    }

    #[test]
    fn canonicalize_twice_keeps_first_original() {
        let mut turn = user_turn();
        turn.canonicalize_session("agent:a:telegram:123");
        turn.canonicalize_session("agent:b:telegram:123");
        assert_eq!(turn.meta_str(META_CHANNEL_SESSION_ID), Some("tg:123"));
        assert_eq!(turn.session_id, "agent:b:telegram:123");
    }

    #[test]
    fn serde_round_trip_camel_case() {
        let turn = user_turn().with_meta("updateId", 7);
        let json = serde_json::to_value(&turn).unwrap();
        assert_eq!(json["turnId"], "tg:message:123:7");
        assert_eq!(json["conversationId"], "123");
        assert_eq!(json["parts"][0]["type"], "text");

        let back: TurnEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, turn);
    }

    #[test]
    fn approval_line_format() {
        assert_eq!(
            approval_decision_line("req-1", "approve"),
            "approval req-1 -> approve"
        );
    }

    #[test]
    fn action_style_closed_set() {
        assert_eq!(ActionStyle::parse("primary"), Some(ActionStyle::Primary));
        assert_eq!(ActionStyle::parse("danger"), Some(ActionStyle::Danger));
        assert_eq!(ActionStyle::parse("loud"), None);
    }
}
