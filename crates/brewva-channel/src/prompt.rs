//! Inbound prompt serialization.
//!
//! The agent sees one flat prompt per turn: an optional channel skill-policy
//! block, a compact header line, then the turn content with media and
//! approval context spelled out.

use std::fmt::Write as _;

use brewva_core::envelope::{TurnEnvelope, TurnKind, TurnPart};

/// The standing instruction telling agents how to surface buttons in this
/// channel, optionally recommending a skill.
#[must_use]
pub fn channel_skill_policy(preferred_ui_skill: Option<&str>) -> String {
    let mut policy = String::from(
        "When you need buttons or a choice from the user in this channel, \
         emit a fenced code block tagged `telegram-ui` whose JSON carries \
         \"version\": \"telegram-ui/v1\" with an `actions` array. It will be \
         rendered as an inline keyboard.",
    );
    if let Some(skill) = preferred_ui_skill {
        let _ = write!(policy, " Prefer the `{skill}` skill for interactive output.");
    }
    policy
}

fn kind_label(kind: TurnKind) -> &'static str {
    match kind {
        TurnKind::User => "user",
        TurnKind::Assistant => "assistant",
        TurnKind::Tool => "tool",
        TurnKind::Approval => "approval",
    }
}

/// Serialize an inbound turn into the prompt handed to the session.
#[must_use]
pub fn build_inbound_prompt(turn: &TurnEnvelope, skill_policy: Option<&str>) -> String {
    let mut prompt = String::new();
    if let Some(policy) = skill_policy {
        prompt.push_str(policy);
        prompt.push_str("\n\n");
    }

    let _ = write!(
        prompt,
        "[channel: {} | conversation: {} | kind: {} | turn: {}",
        turn.channel,
        turn.conversation_id,
        kind_label(turn.kind),
        turn.turn_id
    );
    if let Some(thread) = &turn.thread_id {
        let _ = write!(prompt, " | thread: {thread}");
    }
    if let Some(sender) = turn.meta_str("senderId") {
        let _ = write!(prompt, " | sender: {sender}");
    }
    prompt.push(']');

    for part in &turn.parts {
        prompt.push('\n');
        match part {
            TurnPart::Text { text } => prompt.push_str(text),
            TurnPart::Image { uri, mime } => {
                let _ = write!(
                    prompt,
                    "[image {uri}{}]",
                    mime.as_deref().map(|m| format!(" {m}")).unwrap_or_default()
                );
            },
            TurnPart::File { uri, name, mime } => {
                let _ = write!(
                    prompt,
                    "[file {uri}{}{}]",
                    name.as_deref().map(|n| format!(" {n}")).unwrap_or_default(),
                    mime.as_deref().map(|m| format!(" {m}")).unwrap_or_default()
                );
            },
        }
    }

    if let Some(approval) = &turn.approval
        && turn.kind == TurnKind::Approval
    {
        let _ = write!(
            prompt,
            "\n[approval request {} decided: {}]",
            approval.request_id,
            approval
                .actions
                .first()
                .map(|a| a.id.as_str())
                .unwrap_or("unknown")
        );
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewva_core::envelope::{ApprovalAction, ApprovalPayload};
    use serde_json::json;

    fn turn() -> TurnEnvelope {
        let mut turn = TurnEnvelope::new(
            TurnKind::User,
            "telegram:123",
            "tg:message:123:7",
            "telegram",
            "123",
            0,
            vec![TurnPart::text("hello")],
        );
        turn.meta.insert("senderId".into(), json!("55"));
        turn
    }

    #[test]
    fn header_carries_routing_facts() {
        let prompt = build_inbound_prompt(&turn(), None);
        assert!(prompt.starts_with("[channel: telegram | conversation: 123 | kind: user"));
        assert!(prompt.contains("sender: 55"));
        assert!(prompt.contains("\nhello"));
    }

    #[test]
    fn thread_is_included_when_present() {
        let mut t = turn();
        t.thread_id = Some("42".to_string());
        let prompt = build_inbound_prompt(&t, None);
        assert!(prompt.contains("thread: 42"));
    }

    #[test]
    fn skill_policy_is_prefixed() {
        let policy = channel_skill_policy(Some("ui-designer"));
        let prompt = build_inbound_prompt(&turn(), Some(&policy));
        assert!(prompt.starts_with("When you need buttons"));
        assert!(prompt.contains("`ui-designer` skill"));
    }

    #[test]
    fn media_parts_are_summarized() {
        let mut t = turn();
        t.parts.push(TurnPart::Image {
            uri: "telegram:file:p1".to_string(),
            mime: Some("image/jpeg".to_string()),
        });
        t.parts.push(TurnPart::File {
            uri: "telegram:file:d1".to_string(),
            name: Some("report.pdf".to_string()),
            mime: None,
        });
        let prompt = build_inbound_prompt(&t, None);
        assert!(prompt.contains("[image telegram:file:p1 image/jpeg]"));
        assert!(prompt.contains("[file telegram:file:d1 report.pdf]"));
    }

    #[test]
    fn approval_context_is_spelled_out() {
        let mut t = turn();
        t.kind = TurnKind::Approval;
        t.approval = Some(ApprovalPayload {
            request_id: "req-1".to_string(),
            title: "approval decision".to_string(),
            detail: None,
            actions: vec![ApprovalAction {
                id: "approve".to_string(),
                label: "approve".to_string(),
                style: None,
            }],
        });
        let prompt = build_inbound_prompt(&t, None);
        assert!(prompt.contains("[approval request req-1 decided: approve]"));
    }
}
