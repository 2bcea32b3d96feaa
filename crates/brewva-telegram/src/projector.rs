//! Inbound projection: provider update → turn envelope.

use brewva_approval::token;
use brewva_core::envelope::{
    ApprovalAction, ApprovalPayload, TurnEnvelope, TurnKind, TurnPart, approval_decision_line,
};
use brewva_core::now_ms;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::bridge::ApprovalBridge;
use crate::wire::{TgMessage, TgUpdate, file_uri};

/// Cap for the human-readable `state:` line on approval turns.
const MAX_INLINE_STATE: usize = 2000;

/// Inbound projection options.
#[derive(Debug, Clone, Copy)]
pub struct InboundOptions<'a> {
    /// Channel name used in envelope and dedupe keys.
    pub channel: &'a str,
    /// Process messages authored by bots.
    pub allow_bot_messages: bool,
    /// Secret for decoding callback tokens; without it callbacks are
    /// dropped.
    pub callback_secret: Option<&'a str>,
    /// Context the callback tokens were bound to at signing time.
    pub callback_context: Option<&'a str>,
}

/// Provider dedupe key for an update.
///
/// - callback: `telegram:callback:<callback_id>`
/// - message: `<channel>:<conversation>:<messageId>`
/// - edited message: `<channel>:<conversation>:edit:<messageId>:<updateId>`
#[must_use]
pub fn dedupe_key(channel: &str, update: &TgUpdate) -> Option<String> {
    if let Some(query) = &update.callback_query {
        return Some(format!("telegram:callback:{}", query.id));
    }
    if let Some(message) = &update.message {
        return Some(format!("{channel}:{}:{}", message.chat.id, message.message_id));
    }
    if let Some(message) = &update.edited_message {
        return Some(format!(
            "{channel}:{}:edit:{}:{}",
            message.chat.id, message.message_id, update.update_id
        ));
    }
    None
}

/// Project an update into a turn envelope.
///
/// Returns `None` for updates this channel does not consume: unsupported
/// kinds, bot messages (unless opted in), empty messages, and callbacks
/// whose token fails verification.
pub async fn project_update(
    update: &TgUpdate,
    opts: InboundOptions<'_>,
    bridge: Option<&dyn ApprovalBridge>,
) -> Option<TurnEnvelope> {
    if let Some(query) = &update.callback_query {
        return project_callback(update, opts, bridge, query).await;
    }
    if let Some(message) = &update.message {
        return project_message(update, opts, message, false);
    }
    if let Some(message) = &update.edited_message {
        return project_message(update, opts, message, true);
    }
    None
}

async fn project_callback(
    update: &TgUpdate,
    opts: InboundOptions<'_>,
    bridge: Option<&dyn ApprovalBridge>,
    query: &crate::wire::TgCallbackQuery,
) -> Option<TurnEnvelope> {
    let secret = opts.callback_secret?;
    let data = query.data.as_deref()?;
    let Some(payload) = token::decode(data, secret, opts.callback_context) else {
        warn!(callback_id = %query.id, "invalid callback token, dropping");
        return None;
    };

    let conversation_id = query
        .message
        .as_ref()
        .map(|m| m.chat.id.to_string())
        .or_else(|| query.from.as_ref().map(|u| u.id.to_string()))?;
    let thread_id = query
        .message
        .as_ref()
        .and_then(|m| m.message_thread_id)
        .map(|t| t.to_string());

    let mut text = approval_decision_line(&payload.request_id, &payload.action_id);
    let snapshot = match bridge {
        Some(bridge) => {
            bridge
                .resolve_state(&conversation_id, &payload.request_id)
                .await
        },
        None => None,
    };
    if let Some(snapshot) = &snapshot {
        if let Some(screen_id) = &snapshot.screen_id {
            text.push_str(&format!("\nscreen: {screen_id}"));
        }
        if let Some(state_key) = &snapshot.state_key {
            text.push_str(&format!("\nstate_key: {state_key}"));
        }
        if let Some(state) = &snapshot.state {
            let mut rendered = state.to_string();
            if rendered.len() > MAX_INLINE_STATE {
                rendered.truncate(rendered.floor_char_boundary(MAX_INLINE_STATE));
                rendered.push('…');
            }
            text.push_str(&format!("\nstate: {rendered}"));
        }
    }

    let mut turn = TurnEnvelope::new(
        TurnKind::Approval,
        format!("{}:{conversation_id}", opts.channel),
        format!("tg:callback:{}", query.id),
        opts.channel,
        conversation_id,
        now_ms(),
        vec![TurnPart::text(text)],
    );
    turn.thread_id = thread_id;
    turn.message_id = query.message.as_ref().map(|m| m.message_id.to_string());
    turn.approval = Some(ApprovalPayload {
        request_id: payload.request_id.clone(),
        title: "approval decision".to_string(),
        detail: None,
        actions: vec![ApprovalAction {
            id: payload.action_id.clone(),
            label: payload.action_id.clone(),
            style: None,
        }],
    });

    turn.meta.insert("updateId".into(), json!(update.update_id));
    turn.meta
        .insert("callbackQueryId".into(), json!(query.id.clone()));
    turn.meta
        .insert("decisionActionId".into(), json!(payload.action_id));
    if let Some(from) = &query.from {
        turn.meta.insert("senderId".into(), json!(from.id.to_string()));
        if let Some(username) = &from.username {
            turn.meta.insert("senderUsername".into(), json!(username));
        }
    }
    if let Some(snapshot) = snapshot {
        if let Some(screen_id) = snapshot.screen_id {
            turn.meta.insert("approvalScreenId".into(), json!(screen_id));
        }
        if let Some(state_key) = snapshot.state_key {
            turn.meta.insert("approvalStateKey".into(), json!(state_key));
        }
        if let Some(state) = snapshot.state {
            turn.meta.insert("approvalState".into(), state);
        }
    }

    debug!(turn_id = %turn.turn_id, "projected approval turn");
    Some(turn)
}

fn project_message(
    update: &TgUpdate,
    opts: InboundOptions<'_>,
    message: &TgMessage,
    edited: bool,
) -> Option<TurnEnvelope> {
    if let Some(from) = &message.from
        && from.is_bot
        && !opts.allow_bot_messages
    {
        return None;
    }

    let mut parts = Vec::new();
    let text = message
        .text
        .as_deref()
        .or(message.caption.as_deref())
        .map(str::trim)
        .filter(|t| !t.is_empty());
    if let Some(text) = text {
        parts.push(TurnPart::text(text));
    }

    if let Some(photo) = &message.photo
        && let Some(best) = photo.iter().max_by_key(|p| photo_score(p))
    {
        parts.push(TurnPart::Image {
            uri: file_uri(&best.file_id),
            mime: Some("image/jpeg".to_string()),
        });
    }
    if let Some(document) = &message.document {
        parts.push(TurnPart::File {
            uri: file_uri(&document.file_id),
            name: document.file_name.clone(),
            mime: document.mime_type.clone(),
        });
    }
    if let Some(video) = &message.video {
        parts.push(TurnPart::File {
            uri: file_uri(&video.file_id),
            name: video.file_name.clone(),
            mime: Some(video.mime_type.clone().unwrap_or_else(|| "video/mp4".to_string())),
        });
    }
    if let Some(audio) = &message.audio {
        parts.push(TurnPart::File {
            uri: file_uri(&audio.file_id),
            name: audio.file_name.clone(),
            mime: Some(audio.mime_type.clone().unwrap_or_else(|| "audio/mpeg".to_string())),
        });
    }
    if let Some(voice) = &message.voice {
        parts.push(TurnPart::File {
            uri: file_uri(&voice.file_id),
            name: None,
            mime: Some(voice.mime_type.clone().unwrap_or_else(|| "audio/ogg".to_string())),
        });
    }

    if parts.is_empty() {
        return None;
    }

    let conversation_id = message.chat.id.to_string();
    let turn_id = if edited {
        format!("tg:edited:{conversation_id}:{}", message.message_id)
    } else {
        format!("tg:message:{conversation_id}:{}", message.message_id)
    };
    let timestamp = message
        .date
        .map_or_else(now_ms, |secs| secs.saturating_mul(1000));

    let mut turn = TurnEnvelope::new(
        TurnKind::User,
        format!("{}:{conversation_id}", opts.channel),
        turn_id,
        opts.channel,
        conversation_id,
        timestamp,
        parts,
    );
    turn.thread_id = message.message_thread_id.map(|t| t.to_string());
    turn.message_id = Some(message.message_id.to_string());

    turn.meta.insert("updateId".into(), json!(update.update_id));
    if edited {
        turn.meta.insert("edited".into(), json!(true));
    }
    if let Some(from) = &message.from {
        turn.meta.insert("senderId".into(), json!(from.id.to_string()));
        if let Some(username) = &from.username {
            turn.meta.insert("senderUsername".into(), json!(username));
        }
    }
    Some(turn)
}

/// Photo rendition score: prefer declared byte size, fall back to area.
fn photo_score(photo: &crate::wire::TgPhotoSize) -> i64 {
    photo
        .file_size
        .unwrap_or_else(|| photo.width.saturating_mul(photo.height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{TgCallbackQuery, TgChat, TgPhotoSize, TgUser};
    use async_trait::async_trait;
    use brewva_approval::{ApprovalStateSnapshot, CallbackPayload};

    const SECRET: &str = "cb-secret";

    fn opts() -> InboundOptions<'static> {
        InboundOptions {
            channel: "telegram",
            allow_bot_messages: false,
            callback_secret: Some(SECRET),
            callback_context: None,
        }
    }

    fn message(text: &str) -> TgMessage {
        TgMessage {
            message_id: 7,
            date: Some(1_700_000_000),
            chat: TgChat { id: 123 },
            from: Some(TgUser {
                id: 55,
                is_bot: false,
                username: Some("ann".to_string()),
                first_name: None,
            }),
            text: Some(text.to_string()),
            ..TgMessage::default()
        }
    }

    fn update_with_message(message: TgMessage) -> TgUpdate {
        TgUpdate {
            update_id: 900,
            message: Some(message),
            ..TgUpdate::default()
        }
    }

    struct FixedBridge(ApprovalStateSnapshot);

    #[async_trait]
    impl ApprovalBridge for FixedBridge {
        async fn resolve_state(
            &self,
            _conversation_id: &str,
            _request_id: &str,
        ) -> Option<ApprovalStateSnapshot> {
            Some(self.0.clone())
        }
        async fn persist_state(
            &self,
            _conversation_id: &str,
            _request_id: &str,
            _snapshot: ApprovalStateSnapshot,
        ) {
        }
    }

    #[tokio::test]
    async fn text_message_projects_to_user_turn() {
        let update = update_with_message(message("  hello world  "));
        let turn = project_update(&update, opts(), None).await.unwrap();

        assert_eq!(turn.kind, TurnKind::User);
        assert_eq!(turn.turn_id, "tg:message:123:7");
        assert_eq!(turn.conversation_id, "123");
        assert_eq!(turn.timestamp, 1_700_000_000_000);
        assert_eq!(turn.text().as_deref(), Some("hello world"));
        assert_eq!(turn.meta_str("senderId"), Some("55"));
        assert_eq!(turn.meta["updateId"], 900);
    }

    #[tokio::test]
    async fn bot_message_is_skipped_unless_opted_in() {
        let mut msg = message("from a bot");
        msg.from.as_mut().unwrap().is_bot = true;
        let update = update_with_message(msg);

        assert!(project_update(&update, opts(), None).await.is_none());

        let mut allow = opts();
        allow.allow_bot_messages = true;
        assert!(project_update(&update, allow, None).await.is_some());
    }

    #[tokio::test]
    async fn empty_message_projects_to_none() {
        let update = update_with_message(message("   "));
        assert!(project_update(&update, opts(), None).await.is_none());
    }

    #[tokio::test]
    async fn edited_message_gets_edited_turn_id() {
        let update = TgUpdate {
            update_id: 901,
            edited_message: Some(message("fixed typo")),
            ..TgUpdate::default()
        };
        let turn = project_update(&update, opts(), None).await.unwrap();
        assert_eq!(turn.turn_id, "tg:edited:123:7");
        assert_eq!(turn.meta["edited"], true);
    }

    #[tokio::test]
    async fn largest_photo_wins() {
        let mut msg = message("see photo");
        msg.caption = msg.text.take();
        msg.photo = Some(vec![
            TgPhotoSize {
                file_id: "small".to_string(),
                file_size: Some(100),
                width: 90,
                height: 90,
            },
            TgPhotoSize {
                file_id: "big".to_string(),
                file_size: Some(9000),
                width: 10,
                height: 10,
            },
            TgPhotoSize {
                file_id: "area-only".to_string(),
                file_size: None,
                width: 50,
                height: 50,
            },
        ]);
        let update = update_with_message(msg);
        let turn = project_update(&update, opts(), None).await.unwrap();

        let image = turn
            .parts
            .iter()
            .find_map(|p| match p {
                TurnPart::Image { uri, .. } => Some(uri.as_str()),
                _ => None,
            })
            .unwrap();
        assert_eq!(image, "telegram:file:big");
    }

    #[tokio::test]
    async fn thread_id_becomes_string() {
        let mut msg = message("threaded");
        msg.message_thread_id = Some(42);
        let update = update_with_message(msg);
        let turn = project_update(&update, opts(), None).await.unwrap();
        assert_eq!(turn.thread_id.as_deref(), Some("42"));
    }

    fn callback_update(data: Option<String>) -> TgUpdate {
        TgUpdate {
            update_id: 910,
            callback_query: Some(TgCallbackQuery {
                id: "cbq-9".to_string(),
                from: Some(TgUser {
                    id: 55,
                    is_bot: false,
                    username: Some("ann".to_string()),
                    first_name: None,
                }),
                data,
                message: Some(TgMessage {
                    message_id: 31,
                    chat: TgChat { id: 123 },
                    ..TgMessage::default()
                }),
            }),
            ..TgUpdate::default()
        }
    }

    fn signed_token() -> String {
        token::encode(
            &CallbackPayload {
                request_id: "req-1".to_string(),
                action_id: "approve".to_string(),
            },
            SECRET,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn callback_projects_to_approval_turn() {
        let update = callback_update(Some(signed_token()));
        let turn = project_update(&update, opts(), None).await.unwrap();

        assert_eq!(turn.kind, TurnKind::Approval);
        assert_eq!(turn.turn_id, "tg:callback:cbq-9");
        assert_eq!(turn.text().as_deref(), Some("approval req-1 -> approve"));
        let approval = turn.approval.as_ref().unwrap();
        assert_eq!(approval.request_id, "req-1");
        assert_eq!(approval.actions[0].id, "approve");
        assert_eq!(turn.meta_str("decisionActionId"), Some("approve"));
        assert_eq!(turn.meta_str("callbackQueryId"), Some("cbq-9"));
    }

    #[tokio::test]
    async fn tampered_callback_is_dropped() {
        let update = callback_update(Some("v1.req-1.deny.AAAAAAAAAAAAAAAA".to_string()));
        assert!(project_update(&update, opts(), None).await.is_none());
    }

    #[tokio::test]
    async fn callback_without_secret_is_dropped() {
        let update = callback_update(Some(signed_token()));
        let mut no_secret = opts();
        no_secret.callback_secret = None;
        assert!(project_update(&update, no_secret, None).await.is_none());
    }

    #[tokio::test]
    async fn callback_restores_snapshot_lines_and_meta() {
        let bridge = FixedBridge(ApprovalStateSnapshot {
            screen_id: Some("screen-1".to_string()),
            state_key: Some("st_abcdef012345".to_string()),
            state: Some(serde_json::json!({"step": 2})),
        });
        let update = callback_update(Some(signed_token()));
        let turn = project_update(&update, opts(), Some(&bridge)).await.unwrap();

        let text = turn.text().unwrap();
        assert!(text.contains("screen: screen-1"));
        assert!(text.contains("state_key: st_abcdef012345"));
        assert!(text.contains("state: {\"step\":2}"));
        assert_eq!(turn.meta_str("approvalScreenId"), Some("screen-1"));
        assert_eq!(turn.meta_str("approvalStateKey"), Some("st_abcdef012345"));
        assert_eq!(turn.meta["approvalState"]["step"], 2);
    }

    #[tokio::test]
    async fn oversized_state_line_is_truncated() {
        let big = "x".repeat(5000);
        let bridge = FixedBridge(ApprovalStateSnapshot {
            screen_id: None,
            state_key: None,
            state: Some(serde_json::json!({ "big": big })),
        });
        let update = callback_update(Some(signed_token()));
        let turn = project_update(&update, opts(), Some(&bridge)).await.unwrap();
        let text = turn.text().unwrap();
        let state_line = text.lines().find(|l| l.starts_with("state:")).unwrap();
        assert!(state_line.len() <= MAX_INLINE_STATE + 16);
        assert!(state_line.ends_with('…'));
    }

    #[test]
    fn dedupe_keys_per_update_kind() {
        let msg_update = update_with_message(message("x"));
        assert_eq!(
            dedupe_key("telegram", &msg_update).as_deref(),
            Some("telegram:123:7")
        );

        let edited = TgUpdate {
            update_id: 901,
            edited_message: Some(message("x")),
            ..TgUpdate::default()
        };
        assert_eq!(
            dedupe_key("telegram", &edited).as_deref(),
            Some("telegram:123:edit:7:901")
        );

        let callback = callback_update(Some("whatever".to_string()));
        assert_eq!(
            dedupe_key("telegram", &callback).as_deref(),
            Some("telegram:callback:cbq-9")
        );

        assert!(dedupe_key("telegram", &TgUpdate::default()).is_none());
    }
}
