//! Outbound rendering: turn envelope → provider requests.

use brewva_approval::token::{self, CallbackPayload};
use brewva_core::envelope::{TurnEnvelope, TurnKind, TurnPart};
use tracing::{debug, warn};

use crate::bridge::ApprovalBridge;
use crate::split::split_text;
use crate::ui::{UiProjection, extract_ui_blocks};
use crate::wire::{
    InlineKeyboardButton, InlineKeyboardMarkup, OutboundRequest, SendDocument, SendMessage,
    SendPhoto, media_payload_from_uri,
};

/// Outbound rendering options.
#[derive(Debug, Clone, Copy)]
pub struct RenderOptions<'a> {
    /// Per-message text budget.
    pub max_text_length: usize,
    /// Render approvals as inline keyboards.
    pub inline_approvals: bool,
    /// Secret for signing `callback_data`.
    pub callback_secret: Option<&'a str>,
    /// Context bound into the signed tokens.
    pub callback_context: Option<&'a str>,
}

/// What a rendered turn produced.
#[derive(Debug, Default)]
pub struct RenderOutput {
    /// Provider requests in emission order.
    pub requests: Vec<OutboundRequest>,
    /// Request ids of every approval surfaced by this turn, for routing
    /// records.
    pub approval_request_ids: Vec<String>,
}

/// Render one outbound turn into provider requests.
///
/// Assistant text is scanned for interactive-UI blocks, which become inline
/// keyboards when signing is possible and text fallbacks when it is not.
/// Every accepted snapshot is persisted through `bridge`.
pub async fn render_turn(
    turn: &TurnEnvelope,
    opts: RenderOptions<'_>,
    bridge: Option<&dyn ApprovalBridge>,
) -> RenderOutput {
    let chat_id = turn.conversation_id.clone();
    let thread_id = turn.thread_id.as_deref().and_then(|t| t.parse::<i64>().ok());
    let max_text = if opts.max_text_length == 0 {
        4096
    } else {
        opts.max_text_length
    };

    let mut requests: Vec<OutboundRequest> = Vec::new();
    let mut projections: Vec<UiProjection> = Vec::new();

    for part in &turn.parts {
        match part {
            TurnPart::Text { text } => {
                let remaining = if turn.kind == TurnKind::Assistant {
                    let (remaining, mut found) = extract_ui_blocks(text);
                    projections.append(&mut found);
                    remaining
                } else {
                    text.clone()
                };
                let trimmed = remaining.trim();
                if trimmed.is_empty() {
                    continue;
                }
                for chunk in split_text(trimmed, max_text) {
                    requests.push(OutboundRequest::SendMessage(SendMessage {
                        chat_id: chat_id.clone(),
                        text: chunk,
                        reply_markup: None,
                        message_thread_id: thread_id,
                    }));
                }
            },
            TurnPart::Image { uri, .. } => {
                requests.push(OutboundRequest::SendPhoto(SendPhoto {
                    chat_id: chat_id.clone(),
                    photo: media_payload_from_uri(uri),
                    caption: None,
                    message_thread_id: thread_id,
                }));
            },
            TurnPart::File { uri, name, .. } => {
                requests.push(OutboundRequest::SendDocument(SendDocument {
                    chat_id: chat_id.clone(),
                    document: media_payload_from_uri(uri),
                    caption: name.clone(),
                    message_thread_id: thread_id,
                }));
            },
        }
    }

    // A turn-level approval payload renders like an extracted block with a
    // one-button-per-row layout and nothing to snapshot.
    if let Some(approval) = &turn.approval {
        projections.push(UiProjection {
            request_id: approval.request_id.clone(),
            title: match &approval.detail {
                Some(detail) => format!("{}\n\n{detail}", approval.title),
                None => approval.title.clone(),
            },
            actions: approval.actions.clone(),
            rows: approval.actions.iter().map(|a| vec![a.id.clone()]).collect(),
            snapshot: brewva_approval::ApprovalStateSnapshot::default(),
        });
    }

    let mut output = RenderOutput::default();
    for projection in projections {
        output.approval_request_ids.push(projection.request_id.clone());

        if let Some(bridge) = bridge
            && !projection.snapshot.is_empty()
        {
            bridge
                .persist_state(&turn.conversation_id, &projection.request_id, projection.snapshot.clone())
                .await;
        }

        let signed = match (opts.inline_approvals, opts.callback_secret) {
            (true, Some(secret)) => build_markup(&projection, secret, opts.callback_context),
            _ => None,
        };

        match signed {
            Some(markup) => {
                attach_markup(&mut requests, markup, &projection, &chat_id, thread_id, max_text);
            },
            None => {
                // Signing unavailable or failed: degrade to text. The extra
                // reply hint is suppressed for approval turns, which already
                // prompt for a decision.
                let include_hint = turn.kind != TurnKind::Approval;
                let fallback = fallback_text(&projection, include_hint);
                for chunk in split_text(&fallback, max_text) {
                    requests.push(OutboundRequest::SendMessage(SendMessage {
                        chat_id: chat_id.clone(),
                        text: chunk,
                        reply_markup: None,
                        message_thread_id: thread_id,
                    }));
                }
            },
        }
    }

    output.requests = requests;
    debug!(
        turn_id = %turn.turn_id,
        requests = output.requests.len(),
        approvals = output.approval_request_ids.len(),
        "rendered outbound turn"
    );
    output
}

/// Sign every button of a projection. `None` when any token cannot be built
/// (invalid id, over the byte budget).
fn build_markup(
    projection: &UiProjection,
    secret: &str,
    context: Option<&str>,
) -> Option<InlineKeyboardMarkup> {
    let mut keyboard = Vec::with_capacity(projection.rows.len());
    for row in &projection.rows {
        let mut buttons = Vec::with_capacity(row.len());
        for action_id in row {
            let action = projection.actions.iter().find(|a| &a.id == action_id)?;
            let payload = CallbackPayload {
                request_id: projection.request_id.clone(),
                action_id: action.id.clone(),
            };
            match token::encode(&payload, secret, context) {
                Ok(callback_data) => buttons.push(InlineKeyboardButton {
                    text: action.label.clone(),
                    callback_data,
                }),
                Err(e) => {
                    warn!(
                        request_id = %projection.request_id,
                        action_id = %action.id,
                        error = %e,
                        "callback signing failed, falling back to text"
                    );
                    return None;
                },
            }
        }
        if !buttons.is_empty() {
            keyboard.push(buttons);
        }
    }
    if keyboard.is_empty() {
        return None;
    }
    Some(InlineKeyboardMarkup {
        inline_keyboard: keyboard,
    })
}

/// Attach a keyboard to the first markup-free `sendMessage`, or emit the
/// approval title as its own message(s) with the markup on the first chunk.
fn attach_markup(
    requests: &mut Vec<OutboundRequest>,
    markup: InlineKeyboardMarkup,
    projection: &UiProjection,
    chat_id: &str,
    thread_id: Option<i64>,
    max_text: usize,
) {
    let free_slot = requests.iter_mut().find_map(|request| match request {
        OutboundRequest::SendMessage(message) if message.reply_markup.is_none() => Some(message),
        _ => None,
    });
    if let Some(message) = free_slot {
        message.reply_markup = Some(markup);
        return;
    }

    let chunks = split_text(&projection.title, max_text);
    let mut markup = Some(markup);
    for chunk in chunks {
        requests.push(OutboundRequest::SendMessage(SendMessage {
            chat_id: chat_id.to_string(),
            text: chunk,
            reply_markup: markup.take(),
            message_thread_id: thread_id,
        }));
    }
}

/// Text rendition of an approval for channels (or moments) without buttons.
fn fallback_text(projection: &UiProjection, include_hint: bool) -> String {
    let mut text = projection.title.clone();
    for action in &projection.actions {
        text.push_str(&format!("\n• {} ({})", action.label, action.id));
    }
    if include_hint {
        text.push_str(&format!(
            "\nReply with: approval {} -> <action>",
            projection.request_id
        ));
    }
    text
}
