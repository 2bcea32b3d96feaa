//! Interactive-UI block extraction.
//!
//! Assistant text may embed a fenced `telegram-ui/v1` JSON block describing
//! buttons. Extraction pulls each block out of the text and normalizes it
//! into an approval projection: a request id, a title, deduplicated actions,
//! and a keyboard row layout. Blocks that are not valid UI payloads are left
//! in the text untouched.

use std::sync::LazyLock;

use brewva_approval::ApprovalStateSnapshot;
use brewva_core::envelope::{ActionStyle, ApprovalAction};
use brewva_core::normalize_slug;
use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// The only supported UI payload version.
pub const UI_VERSION: &str = "telegram-ui/v1";

const DEFAULT_TITLE: &str = "Choose an action";
const ACTION_ID_MAX: usize = 24;
const SCREEN_TOKEN_MAX: usize = 15;

static UI_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:telegram-ui|telegram_ui|json)[ \t]*\n(.*?)\n?```")
        .expect("invalid regex")
});

/// One extracted interactive-UI payload.
#[derive(Debug, Clone, PartialEq)]
pub struct UiProjection {
    /// Approval request id, explicit or derived.
    pub request_id: String,
    /// Prompt title.
    pub title: String,
    /// Deduplicated actions in first-seen order.
    pub actions: Vec<ApprovalAction>,
    /// Keyboard layout as rows of action ids.
    pub rows: Vec<Vec<String>>,
    /// Snapshot to persist alongside the routing record.
    pub snapshot: ApprovalStateSnapshot,
}

/// Extract every UI block from `text`.
///
/// Returns the text with extracted blocks removed and the projections in
/// document order. Re-running on the returned text is a no-op.
#[must_use]
pub fn extract_ui_blocks(text: &str) -> (String, Vec<UiProjection>) {
    let mut current = text.to_string();
    let mut projections = Vec::new();
    // Removing a block can in principle splice surrounding text into a new
    // fence, so scan until a pass extracts nothing.
    loop {
        let (next, mut found) = extract_once(&current);
        if found.is_empty() {
            break;
        }
        projections.append(&mut found);
        current = next;
    }
    (current, projections)
}

fn extract_once(text: &str) -> (String, Vec<UiProjection>) {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut projections = Vec::new();

    for caps in UI_BLOCK.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        let Some(body) = caps.get(1) else { continue };
        if let Some(projection) = parse_projection(body.as_str()) {
            projections.push(projection);
            out.push_str(&text[cursor..whole.start()]);
            cursor = whole.end();
        }
    }
    out.push_str(&text[cursor..]);
    (out, projections)
}

fn parse_projection(body: &str) -> Option<UiProjection> {
    let payload: Value = serde_json::from_str(body).ok()?;
    if payload.get("version").and_then(Value::as_str) != Some(UI_VERSION) {
        return None;
    }

    let mut actions: Vec<ApprovalAction> = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut index = 0usize;

    // Push a descriptor, deduplicating on action id. Returns the id when the
    // descriptor was new.
    fn push(
        descriptor: &Value,
        actions: &mut Vec<ApprovalAction>,
        index: &mut usize,
    ) -> Option<String> {
        let action = normalize_action(descriptor, *index)?;
        *index += 1;
        if actions.iter().any(|a| a.id == action.id) {
            return None;
        }
        let id = action.id.clone();
        actions.push(action);
        Some(id)
    }

    if let Some(components) = payload.get("components").and_then(Value::as_array) {
        for component in components {
            if let Some(component_rows) = component.get("rows").and_then(Value::as_array) {
                for row in component_rows {
                    let Some(cells) = row.as_array() else { continue };
                    let mut row_ids = Vec::new();
                    for cell in cells {
                        if let Some(id) = push(cell, &mut actions, &mut index) {
                            row_ids.push(id);
                        }
                    }
                    if !row_ids.is_empty() {
                        rows.push(row_ids);
                    }
                }
            }
            if component.get("type").and_then(Value::as_str) == Some("single_select")
                && let Some(options) = component.get("options").and_then(Value::as_array)
            {
                for option in options {
                    let _ = push(option, &mut actions, &mut index);
                }
            }
        }
    }
    if let Some(top_actions) = payload.get("actions").and_then(Value::as_array) {
        for descriptor in top_actions {
            let _ = push(descriptor, &mut actions, &mut index);
        }
    }

    if actions.is_empty() {
        return None;
    }

    // Any action not placed by an explicit row gets its own row; with no
    // explicit rows at all that degenerates to one button per row.
    let placed: Vec<&String> = rows.iter().flatten().collect();
    let unplaced: Vec<Vec<String>> = actions
        .iter()
        .filter(|a| !placed.contains(&&a.id))
        .map(|a| vec![a.id.clone()])
        .collect();
    rows.extend(unplaced);

    let screen_id = payload
        .get("screen_id")
        .and_then(Value::as_str)
        .map(str::to_string);
    let state = payload.get("state").filter(|v| !v.is_null()).cloned();
    let state_key = payload
        .get("state_key")
        .and_then(Value::as_str)
        .map(str::to_string);

    let request_id = payload
        .get("request_id")
        .and_then(Value::as_str)
        .map(|raw| normalize_slug(raw, ACTION_ID_MAX))
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| derive_request_id(screen_id.as_deref(), state.as_ref(), &actions));

    let title = payload
        .get("text")
        .or_else(|| payload.get("title"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(DEFAULT_TITLE)
        .to_string();

    Some(UiProjection {
        request_id,
        title,
        actions,
        rows,
        snapshot: ApprovalStateSnapshot {
            screen_id,
            state_key,
            state,
        },
    })
}

/// `{actionId, label, style?}` from a descriptor value.
fn normalize_action(descriptor: &Value, index: usize) -> Option<ApprovalAction> {
    match descriptor {
        Value::String(label) => {
            let id = fallback_id(normalize_slug(label, ACTION_ID_MAX), index);
            Some(ApprovalAction {
                label: label.trim().to_string(),
                id,
                style: None,
            })
        },
        Value::Object(map) => {
            let raw_id = map
                .get("id")
                .or_else(|| map.get("action_id"))
                .and_then(Value::as_str)
                .unwrap_or("");
            let id = fallback_id(normalize_slug(raw_id, ACTION_ID_MAX), index);
            let label = ["label", "text", "title"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map_or_else(|| id.clone(), str::to_string);
            let style = map
                .get("style")
                .and_then(Value::as_str)
                .and_then(ActionStyle::parse);
            Some(ApprovalAction { id, label, style })
        },
        _ => None,
    }
}

fn fallback_id(normalized: String, index: usize) -> String {
    if normalized.is_empty() {
        format!("a{index}")
    } else {
        normalized
    }
}

/// Derived request id: `<screenToken>_<8 hex>` over the screen id, state,
/// and action ids.
fn derive_request_id(
    screen_id: Option<&str>,
    state: Option<&Value>,
    actions: &[ApprovalAction],
) -> String {
    let token = screen_id
        .map(|s| normalize_slug(s, SCREEN_TOKEN_MAX))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "scr".to_string());

    let state_json = state.map_or_else(|| "null".to_string(), Value::to_string);
    let action_ids: Vec<&str> = actions.iter().map(|a| a.id.as_str()).collect();
    let mut hasher = Sha256::new();
    hasher.update(screen_id.unwrap_or("null").as_bytes());
    hasher.update(b"\n");
    hasher.update(state_json.as_bytes());
    hasher.update(b"\n");
    hasher.update(action_ids.join(",").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{token}_{}", &digest[..8])
}
