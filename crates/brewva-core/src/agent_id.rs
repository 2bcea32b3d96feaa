//! Agent id normalization and reserved names.

/// The agent that always exists and cannot be deleted.
pub const DEFAULT_AGENT_ID: &str = "default";

/// Names that can never be claimed by `create_agent`.
pub const RESERVED_AGENT_IDS: &[&str] = &["default", "all", "system"];

/// Normalize a raw agent name into the canonical `[a-z0-9_-]` form.
///
/// Lowercases the input and drops every character outside the allowed set.
/// Returns `None` when nothing survives.
#[must_use]
pub fn normalize_agent_id(raw: &str) -> Option<String> {
    let normalized: String = raw
        .trim()
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Whether `id` is one of the reserved agent names.
#[must_use]
pub fn is_reserved_agent_id(id: &str) -> bool {
    RESERVED_AGENT_IDS.contains(&id)
}

/// Normalize a free-form token into `[a-z0-9_-]`, truncated to `max` chars.
///
/// Used for approval request ids and action ids, which share the same
/// constrained alphabet as agent ids but carry a length cap.
#[must_use]
pub fn normalize_slug(raw: &str, max: usize) -> String {
    raw.trim()
        .chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .take(max)
        .collect()
}
