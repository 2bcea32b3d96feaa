//! Deep merge and namespacing for per-agent runtime config overlays.
//!
//! An agent's `config.json` deep-merges over a clone of the controller
//! runtime's base config; after the merge, all per-agent state paths are
//! forced under the agent's own state root so two agents can never share
//! a ledger, memory dir, or WAL.

use serde_json::{Map, Value, json};

/// Recursively deep-merge `overlay` into `base`.
///
/// - Objects merge recursively per-field.
/// - Scalars and arrays from the overlay **replace** the base value.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, overlay_val) in overlay_map {
                if let Some(base_val) = base_map.get_mut(key) {
                    deep_merge(base_val, overlay_val);
                } else {
                    base_map.insert(key.clone(), overlay_val.clone());
                }
            }
        },
        (base, overlay) => {
            *base = overlay.clone();
        },
    }
}

/// Force all per-agent paths in `config` under `state_root` and disable the
/// scheduler.
///
/// Rewritten keys: `ledger.path`, `memory.dir`, `schedule.dir`,
/// `events.dir`, `turnWal.dir`; `schedule.enabled` is always `false`.
pub fn namespace_agent_config(config: &mut Value, state_root: &str) {
    set_path(config, &["ledger", "path"], json!(format!("{state_root}/ledger.jsonl")));
    set_path(config, &["memory", "dir"], json!(format!("{state_root}/memory")));
    set_path(config, &["schedule", "dir"], json!(format!("{state_root}/schedule")));
    set_path(config, &["schedule", "enabled"], json!(false));
    set_path(config, &["events", "dir"], json!(format!("{state_root}/events")));
    set_path(config, &["turnWal", "dir"], json!(format!("{state_root}/turn-wal")));
}

/// Set a nested key, creating intermediate objects. A non-object in the way
/// is replaced.
fn set_path(root: &mut Value, path: &[&str], value: Value) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut cursor = root;
    for key in parents {
        if !cursor.is_object() {
            *cursor = Value::Object(Map::new());
        }
        let Some(map) = cursor.as_object_mut() else {
            return;
        };
        cursor = map
            .entry((*key).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    if !cursor.is_object() {
        *cursor = Value::Object(Map::new());
    }
    if let Some(map) = cursor.as_object_mut() {
        map.insert((*last).to_string(), value);
    }
}
