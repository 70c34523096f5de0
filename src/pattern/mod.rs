//! Higher-level middleware steps: patterns that orchestrate further remote
//! actions on top of the pipeline engine.

pub mod fanout;
pub mod fsm;

use serde_json::Value;

/// Walk a dot-delimited path (`a.b.c`) into a JSON value.
pub fn value_at_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            _ => return None,
        };
    }
    Some(current)
}
