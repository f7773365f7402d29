//! Tolerant readers for untrusted JSON payload fields.
//!
//! Each reader takes a list of accepted names (current name first, then
//! legacy aliases) and returns `None` when no name holds a value of the
//! expected shape. Callers decide the default.

use crate::narrative::{StateSnapshot, VisitedPages};
use serde_json::Value;
use std::collections::BTreeMap;

fn lookup<'a>(payload: &'a Value, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| payload.get(name))
        .find(|v| !v.is_null())
}

pub fn string(payload: &Value, names: &[&str]) -> Option<String> {
    lookup(payload, names)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Integer field. Integral floats (`2.0`) are accepted since browser peers
/// send every number as a double.
pub fn integer(payload: &Value, names: &[&str]) -> Option<i64> {
    let value = lookup(payload, names)?;
    value.as_i64().or_else(|| {
        value
            .as_f64()
            .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

pub fn unsigned(payload: &Value, names: &[&str]) -> Option<u64> {
    integer(payload, names).and_then(|n| u64::try_from(n).ok())
}

pub fn boolean(payload: &Value, names: &[&str]) -> Option<bool> {
    lookup(payload, names).and_then(Value::as_bool)
}

/// Array of strings; non-string entries are skipped.
pub fn string_list(payload: &Value, names: &[&str]) -> Option<Vec<String>> {
    let items = lookup(payload, names)?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

/// Object of booleans; non-boolean entries are skipped.
pub fn flag_map(payload: &Value, names: &[&str]) -> Option<BTreeMap<String, bool>> {
    let object = lookup(payload, names)?.as_object()?;
    Some(
        object
            .iter()
            .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
            .collect(),
    )
}

/// Decode a `SYNC_STATE` payload. Missing fields take the initial-state
/// defaults (empty history, zero score, nothing solved).
pub fn snapshot(payload: &Value) -> StateSnapshot {
    StateSnapshot {
        story_id: string(payload, &["storyId"]),
        current_page_id: string(payload, &["currentPageId", "currentPage"]),
        visited_pages: string_list(payload, &["visitedPages"])
            .map(VisitedPages::from)
            .unwrap_or_default(),
        score: integer(payload, &["score", "moralPoints"]).unwrap_or(0),
        puzzle_solved: flag_map(payload, &["puzzleSolved", "puzzleResults"]).unwrap_or_default(),
    }
}
