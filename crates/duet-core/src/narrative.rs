//! The replicated narrative-session value: current page, visit history,
//! score and solved puzzles.
//!
//! Fields are private. State changes go through the transition methods so
//! inbound protocol messages can never assign arbitrary values.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Ordered set of page ids. Insertion order is visit order; re-inserting a
/// page that is already present is a no-op.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct VisitedPages(Vec<String>);

impl VisitedPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a visit. Returns false if the page was already present.
    pub fn insert(&mut self, page_id: &str) -> bool {
        if self.contains(page_id) {
            return false;
        }
        self.0.push(page_id.to_string());
        true
    }

    pub fn contains(&self, page_id: &str) -> bool {
        self.0.iter().any(|p| p == page_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

impl From<Vec<String>> for VisitedPages {
    fn from(pages: Vec<String>) -> Self {
        let mut visited = Self::new();
        for page in &pages {
            visited.insert(page);
        }
        visited
    }
}

impl From<VisitedPages> for Vec<String> {
    fn from(pages: VisitedPages) -> Self {
        pages.0
    }
}

impl<'a> FromIterator<&'a str> for VisitedPages {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        let mut visited = Self::new();
        for page in iter {
            visited.insert(page);
        }
        visited
    }
}

/// Narrative state shared between host and guest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NarrativeState {
    current_page_id: String,
    visited_pages: VisitedPages,
    score: i64,
    puzzle_solved: BTreeMap<String, bool>,
}

impl NarrativeState {
    /// Initial state of a story: on the start page, which counts as visited.
    pub fn at_start(start_page: &str) -> Self {
        let mut state = Self::default();
        state.visit(start_page);
        state
    }

    pub fn current_page_id(&self) -> &str {
        &self.current_page_id
    }

    pub fn visited_pages(&self) -> &VisitedPages {
        &self.visited_pages
    }

    pub fn score(&self) -> i64 {
        self.score
    }

    pub fn puzzle_solved(&self) -> &BTreeMap<String, bool> {
        &self.puzzle_solved
    }

    pub fn is_solved(&self, page_id: &str) -> bool {
        self.puzzle_solved.get(page_id).copied().unwrap_or(false)
    }

    /// Move to a page and record the visit.
    pub fn visit(&mut self, page_id: &str) {
        self.current_page_id = page_id.to_string();
        self.visited_pages.insert(page_id);
    }

    pub fn set_score(&mut self, score: i64) {
        self.score = score;
    }

    pub fn add_score(&mut self, delta: i64) {
        self.score = self.score.saturating_add(delta);
    }

    /// Mark a page's puzzle as solved. Returns false if it already was.
    pub fn mark_solved(&mut self, page_id: &str) -> bool {
        let previous = self.puzzle_solved.insert(page_id.to_string(), true);
        previous != Some(true)
    }

    /// Back to the initial state of a story.
    pub fn reset(&mut self, start_page: &str) {
        *self = Self::at_start(start_page);
    }

    /// Full snapshot of this state for the given story.
    pub fn snapshot(&self, story_id: Option<&str>) -> StateSnapshot {
        StateSnapshot {
            story_id: story_id.map(str::to_string),
            current_page_id: Some(self.current_page_id.clone()),
            visited_pages: self.visited_pages.clone(),
            score: self.score,
            puzzle_solved: self.puzzle_solved.clone(),
        }
    }

    /// Overwrite this state wholesale from a snapshot.
    ///
    /// A snapshot without a current page keeps the local one.
    pub fn apply_snapshot(&mut self, snapshot: &StateSnapshot) {
        if let Some(page_id) = &snapshot.current_page_id {
            self.current_page_id = page_id.clone();
        }
        self.visited_pages = snapshot.visited_pages.clone();
        self.score = snapshot.score;
        self.puzzle_solved = snapshot.puzzle_solved.clone();
    }
}

/// Wire form of a full-state transfer (`SYNC_STATE` payload).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_page_id: Option<String>,
    pub visited_pages: VisitedPages,
    pub score: i64,
    pub puzzle_solved: BTreeMap<String, bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_state() -> NarrativeState {
        let mut state = NarrativeState::at_start("p1");
        state.visit("p3");
        state.visit("p7");
        state.set_score(-2);
        state.mark_solved("p3");
        state
    }

    #[test]
    fn test_at_start_visits_start_page() {
        let state = NarrativeState::at_start("intro");
        assert_eq!(state.current_page_id(), "intro");
        assert_eq!(state.visited_pages().as_slice(), ["intro"]);
        assert_eq!(state.score(), 0);
        assert!(state.puzzle_solved().is_empty());
    }

    #[test]
    fn test_visited_pages_ignore_duplicates() {
        let mut state = NarrativeState::at_start("p1");
        state.visit("p2");
        state.visit("p1");
        state.visit("p2");
        assert_eq!(state.visited_pages().as_slice(), ["p1", "p2"]);
        assert_eq!(state.current_page_id(), "p2");
    }

    #[test]
    fn test_mark_solved_reports_change_once() {
        let mut state = NarrativeState::at_start("p1");
        assert!(state.mark_solved("p1"));
        assert!(!state.mark_solved("p1"));
        assert!(state.is_solved("p1"));
        assert!(!state.is_solved("p2"));
    }

    #[test]
    fn test_reset_returns_to_start() {
        let mut state = sample_state();
        state.reset("p1");
        assert_eq!(state, NarrativeState::at_start("p1"));
    }

    #[test]
    fn test_snapshot_applies_to_fresh_state() {
        let state = sample_state();
        let snapshot = state.snapshot(Some("forest"));

        let mut fresh = NarrativeState::default();
        fresh.apply_snapshot(&snapshot);

        assert_eq!(fresh, state);
        assert_eq!(snapshot.story_id.as_deref(), Some("forest"));
    }

    #[test]
    fn test_snapshot_without_page_keeps_current() {
        let mut state = NarrativeState::at_start("p4");
        let snapshot = StateSnapshot {
            score: 3,
            ..Default::default()
        };
        state.apply_snapshot(&snapshot);
        assert_eq!(state.current_page_id(), "p4");
        assert_eq!(state.score(), 3);
        assert!(state.visited_pages().is_empty());
    }

    #[test]
    fn test_visited_pages_deserialize_dedupes() {
        let visited: VisitedPages = serde_json::from_str(r#"["a","b","a","c"]"#).unwrap();
        assert_eq!(visited.as_slice(), ["a", "b", "c"]);
    }

    #[test]
    fn test_state_wire_format() {
        let json = serde_json::to_string(&sample_state()).unwrap();
        assert!(json.contains("\"currentPageId\":\"p7\""));
        assert!(json.contains("\"visitedPages\":[\"p1\",\"p3\",\"p7\"]"));
        assert!(json.contains("\"score\":-2"));
        assert!(json.contains("\"puzzleSolved\":{\"p3\":true}"));
    }
}
