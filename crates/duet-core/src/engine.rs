//! Narrative engine: the single owner of a story's [`NarrativeState`].
//!
//! Story content is opaque to this crate. A [`StoryLoader`] supplies the
//! story id and start page; everything else rides along as JSON for the
//! rendering layer.

use crate::narrative::{NarrativeState, StateSnapshot};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Story not found: {0}")]
    NotFound(String),

    #[error("Invalid story {id}: {reason}")]
    Invalid { id: String, reason: String },

    #[error("Story storage error: {0}")]
    Storage(String),
}

/// A loaded story definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Story {
    pub id: String,
    pub start_page: String,
    /// Pages, choices and puzzles, untouched.
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Story {
    pub fn new(id: impl Into<String>, start_page: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            start_page: start_page.into(),
            content: serde_json::Value::Null,
        }
    }
}

/// Source of story definitions by id.
#[async_trait]
pub trait StoryLoader: Send + Sync {
    async fn load(&self, story_id: &str) -> Result<Story, LoadError>;
}

/// Holds the active story and its state.
pub struct NarrativeEngine {
    loader: Arc<dyn StoryLoader>,
    story: Option<Story>,
    state: NarrativeState,
}

impl NarrativeEngine {
    pub fn new(loader: Arc<dyn StoryLoader>) -> Self {
        Self {
            loader,
            story: None,
            state: NarrativeState::default(),
        }
    }

    /// Load a story and reset state to its start page.
    pub async fn load_story(&mut self, story_id: &str) -> Result<(), LoadError> {
        let story = self.loader.load(story_id).await?;
        debug!("Loaded story {} (start page {})", story.id, story.start_page);
        self.state = NarrativeState::at_start(&story.start_page);
        self.story = Some(story);
        Ok(())
    }

    pub fn story(&self) -> Option<&Story> {
        self.story.as_ref()
    }

    pub fn story_id(&self) -> Option<&str> {
        self.story.as_ref().map(|s| s.id.as_str())
    }

    pub fn has_story(&self, story_id: &str) -> bool {
        self.story_id() == Some(story_id)
    }

    pub fn state(&self) -> &NarrativeState {
        &self.state
    }

    pub fn current_page_id(&self) -> &str {
        self.state.current_page_id()
    }

    pub fn go_to_page(&mut self, page_id: &str) {
        self.state.visit(page_id);
    }

    pub fn set_score(&mut self, score: i64) {
        self.state.set_score(score);
    }

    pub fn add_score(&mut self, delta: i64) {
        self.state.add_score(delta);
    }

    pub fn solve_puzzle(&mut self, page_id: &str) -> bool {
        self.state.mark_solved(page_id)
    }

    /// Reset to the story's initial state. Returns false when no story is loaded.
    pub fn restart(&mut self) -> bool {
        match &self.story {
            Some(story) => {
                self.state.reset(&story.start_page);
                true
            }
            None => false,
        }
    }

    /// Snapshot for a full-state transfer; `None` when no story is loaded.
    pub fn snapshot(&self) -> Option<StateSnapshot> {
        let story_id = self.story_id()?;
        Some(self.state.snapshot(Some(story_id)))
    }

    pub fn apply_snapshot(&mut self, snapshot: &StateSnapshot) {
        self.state.apply_snapshot(snapshot);
    }
}

/// Loader backed by a fixed set of stories.
#[derive(Debug, Default, Clone)]
pub struct StaticStoryLoader {
    stories: Vec<Story>,
}

impl StaticStoryLoader {
    pub fn new(stories: Vec<Story>) -> Self {
        Self { stories }
    }
}

#[async_trait]
impl StoryLoader for StaticStoryLoader {
    async fn load(&self, story_id: &str) -> Result<Story, LoadError> {
        self.stories
            .iter()
            .find(|s| s.id == story_id)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(story_id.to_string()))
    }
}
