//! Directory-backed story loader.
//!
//! A story lives in `<dir>/<storyId>.json`. The document must carry
//! `meta.id` and `meta.startPage`; everything else is passed through.

use async_trait::async_trait;
use duet_core::{LoadError, Story, StoryLoader};
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct DirStoryLoader {
    root: PathBuf,
}

impl DirStoryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Ids of the stories in the directory, sorted.
    pub async fn list(&self) -> Result<Vec<String>, LoadError> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| LoadError::Storage(format!("{}: {}", self.root.display(), e)))?;

        let mut ids = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| LoadError::Storage(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if is_valid_id(stem) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Story ids become file names, so only a safe subset is accepted.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl StoryLoader for DirStoryLoader {
    async fn load(&self, story_id: &str) -> Result<Story, LoadError> {
        if !is_valid_id(story_id) {
            return Err(LoadError::NotFound(story_id.to_string()));
        }

        let path = self.root.join(format!("{}.json", story_id));
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(LoadError::NotFound(story_id.to_string()));
            }
            Err(e) => return Err(LoadError::Storage(format!("{}: {}", path.display(), e))),
        };

        let invalid = |reason: &str| LoadError::Invalid {
            id: story_id.to_string(),
            reason: reason.to_string(),
        };

        let content: Value = serde_json::from_str(&text).map_err(|e| invalid(&e.to_string()))?;
        let meta = content.get("meta").ok_or_else(|| invalid("missing meta"))?;
        let id = meta
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing meta.id"))?;
        if id != story_id {
            return Err(invalid(&format!("meta.id is {}", id)));
        }
        let start_page = meta
            .get("startPage")
            .and_then(Value::as_str)
            .filter(|page| !page.is_empty())
            .ok_or_else(|| invalid("missing meta.startPage"))?
            .to_string();

        debug!("Read story {} from {}", story_id, path.display());
        Ok(Story {
            id: story_id.to_string(),
            start_page,
            content,
        })
    }
}
