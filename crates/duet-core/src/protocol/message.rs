//! Protocol message envelope and payload types.
//!
//! Wire format: `{"type":"NAVIGATE","payload":{"targetPage":"p2","score":1}}`

use super::fields;
use crate::narrative::StateSnapshot;
use serde::{Serialize, Serializer};
use serde_json::{Value, json};

/// Reserved `targetPage` that sends both peers back to the story menu.
pub const MENU_SENTINEL: &str = "__menu__";

/// Reserved `targetPage` that restarts the current story.
pub const RESTART_SENTINEL: &str = "__restart__";

pub const NAVIGATE: &str = "NAVIGATE";
pub const PUZZLE_ATTEMPT: &str = "PUZZLE_ATTEMPT";
pub const STORY_SELECT: &str = "STORY_SELECT";
pub const SYNC_STATE: &str = "SYNC_STATE";
pub const PING: &str = "PING";
pub const PONG: &str = "PONG";

/// Where a `NAVIGATE` message sends the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NavigationTarget {
    Page(String),
    Menu,
    Restart,
}

impl NavigationTarget {
    pub fn parse(target: &str) -> Self {
        match target {
            MENU_SENTINEL => Self::Menu,
            RESTART_SENTINEL => Self::Restart,
            page => Self::Page(page.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            Self::Page(page) => page.as_str(),
            Self::Menu => MENU_SENTINEL,
            Self::Restart => RESTART_SENTINEL,
        }
    }
}

impl Serialize for NavigationTarget {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_wire())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Navigate {
    pub target_page: NavigationTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub choice_index: Option<u32>,
    /// Sender's score after the move; overwrites the receiver's when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PuzzleAttempt {
    pub page_id: String,
    /// Puzzle-specific answer, passed through untouched.
    pub answer: Value,
    pub correct: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorySelect {
    pub story_id: String,
}

/// `PING`/`PONG` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Heartbeat {
    /// Sender's clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Navigate(Navigate),
    PuzzleAttempt(PuzzleAttempt),
    StorySelect(StorySelect),
    SyncState(StateSnapshot),
    Ping(Heartbeat),
    Pong(Heartbeat),
    /// Known type whose payload lacks a field that cannot be defaulted.
    Malformed { kind: String, reason: &'static str },
    /// Type this build does not know about.
    Unknown { kind: String },
}

#[derive(Serialize)]
struct Envelope<'a, P: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    payload: P,
}

impl ProtocolMessage {
    pub fn navigate(target: NavigationTarget, choice_index: Option<u32>, score: Option<i64>) -> Self {
        Self::Navigate(Navigate {
            target_page: target,
            choice_index,
            score,
        })
    }

    pub fn puzzle_attempt(page_id: impl Into<String>, answer: Value, correct: bool) -> Self {
        Self::PuzzleAttempt(PuzzleAttempt {
            page_id: page_id.into(),
            answer,
            correct,
        })
    }

    pub fn story_select(story_id: impl Into<String>) -> Self {
        Self::StorySelect(StorySelect {
            story_id: story_id.into(),
        })
    }

    pub fn ping(timestamp: u64) -> Self {
        Self::Ping(Heartbeat { timestamp })
    }

    pub fn pong(timestamp: u64) -> Self {
        Self::Pong(Heartbeat { timestamp })
    }

    /// Wire `type` of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::Navigate(_) => NAVIGATE,
            Self::PuzzleAttempt(_) => PUZZLE_ATTEMPT,
            Self::StorySelect(_) => STORY_SELECT,
            Self::SyncState(_) => SYNC_STATE,
            Self::Ping(_) => PING,
            Self::Pong(_) => PONG,
            Self::Malformed { kind, .. } | Self::Unknown { kind } => kind.as_str(),
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        let kind = self.kind();
        let encoded = match self {
            Self::Navigate(p) => serde_json::to_vec(&Envelope { kind, payload: p }),
            Self::PuzzleAttempt(p) => serde_json::to_vec(&Envelope { kind, payload: p }),
            Self::StorySelect(p) => serde_json::to_vec(&Envelope { kind, payload: p }),
            Self::SyncState(p) => serde_json::to_vec(&Envelope { kind, payload: p }),
            Self::Ping(p) | Self::Pong(p) => serde_json::to_vec(&Envelope { kind, payload: p }),
            Self::Malformed { .. } | Self::Unknown { .. } => serde_json::to_vec(&Envelope {
                kind,
                payload: json!({}),
            }),
        };
        encoded.expect("ProtocolMessage serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or when there is no string `type`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(data).ok()?;
        Self::from_value(&value)
    }

    pub fn from_value(envelope: &Value) -> Option<Self> {
        let kind = envelope.get("type")?.as_str()?;
        let payload = envelope.get("payload").unwrap_or(&Value::Null);

        let malformed = |reason| Self::Malformed {
            kind: kind.to_string(),
            reason,
        };

        let message = match kind {
            NAVIGATE => match fields::string(payload, &["targetPage"]) {
                Some(target) => Self::navigate(
                    NavigationTarget::parse(&target),
                    fields::unsigned(payload, &["choiceIndex"])
                        .and_then(|i| u32::try_from(i).ok()),
                    fields::integer(payload, &["score", "moralPoints"]),
                ),
                None => malformed("missing targetPage"),
            },
            PUZZLE_ATTEMPT => match fields::string(payload, &["pageId"]) {
                Some(page_id) => Self::puzzle_attempt(
                    page_id,
                    payload.get("answer").cloned().unwrap_or(Value::Null),
                    fields::boolean(payload, &["correct"]).unwrap_or(false),
                ),
                None => malformed("missing pageId"),
            },
            STORY_SELECT => match fields::string(payload, &["storyId"]) {
                Some(story_id) => Self::story_select(story_id),
                None => malformed("missing storyId"),
            },
            SYNC_STATE => Self::SyncState(fields::snapshot(payload)),
            PING => Self::ping(fields::unsigned(payload, &["timestamp"]).unwrap_or(0)),
            PONG => Self::pong(fields::unsigned(payload, &["timestamp"]).unwrap_or(0)),
            other => Self::Unknown {
                kind: other.to_string(),
            },
        };
        Some(message)
    }
}
