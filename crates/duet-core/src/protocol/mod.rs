//! Wire protocol between the two peers of a session.
//!
//! Every message is a JSON envelope `{"type": ..., "payload": {...}}`.
//! Decoding is lenient: unknown types and payloads missing required fields
//! decode to explicit variants that the receiver ignores.

pub mod fields;
pub mod message;

pub use message::{
    Heartbeat, MENU_SENTINEL, Navigate, NavigationTarget, ProtocolMessage, PuzzleAttempt,
    RESTART_SENTINEL, StorySelect,
};
