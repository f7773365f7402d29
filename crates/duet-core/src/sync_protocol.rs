//! SyncProtocol: replicates narrative state between host and guest.
//!
//! Outbound messages are queued and drained by the driver with
//! [`SyncProtocol::take_outgoing`]; inbound messages are applied to the
//! caller's [`NarrativeEngine`] by [`SyncProtocol::handle`]. The host is
//! authoritative: only the host sends `SYNC_STATE`, after every selection
//! whichever side made it, and it ignores any it receives. Otherwise the
//! last `NAVIGATE` processed wins.
//!
//! One instance lives per story selection. Timers (heartbeat, delayed full
//! state) are owned here and advanced by [`SyncProtocol::tick`].

use crate::clock::{Clock, Deadline, Interval};
use crate::engine::NarrativeEngine;
use crate::events::EventBus;
use crate::narrative::StateSnapshot;
use crate::peer_session::Role;
use crate::protocol::{NavigationTarget, ProtocolMessage};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Protocol timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Keepalive cadence, independent of application traffic
    pub heartbeat_interval: Duration,
    /// Delay between announcing a selection and sending the full state
    pub full_state_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            full_state_delay: Duration::from_millis(500),
        }
    }
}

/// Who asked for a story selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionOrigin {
    /// Chosen on this peer; announced to the counterpart.
    Local,
    /// Requested by the counterpart; never re-broadcast.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorySelection {
    pub story_id: String,
    pub origin: SelectionOrigin,
}

impl StorySelection {
    pub fn local(story_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            origin: SelectionOrigin::Local,
        }
    }

    pub fn remote(story_id: impl Into<String>) -> Self {
        Self {
            story_id: story_id.into(),
            origin: SelectionOrigin::Remote,
        }
    }
}

/// What an inbound message did to the local narrative.
#[derive(Debug, Clone, PartialEq)]
pub enum NarrativeEvent {
    /// Counterpart went back to the story menu.
    MenuRequested,
    /// Counterpart selected a story. Always `SelectionOrigin::Remote`.
    StorySelected(StorySelection),
    /// Current page changed, or must be redrawn when `rerender` is set.
    PageChanged { page_id: String, rerender: bool },
    /// Counterpart attempted a puzzle (correct or not).
    PuzzleAttempted {
        page_id: String,
        answer: Value,
        correct: bool,
    },
    /// State overwritten from a full snapshot.
    StateReplaced,
    /// The host is on another story. Nothing was applied; the owner must
    /// start a fresh protocol for the snapshot's story.
    StoryChanged(StateSnapshot),
    /// Story restarted from its start page.
    Restarted,
}

pub struct SyncProtocol {
    role: Role,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    heartbeat: Interval,
    full_state: Deadline,
    outbox: VecDeque<ProtocolMessage>,
    events: Arc<EventBus<NarrativeEvent>>,
    destroyed: bool,
}

impl SyncProtocol {
    /// Create a protocol instance and start its heartbeat.
    pub fn new(role: Role, config: SyncConfig, clock: Arc<dyn Clock>) -> Self {
        let mut heartbeat = Interval::new(config.heartbeat_interval);
        heartbeat.start(clock.now_ms());
        Self {
            role,
            config,
            clock,
            heartbeat,
            full_state: Deadline::new(),
            outbox: VecDeque::new(),
            events: Arc::new(EventBus::new()),
            destroyed: false,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn events(&self) -> &Arc<EventBus<NarrativeEvent>> {
        &self.events
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Tell the counterpart where we went. Carries our current score.
    pub fn broadcast_navigation(
        &mut self,
        engine: &NarrativeEngine,
        target: NavigationTarget,
        choice_index: Option<u32>,
    ) {
        let score = Some(engine.state().score());
        self.queue(ProtocolMessage::navigate(target, choice_index, score));
    }

    pub fn broadcast_puzzle_attempt(&mut self, page_id: &str, answer: Value, correct: bool) {
        self.queue(ProtocolMessage::puzzle_attempt(page_id, answer, correct));
    }

    /// Announce a selection made on this peer. Remote-origin selections are
    /// not echoed. On the host, either origin schedules the full state.
    pub fn announce_selection(&mut self, selection: &StorySelection) {
        if self.destroyed {
            return;
        }
        match selection.origin {
            SelectionOrigin::Local => {
                self.queue(ProtocolMessage::story_select(&selection.story_id))
            }
            SelectionOrigin::Remote => {
                debug!("Not echoing remote selection of {}", selection.story_id)
            }
        }
        if self.role == Role::Host {
            self.full_state
                .arm(self.clock.now_ms(), self.config.full_state_delay);
        }
    }

    /// Queue a `SYNC_STATE` with the engine's current state, if a story is loaded.
    pub fn send_full_state(&mut self, engine: &NarrativeEngine) {
        match engine.snapshot() {
            Some(snapshot) => self.queue(ProtocolMessage::SyncState(snapshot)),
            None => debug!("No story loaded, skipping full state"),
        }
    }

    /// Apply an inbound message. Returns (and emits) the resulting event.
    pub async fn handle(
        &mut self,
        engine: &mut NarrativeEngine,
        message: &ProtocolMessage,
    ) -> Option<NarrativeEvent> {
        if self.destroyed {
            return None;
        }
        let event = match message {
            ProtocolMessage::Navigate(nav) => match &nav.target_page {
                NavigationTarget::Menu => Some(NarrativeEvent::MenuRequested),
                NavigationTarget::Restart => {
                    if engine.restart() {
                        Some(NarrativeEvent::Restarted)
                    } else {
                        debug!("Restart requested with no story loaded");
                        None
                    }
                }
                NavigationTarget::Page(page_id) => {
                    if let Some(score) = nav.score {
                        engine.set_score(score);
                    }
                    engine.go_to_page(page_id);
                    Some(NarrativeEvent::PageChanged {
                        page_id: page_id.clone(),
                        rerender: false,
                    })
                }
            },
            ProtocolMessage::PuzzleAttempt(attempt) => {
                if attempt.correct {
                    engine.solve_puzzle(&attempt.page_id);
                }
                if engine.current_page_id() == attempt.page_id {
                    engine.go_to_page(&attempt.page_id);
                    self.emit(NarrativeEvent::PageChanged {
                        page_id: attempt.page_id.clone(),
                        rerender: true,
                    });
                }
                Some(NarrativeEvent::PuzzleAttempted {
                    page_id: attempt.page_id.clone(),
                    answer: attempt.answer.clone(),
                    correct: attempt.correct,
                })
            }
            ProtocolMessage::StorySelect(select) => Some(NarrativeEvent::StorySelected(
                StorySelection::remote(&select.story_id),
            )),
            ProtocolMessage::SyncState(snapshot) => {
                let other_story = matches!(
                    (engine.story_id(), snapshot.story_id.as_deref()),
                    (Some(current), Some(next)) if current != next
                );
                if self.role == Role::Host {
                    debug!("Host ignoring SYNC_STATE");
                    None
                } else if other_story {
                    info!(
                        "Host switched to {}",
                        snapshot.story_id.as_deref().unwrap_or_default()
                    );
                    Some(NarrativeEvent::StoryChanged(snapshot.clone()))
                } else {
                    apply_full_state(engine, snapshot).await
                }
            }
            ProtocolMessage::Ping(_) => {
                self.queue(ProtocolMessage::pong(self.clock.now_ms()));
                None
            }
            ProtocolMessage::Pong(_) => None,
            ProtocolMessage::Malformed { kind, reason } => {
                warn!("Ignoring malformed {} message: {}", kind, reason);
                None
            }
            ProtocolMessage::Unknown { kind } => {
                debug!("Ignoring unknown message type {}", kind);
                None
            }
        };

        if let Some(event) = &event {
            self.emit(event.clone());
        }
        event
    }

    /// Fire due timers. Queues `PING` on the heartbeat and, on the host,
    /// the delayed `SYNC_STATE` after a selection.
    pub fn tick(&mut self, engine: &NarrativeEngine) {
        if self.destroyed {
            return;
        }
        let now = self.clock.now_ms();
        if self.heartbeat.fire(now) {
            self.queue(ProtocolMessage::ping(now));
        }
        if self.full_state.fire(now) {
            self.send_full_state(engine);
        }
    }

    /// Drain queued outbound messages, oldest first.
    pub fn take_outgoing(&mut self) -> Vec<ProtocolMessage> {
        self.outbox.drain(..).collect()
    }

    /// Stop timers and drop queued messages. Idempotent.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.heartbeat.stop();
        self.full_state.cancel();
        self.outbox.clear();
    }

    fn queue(&mut self, message: ProtocolMessage) {
        if self.destroyed {
            return;
        }
        self.outbox.push_back(message);
    }

    fn emit(&self, event: NarrativeEvent) {
        self.events.emit(event);
    }
}

/// Guest-side `SYNC_STATE`: load the snapshot's story into an engine that
/// has none, then overwrite state wholesale.
pub async fn apply_full_state(
    engine: &mut NarrativeEngine,
    snapshot: &StateSnapshot,
) -> Option<NarrativeEvent> {
    if let Some(story_id) = &snapshot.story_id {
        if !engine.has_story(story_id) {
            if let Err(e) = engine.load_story(story_id).await {
                warn!("Cannot apply full state for {}: {}", story_id, e);
                return None;
            }
        }
    }
    if engine.story().is_none() {
        debug!("Ignoring full state without a story");
        return None;
    }
    engine.apply_snapshot(snapshot);
    info!(
        "Applied full state (page {}, score {})",
        engine.current_page_id(),
        engine.state().score()
    );
    Some(NarrativeEvent::StateReplaced)
}

impl Drop for SyncProtocol {
    fn drop(&mut self) {
        self.destroy();
    }
}
