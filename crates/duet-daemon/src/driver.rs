//! Session driver.
//!
//! Wires one [`PeerSession`] to the story currently on screen. The driver is
//! the single logical thread of control for a peer: peer events, timer
//! ticks and local commands are handed to it one at a time and each runs to
//! completion.
//!
//! While no story is selected there is no [`SyncProtocol`]; the driver still
//! follows a `STORY_SELECT` from the counterpart and, on the guest, bootstraps
//! the story from a `SYNC_STATE`.

use duet_core::sync_protocol::apply_full_state;
use duet_core::{
    Clock, LoadError, NarrativeEngine, NarrativeEvent, NavigationTarget, PeerEvent, PeerSession,
    ProtocolMessage, Role, RoomCode, SessionError, StateSnapshot, StoryLoader, StorySelection,
    SyncConfig, SyncProtocol,
};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

const USAGE: &str = "select STORY | go PAGE [CHOICE] [SCORE_DELTA] | solve PAGE [ANSWER] | fail PAGE [ANSWER] | menu | restart | mic | cam | state | quit";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("No story selected")]
    NoStory,

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// A line typed by the local player.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Select(String),
    Go {
        page_id: String,
        choice_index: Option<u32>,
        score_delta: i64,
    },
    Attempt {
        page_id: String,
        answer: Value,
        correct: bool,
    },
    Menu,
    Restart,
    ToggleMic,
    ToggleCam,
    State,
    Quit,
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(CommandError::Usage(USAGE))?;

        match verb.to_ascii_lowercase().as_str() {
            "select" => words
                .next()
                .map(|id| Self::Select(id.to_string()))
                .ok_or(CommandError::Usage("select STORY")),
            "go" => {
                const GO: &str = "go PAGE [CHOICE] [SCORE_DELTA]";
                let page_id = words.next().ok_or(CommandError::Usage(GO))?.to_string();
                let choice_index = words
                    .next()
                    .map(str::parse::<u32>)
                    .transpose()
                    .map_err(|_| CommandError::Usage(GO))?;
                let score_delta = words
                    .next()
                    .map(str::parse::<i64>)
                    .transpose()
                    .map_err(|_| CommandError::Usage(GO))?
                    .unwrap_or(0);
                Ok(Self::Go {
                    page_id,
                    choice_index,
                    score_delta,
                })
            }
            verb @ ("solve" | "fail") => {
                let page_id = words
                    .next()
                    .ok_or(CommandError::Usage("solve|fail PAGE [ANSWER]"))?
                    .to_string();
                let rest = words.collect::<Vec<_>>().join(" ");
                let answer = if rest.is_empty() {
                    Value::Null
                } else {
                    serde_json::from_str(&rest).unwrap_or(Value::String(rest))
                };
                Ok(Self::Attempt {
                    page_id,
                    answer,
                    correct: verb == "solve",
                })
            }
            "menu" => Ok(Self::Menu),
            "restart" => Ok(Self::Restart),
            "mic" => Ok(Self::ToggleMic),
            "cam" => Ok(Self::ToggleCam),
            "state" => Ok(Self::State),
            "quit" | "exit" => Ok(Self::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

pub struct Driver {
    session: PeerSession,
    loader: Arc<dyn StoryLoader>,
    clock: Arc<dyn Clock>,
    sync_config: SyncConfig,
    engine: Option<NarrativeEngine>,
    sync: Option<SyncProtocol>,
}

impl Driver {
    pub fn new(
        session: PeerSession,
        loader: Arc<dyn StoryLoader>,
        clock: Arc<dyn Clock>,
        sync_config: SyncConfig,
    ) -> Self {
        Self {
            session,
            loader,
            clock,
            sync_config,
            engine: None,
            sync: None,
        }
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn engine(&self) -> Option<&NarrativeEngine> {
        self.engine.as_ref()
    }

    pub fn story_id(&self) -> Option<&str> {
        self.engine.as_ref().and_then(NarrativeEngine::story_id)
    }

    pub async fn host(&mut self) -> Result<RoomCode, SessionError> {
        self.session.host().await
    }

    pub async fn join(&mut self, code: &str) -> Result<RoomCode, SessionError> {
        self.session.join(code).await
    }

    /// Wait for the next session event. Cancel-safe.
    pub async fn next_peer_event(&mut self) -> Option<PeerEvent> {
        self.session.poll_event().await
    }

    pub async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Ready | PeerEvent::Resumed => {
                info!(
                    "Connected to the other player ({})",
                    if event == PeerEvent::Ready { "ready" } else { "resumed" }
                );
                if self.session.role() == Role::Host {
                    self.push_full_state();
                }
            }
            PeerEvent::Lost => {
                info!(
                    "Connection lost, reconnecting (attempt {})",
                    self.session.reconnect_attempts()
                );
            }
            PeerEvent::RemoteStream(stream) => {
                info!("Receiving the other player's media: {:?}", stream.tracks);
            }
            PeerEvent::Message(message) => self.on_message(message).await,
            PeerEvent::Error(e) => warn!("Session error: {}", e),
        }
    }

    /// Advance session and protocol timers.
    pub async fn tick(&mut self) {
        if let Some(event) = self.session.tick().await {
            self.handle_peer_event(event).await;
        }
        if let (Some(sync), Some(engine)) = (self.sync.as_mut(), self.engine.as_ref()) {
            sync.tick(engine);
        }
        self.flush();
    }

    /// Run a local command. `State` and `Quit` are left to the caller.
    pub async fn execute(&mut self, command: Command) -> Result<(), CommandError> {
        match command {
            Command::Select(story_id) => self.select_story(StorySelection::local(story_id)).await,
            Command::Go {
                page_id,
                choice_index,
                score_delta,
            } => {
                let (sync, engine) = self.active()?;
                engine.add_score(score_delta);
                engine.go_to_page(&page_id);
                sync.broadcast_navigation(engine, NavigationTarget::Page(page_id), choice_index);
                self.flush();
                Ok(())
            }
            Command::Attempt {
                page_id,
                answer,
                correct,
            } => {
                let (sync, engine) = self.active()?;
                if correct {
                    engine.solve_puzzle(&page_id);
                }
                sync.broadcast_puzzle_attempt(&page_id, answer, correct);
                self.flush();
                Ok(())
            }
            Command::Restart => {
                let (sync, engine) = self.active()?;
                engine.restart();
                sync.broadcast_navigation(engine, NavigationTarget::Restart, None);
                self.flush();
                Ok(())
            }
            Command::Menu => {
                if let (Some(sync), Some(engine)) = (self.sync.as_mut(), self.engine.as_ref()) {
                    sync.broadcast_navigation(engine, NavigationTarget::Menu, None);
                }
                self.flush();
                self.leave_story();
                Ok(())
            }
            Command::ToggleMic => {
                let enabled = self.session.toggle_local_audio();
                info!("Microphone {}", if enabled { "on" } else { "off" });
                Ok(())
            }
            Command::ToggleCam => {
                let enabled = self.session.toggle_local_video();
                info!("Camera {}", if enabled { "on" } else { "off" });
                Ok(())
            }
            Command::State | Command::Quit => Ok(()),
        }
    }

    /// Connection and narrative state as pretty JSON.
    pub fn describe(&self) -> String {
        let narrative: Option<StateSnapshot> = self.engine.as_ref().and_then(NarrativeEngine::snapshot);
        let value = json!({
            "room": self.session.room_code().map(RoomCode::as_str),
            "role": self.session.role(),
            "connection": self.session.state(),
            "narrative": narrative,
        });
        serde_json::to_string_pretty(&value).unwrap_or_default()
    }

    pub async fn close(&mut self) {
        self.leave_story();
        self.session.close().await;
    }

    fn active(&mut self) -> Result<(&mut SyncProtocol, &mut NarrativeEngine), CommandError> {
        match (self.sync.as_mut(), self.engine.as_mut()) {
            (Some(sync), Some(engine)) => Ok((sync, engine)),
            _ => Err(CommandError::NoStory),
        }
    }

    async fn on_message(&mut self, message: ProtocolMessage) {
        let event = match (self.sync.as_mut(), self.engine.as_mut()) {
            (Some(sync), Some(engine)) => sync.handle(engine, &message).await,
            _ => {
                self.on_menu_message(message).await;
                return;
            }
        };
        self.flush();

        match event {
            Some(NarrativeEvent::MenuRequested) => {
                info!("The other player went back to the menu");
                self.leave_story();
            }
            Some(NarrativeEvent::StorySelected(selection)) => {
                if let Err(e) = self.select_story(selection).await {
                    warn!("{}", e);
                }
            }
            Some(NarrativeEvent::PageChanged { page_id, .. }) => info!("Now on page {}", page_id),
            Some(NarrativeEvent::PuzzleAttempted {
                page_id, correct, ..
            }) => info!(
                "The other player {} the puzzle on {}",
                if correct { "solved" } else { "missed" },
                page_id
            ),
            Some(NarrativeEvent::StateReplaced) => info!("State synchronized"),
            Some(NarrativeEvent::StoryChanged(snapshot)) => self.bootstrap(&snapshot).await,
            Some(NarrativeEvent::Restarted) => info!("Story restarted"),
            None => {}
        }
    }

    async fn on_menu_message(&mut self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::StorySelect(select) => {
                if let Err(e) = self.select_story(StorySelection::remote(select.story_id)).await {
                    warn!("{}", e);
                }
            }
            ProtocolMessage::SyncState(snapshot) if self.session.role() == Role::Guest => {
                self.bootstrap(&snapshot).await;
            }
            ProtocolMessage::Ping(_) => {
                self.session
                    .send(&ProtocolMessage::pong(self.clock.now_ms()));
            }
            ProtocolMessage::Malformed { kind, reason } => {
                warn!("Ignoring malformed {} message: {}", kind, reason);
            }
            other => debug!("Ignoring {} outside a story", other.kind()),
        }
    }

    async fn select_story(&mut self, selection: StorySelection) -> Result<(), CommandError> {
        self.leave_story();

        let mut engine = NarrativeEngine::new(Arc::clone(&self.loader));
        engine.load_story(&selection.story_id).await?;
        info!(
            "Playing {} (start page {})",
            selection.story_id,
            engine.current_page_id()
        );

        let mut sync = SyncProtocol::new(
            self.session.role(),
            self.sync_config.clone(),
            Arc::clone(&self.clock),
        );
        sync.announce_selection(&selection);
        self.engine = Some(engine);
        self.sync = Some(sync);
        self.flush();
        Ok(())
    }

    /// Guest joining mid-story, or following the host to another story:
    /// take the story and state from the snapshot. The current story is only
    /// left once the new one has loaded.
    async fn bootstrap(&mut self, snapshot: &StateSnapshot) {
        let mut engine = NarrativeEngine::new(Arc::clone(&self.loader));
        if apply_full_state(&mut engine, snapshot).await.is_none() {
            return;
        }
        self.leave_story();
        info!(
            "Joined {} on page {}",
            engine.story_id().unwrap_or_default(),
            engine.current_page_id()
        );
        self.sync = Some(SyncProtocol::new(
            self.session.role(),
            self.sync_config.clone(),
            Arc::clone(&self.clock),
        ));
        self.engine = Some(engine);
    }

    fn leave_story(&mut self) {
        if let Some(mut sync) = self.sync.take() {
            sync.destroy();
        }
        if self.engine.take().is_some() {
            info!("Back at the story menu");
        }
    }

    fn push_full_state(&self) {
        if let Some(snapshot) = self.engine.as_ref().and_then(NarrativeEngine::snapshot) {
            self.session.send(&ProtocolMessage::SyncState(snapshot));
        }
    }

    fn flush(&mut self) {
        if let Some(sync) = self.sync.as_mut() {
            for message in sync.take_outgoing() {
                self.session.send(&message);
            }
        }
    }
}
