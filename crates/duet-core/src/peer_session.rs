//! PeerSession: one supervised connection to the counterpart.
//!
//! A session is created per connection attempt and never reused. It owns
//! the local capture device, the [`PeerLink`] and the link's event stream,
//! and drives the connection state machine:
//!
//! ```text
//! Idle -> Connecting -> Open <-> Disconnected
//!   \________\__________\__________\________-> Closed (terminal)
//! ```
//!
//! The owning driver pulls events with [`PeerSession::poll_event`] and
//! calls [`PeerSession::tick`] periodically so resume attempts run on time.
//! Every surfaced event is also published on the session's [`EventBus`].

use crate::clock::Clock;
use crate::events::EventBus;
use crate::media::{LocalMedia, MediaDevice, RemoteStream, TrackKind};
use crate::protocol::ProtocolMessage;
use crate::reconnect::{ReconnectConfig, ReconnectState};
use crate::room_code::{DEFAULT_NAMESPACE, RoomCode, RoomCodeError};
use crate::transport::{LinkEvent, LinkHandle, PeerLink, Signaling, TransportError};
use futures::StreamExt;
use futures::channel::mpsc::UnboundedReceiver;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Which side of the session this peer is. Fixed for the session's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Originates the room code and accepts the inbound connection
    Host,
    /// Dials a known room code
    Guest,
}

impl Role {
    /// The other side of the session.
    pub fn counterpart(self) -> Self {
        match self {
            Self::Host => Self::Guest,
            Self::Guest => Self::Host,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Guest => f.write_str("guest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Disconnected,
    Closed,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    InvalidFormat(#[from] RoomCodeError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("Connect error: {0}")]
    Connect(String),

    #[error("Operation requires the {expected} role")]
    WrongRole { expected: Role },

    #[error("Session already started (state {0:?})")]
    AlreadyStarted(ConnectionState),
}

impl SessionError {
    fn from_establishment(error: TransportError) -> Self {
        match error {
            TransportError::NameTaken(_) | TransportError::Signaling(_) => {
                Self::Signaling(error.to_string())
            }
            TransportError::PeerUnavailable(_)
            | TransportError::ChannelFailed(_)
            | TransportError::MediaFailed(_)
            | TransportError::SendFailed(_)
            | TransportError::Closed => Self::Connect(error.to_string()),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Prefix of every identifier registered with signaling
    pub namespace: String,
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Lifecycle and data events surfaced to the hosting layer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// First transition into Open. Fires at most once per session.
    Ready,
    /// Transport lost, or a resume attempt failed.
    Lost,
    /// Back to Open after a loss.
    Resumed,
    RemoteStream(RemoteStream),
    /// Inbound protocol envelope.
    Message(ProtocolMessage),
    /// Establishment failure.
    Error(SessionError),
}

type CodeGenerator = Box<dyn FnMut() -> RoomCode + Send>;

pub struct PeerSession {
    role: Role,
    config: SessionConfig,
    signaling: Arc<dyn Signaling>,
    device: Arc<dyn MediaDevice>,
    clock: Arc<dyn Clock>,
    next_code: CodeGenerator,
    state: ConnectionState,
    room_code: Option<RoomCode>,
    link: Option<Box<dyn PeerLink>>,
    link_events: Option<UnboundedReceiver<LinkEvent>>,
    local_media: Option<LocalMedia>,
    holds_device: bool,
    ready_fired: bool,
    reconnect: ReconnectState,
    events: Arc<EventBus<PeerEvent>>,
}

impl PeerSession {
    pub fn new(
        role: Role,
        config: SessionConfig,
        signaling: Arc<dyn Signaling>,
        device: Arc<dyn MediaDevice>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            role,
            config,
            signaling,
            device,
            clock,
            next_code: Box::new(RoomCode::generate),
            state: ConnectionState::Idle,
            room_code: None,
            link: None,
            link_events: None,
            local_media: None,
            holds_device: false,
            ready_fired: false,
            reconnect: ReconnectState::new(),
            events: Arc::new(EventBus::new()),
        }
    }

    /// Replace the room code source used by [`PeerSession::host`].
    pub fn with_code_generator(mut self, generator: impl FnMut() -> RoomCode + Send + 'static) -> Self {
        self.next_code = Box::new(generator);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn room_code(&self) -> Option<&RoomCode> {
        self.room_code.as_ref()
    }

    /// Resume attempts made since the session was last Open.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect.attempts
    }

    pub fn events(&self) -> &Arc<EventBus<PeerEvent>> {
        &self.events
    }

    pub fn local_media(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    /// Register a fresh room code and wait for a guest.
    ///
    /// Codes already taken on the signaling service are replaced silently.
    pub async fn host(&mut self) -> Result<RoomCode, SessionError> {
        self.require(Role::Host)?;
        self.begin()?;
        self.acquire_media().await;

        loop {
            let code = (self.next_code)();
            let name = code.peer_name(&self.config.namespace);
            match self.signaling.register(&name).await {
                Ok(handle) => {
                    info!("Hosting room {} (registered as {})", code, name);
                    self.install(handle);
                    self.room_code = Some(code.clone());
                    return Ok(code);
                }
                Err(TransportError::NameTaken(_)) => {
                    debug!("Room code {} already taken, generating another", code);
                }
                Err(e) => {
                    return Err(self.fail(SessionError::Signaling(e.to_string())).await);
                }
            }
        }
    }

    /// Dial the room identified by user input `code`.
    pub async fn join(&mut self, code: &str) -> Result<RoomCode, SessionError> {
        self.require(Role::Guest)?;
        let code = RoomCode::normalize(code)?;
        self.begin()?;
        self.acquire_media().await;

        let name = code.peer_name(&self.config.namespace);
        let handle = match self.signaling.dial(&name).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(SessionError::from_establishment(e)).await),
        };

        let media = self.local_media.clone().unwrap_or_default();
        if let Err(e) = handle.link.call(&media).await {
            handle.link.close().await;
            return Err(self.fail(SessionError::Connect(e.to_string())).await);
        }

        info!("Joined room {} ({})", code, name);
        self.install(handle);
        self.room_code = Some(code.clone());
        Ok(code)
    }

    /// Fire-and-forget send. Dropped unless the session is Open.
    pub fn send(&self, message: &ProtocolMessage) {
        if self.state != ConnectionState::Open {
            debug!("Dropping {} while {:?}", message.kind(), self.state);
            return;
        }
        let Some(link) = &self.link else {
            return;
        };
        if let Err(e) = link.send(&message.to_json()) {
            warn!("Failed to send {}: {}", message.kind(), e);
        }
    }

    /// Wait for the next event worth surfacing.
    ///
    /// Returns `None` once the session has no link (never started, or closed).
    pub async fn poll_event(&mut self) -> Option<PeerEvent> {
        loop {
            let next = self.link_events.as_mut()?.next().await;
            let surfaced = match next {
                Some(event) => self.on_link_event(event),
                None => {
                    debug!("Link event stream ended");
                    self.link_events = None;
                    let surfaced = self.on_link_event(LinkEvent::Disconnected);
                    self.reconnect.cancel();
                    surfaced
                }
            };
            if let Some(event) = surfaced {
                self.events.emit(event.clone());
                return Some(event);
            }
            if self.link_events.is_none() {
                return None;
            }
        }
    }

    /// Run a due resume attempt. Returns `Lost` when the attempt failed.
    pub async fn tick(&mut self) -> Option<PeerEvent> {
        if self.state != ConnectionState::Disconnected {
            return None;
        }
        if !self.reconnect.take_due(self.clock.now_ms()) {
            return None;
        }
        let link = self.link.as_ref()?;

        info!(
            "Attempting to resume transport (attempt {})",
            self.reconnect.attempts
        );
        match link.reconnect().await {
            Ok(()) => {
                debug!("Transport re-established, waiting for counterpart");
                None
            }
            Err(e) => {
                warn!(
                    "Resume attempt {} failed: {}",
                    self.reconnect.attempts, e
                );
                if !self.schedule_resume() {
                    warn!("Giving up on automatic resume");
                }
                self.events.emit(PeerEvent::Lost);
                Some(PeerEvent::Lost)
            }
        }
    }

    /// Mute/unmute local audio. Returns the new state, false without a track.
    pub fn toggle_local_audio(&mut self) -> bool {
        self.toggle(TrackKind::Audio)
    }

    /// Turn local video on/off. Returns the new state, false without a track.
    pub fn toggle_local_video(&mut self) -> bool {
        self.toggle(TrackKind::Video)
    }

    /// Tear down. Idempotent.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        info!("Closing {} session", self.role);
        self.teardown().await;
    }

    fn toggle(&mut self, kind: TrackKind) -> bool {
        self.local_media
            .as_mut()
            .map(|media| media.toggle(kind))
            .unwrap_or(false)
    }

    fn require(&self, expected: Role) -> Result<(), SessionError> {
        if self.role == expected {
            Ok(())
        } else {
            Err(SessionError::WrongRole { expected })
        }
    }

    fn begin(&mut self) -> Result<(), SessionError> {
        if self.state != ConnectionState::Idle {
            return Err(SessionError::AlreadyStarted(self.state));
        }
        self.state = ConnectionState::Connecting;
        Ok(())
    }

    async fn acquire_media(&mut self) {
        match self.device.acquire().await {
            Ok(media) => {
                debug!("Acquired local media ({} track(s))", media.tracks().len());
                self.local_media = Some(media);
                self.holds_device = true;
            }
            Err(e) => {
                warn!("Camera/microphone unavailable ({}), continuing without local media", e);
                self.local_media = Some(LocalMedia::empty());
            }
        }
    }

    fn install(&mut self, handle: LinkHandle) {
        self.link = Some(handle.link);
        self.link_events = Some(handle.events);
    }

    async fn fail(&mut self, error: SessionError) -> SessionError {
        warn!("Session establishment failed: {}", error);
        self.events.emit(PeerEvent::Error(error.clone()));
        self.teardown().await;
        error
    }

    async fn teardown(&mut self) {
        self.reconnect.cancel();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
        self.link_events = None;
        self.release_media();
        self.state = ConnectionState::Closed;
    }

    fn release_media(&mut self) {
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        if self.holds_device {
            self.holds_device = false;
            self.device.release();
        }
    }

    fn schedule_resume(&mut self) -> bool {
        self.reconnect
            .schedule(self.clock.now_ms(), &self.config.reconnect)
    }

    fn on_link_event(&mut self, event: LinkEvent) -> Option<PeerEvent> {
        if self.state == ConnectionState::Closed {
            return None;
        }
        match event {
            LinkEvent::ChannelOpen => match self.state {
                ConnectionState::Connecting | ConnectionState::Disconnected => {
                    let resumed = self.state == ConnectionState::Disconnected;
                    self.state = ConnectionState::Open;
                    self.reconnect.reset();
                    if !self.ready_fired {
                        self.ready_fired = true;
                        info!("Connection ready ({})", self.role);
                        Some(PeerEvent::Ready)
                    } else if resumed {
                        info!("Connection resumed ({})", self.role);
                        Some(PeerEvent::Resumed)
                    } else {
                        None
                    }
                }
                _ => {
                    debug!("Ignoring channel open while {:?}", self.state);
                    None
                }
            },
            LinkEvent::Disconnected => {
                if self.state != ConnectionState::Open {
                    debug!("Ignoring transport loss while {:?}", self.state);
                    return None;
                }
                self.state = ConnectionState::Disconnected;
                self.reconnect.reset();
                self.schedule_resume();
                info!("Connection lost, resume scheduled");
                Some(PeerEvent::Lost)
            }
            LinkEvent::IncomingCall(stream) => {
                if let Some(link) = &self.link {
                    let media = self.local_media.clone().unwrap_or_default();
                    if let Err(e) = link.answer(&media) {
                        warn!("Failed to answer media call: {}", e);
                    }
                }
                Some(PeerEvent::RemoteStream(stream))
            }
            LinkEvent::RemoteStream(stream) => Some(PeerEvent::RemoteStream(stream)),
            LinkEvent::Data(data) => match ProtocolMessage::from_json(&data) {
                Some(message) => Some(PeerEvent::Message(message)),
                None => {
                    debug!("Ignoring non-protocol frame ({} bytes)", data.len());
                    None
                }
            },
            LinkEvent::Error(e) => {
                warn!("Link error: {}", e);
                None
            }
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.release_media();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::media::MediaError;
    use crate::transport::Result as TransportResult;
    use async_trait::async_trait;
    use futures::channel::mpsc::{self, UnboundedSender};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    // ==================== Fakes ====================

    #[derive(Default)]
    struct LinkRecord {
        sent: Mutex<Vec<Vec<u8>>>,
        calls: AtomicUsize,
        answers: AtomicUsize,
        reconnects: AtomicUsize,
        closes: AtomicUsize,
        reconnect_results: Mutex<VecDeque<TransportResult<()>>>,
        fail_call: AtomicBool,
    }

    struct FakeLink {
        name: String,
        record: Arc<LinkRecord>,
    }

    #[async_trait]
    impl PeerLink for FakeLink {
        fn peer_name(&self) -> &str {
            &self.name
        }

        fn send(&self, data: &[u8]) -> TransportResult<()> {
            self.record.sent.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn answer(&self, _local: &LocalMedia) -> TransportResult<()> {
            self.record.answers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn call(&self, _local: &LocalMedia) -> TransportResult<()> {
            self.record.calls.fetch_add(1, Ordering::SeqCst);
            if self.record.fail_call.load(Ordering::SeqCst) {
                return Err(TransportError::MediaFailed("no answer".into()));
            }
            Ok(())
        }

        async fn reconnect(&self) -> TransportResult<()> {
            self.record.reconnects.fetch_add(1, Ordering::SeqCst);
            self.record
                .reconnect_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(()))
        }

        async fn close(&self) {
            self.record.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeSignaling {
        collisions: AtomicUsize,
        failure: Mutex<Option<TransportError>>,
        registered: Mutex<Vec<String>>,
        dialed: Mutex<Vec<String>>,
        senders: Mutex<Vec<UnboundedSender<LinkEvent>>>,
        record: Arc<LinkRecord>,
    }

    impl FakeSignaling {
        fn handle(&self, name: &str) -> LinkHandle {
            let (tx, rx) = mpsc::unbounded();
            self.senders.lock().unwrap().push(tx);
            LinkHandle {
                link: Box::new(FakeLink {
                    name: name.to_string(),
                    record: Arc::clone(&self.record),
                }),
                events: rx,
            }
        }

        fn push(&self, event: LinkEvent) {
            let senders = self.senders.lock().unwrap();
            senders.last().unwrap().unbounded_send(event).unwrap();
        }
    }

    #[async_trait]
    impl Signaling for FakeSignaling {
        async fn register(&self, peer_name: &str) -> TransportResult<LinkHandle> {
            self.registered.lock().unwrap().push(peer_name.to_string());
            if let Some(e) = self.failure.lock().unwrap().clone() {
                return Err(e);
            }
            if self.collisions.load(Ordering::SeqCst) > 0 {
                self.collisions.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::NameTaken(peer_name.to_string()));
            }
            Ok(self.handle(peer_name))
        }

        async fn dial(&self, peer_name: &str) -> TransportResult<LinkHandle> {
            self.dialed.lock().unwrap().push(peer_name.to_string());
            if let Some(e) = self.failure.lock().unwrap().clone() {
                return Err(e);
            }
            Ok(self.handle(peer_name))
        }
    }

    #[derive(Default)]
    struct FakeDevice {
        held: AtomicBool,
        denied: AtomicBool,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl MediaDevice for FakeDevice {
        async fn acquire(&self) -> Result<LocalMedia, MediaError> {
            if self.denied.load(Ordering::SeqCst) {
                return Err(MediaError::Denied("permission dismissed".into()));
            }
            if self.held.swap(true, Ordering::SeqCst) {
                return Err(MediaError::Busy);
            }
            Ok(LocalMedia::new(&[TrackKind::Audio, TrackKind::Video]))
        }

        fn release(&self) {
            self.held.store(false, Ordering::SeqCst);
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        signaling: Arc<FakeSignaling>,
        device: Arc<FakeDevice>,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                signaling: Arc::new(FakeSignaling::default()),
                device: Arc::new(FakeDevice::default()),
                clock: ManualClock::new(0),
            }
        }

        fn session(&self, role: Role) -> PeerSession {
            PeerSession::new(
                role,
                SessionConfig::default(),
                self.signaling.clone(),
                self.device.clone(),
                self.clock.clone(),
            )
        }

        fn count_events(&self, session: &PeerSession, wanted: PeerEvent) -> (Arc<AtomicUsize>, crate::events::Subscription<PeerEvent>) {
            let count = Arc::new(AtomicUsize::new(0));
            let counter = Arc::clone(&count);
            let sub = session.events().subscribe(move |event| {
                if event == wanted {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            });
            (count, sub)
        }
    }

    async fn open_host(fx: &Fixture) -> PeerSession {
        let mut session = fx.session(Role::Host);
        session.host().await.unwrap();
        fx.signaling.push(LinkEvent::ChannelOpen);
        assert_eq!(session.poll_event().await, Some(PeerEvent::Ready));
        session
    }

    // ==================== Hosting ====================

    #[tokio::test]
    async fn test_host_registers_namespaced_code() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Host);

        let code = session.host().await.unwrap();

        assert!(code.is_canonical());
        assert_eq!(
            fx.signaling.registered.lock().unwrap().as_slice(),
            [format!("AVENTURA-{}", code)]
        );
        assert_eq!(session.state(), ConnectionState::Connecting);
        assert_eq!(session.room_code(), Some(&code));
    }

    #[tokio::test]
    async fn test_host_retries_collisions_silently() {
        let fx = Fixture::new();
        fx.signaling.collisions.store(2, Ordering::SeqCst);
        let mut codes = vec!["BBBB22", "CCCC33", "DDDD44"].into_iter();
        let mut session = fx
            .session(Role::Host)
            .with_code_generator(move || RoomCode::normalize(codes.next().unwrap()).unwrap());
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        let _sub = session.events().subscribe(move |event| {
            if matches!(event, PeerEvent::Error(_)) {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let code = session.host().await.unwrap();

        assert_eq!(code.as_str(), "DDDD44");
        assert_eq!(fx.signaling.registered.lock().unwrap().len(), 3);
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_host_signaling_failure_surfaces_once() {
        let fx = Fixture::new();
        *fx.signaling.failure.lock().unwrap() =
            Some(TransportError::Signaling("server unreachable".into()));
        let mut session = fx.session(Role::Host);
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = Arc::clone(&errors);
        let _sub = session.events().subscribe(move |event| {
            if matches!(event, PeerEvent::Error(SessionError::Signaling(_))) {
                errors_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        let err = session.host().await.unwrap_err();

        assert!(matches!(err, SessionError::Signaling(_)));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(fx.device.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_role_is_enforced() {
        let fx = Fixture::new();
        let mut guest = fx.session(Role::Guest);
        assert_eq!(
            guest.host().await.unwrap_err(),
            SessionError::WrongRole {
                expected: Role::Host
            }
        );
        let mut host = fx.session(Role::Host);
        assert!(matches!(
            host.join("ABCD23").await,
            Err(SessionError::WrongRole { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_is_not_reused() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Host);
        session.host().await.unwrap();
        assert!(matches!(
            session.host().await,
            Err(SessionError::AlreadyStarted(ConnectionState::Connecting))
        ));
    }

    // ==================== Joining ====================

    #[tokio::test]
    async fn test_join_normalizes_and_dials() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Guest);

        let code = session.join("  abcd23 ").await.unwrap();

        assert_eq!(code.as_str(), "ABCD23");
        assert_eq!(
            fx.signaling.dialed.lock().unwrap().as_slice(),
            ["AVENTURA-ABCD23".to_string()]
        );
        assert_eq!(fx.signaling.record.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_join_rejects_short_code_without_starting() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Guest);

        let err = session.join(" ab ").await.unwrap_err();

        assert!(matches!(err, SessionError::InvalidFormat(_)));
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(fx.signaling.dialed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_unreachable_peer_is_connect_error() {
        let fx = Fixture::new();
        *fx.signaling.failure.lock().unwrap() =
            Some(TransportError::PeerUnavailable("AVENTURA-ABCD23".into()));
        let mut session = fx.session(Role::Guest);

        let err = session.join("ABCD23").await.unwrap_err();

        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_join_media_leg_failure_is_connect_error() {
        let fx = Fixture::new();
        fx.signaling.record.fail_call.store(true, Ordering::SeqCst);
        let mut session = fx.session(Role::Guest);

        let err = session.join("ABCD23").await.unwrap_err();

        assert!(matches!(err, SessionError::Connect(_)));
        assert_eq!(fx.signaling.record.closes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.device.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_and_guest_ready_once() {
        let fx = Fixture::new();
        let mut host = fx
            .session(Role::Host)
            .with_code_generator(|| RoomCode::normalize("ABCD23").unwrap());
        let (host_ready, _h) = fx.count_events(&host, PeerEvent::Ready);

        let code = host.host().await.unwrap();
        assert_eq!(code.as_str(), "ABCD23");
        fx.signaling.push(LinkEvent::ChannelOpen);
        fx.signaling.push(LinkEvent::ChannelOpen);
        fx.signaling.push(LinkEvent::Data(ProtocolMessage::ping(1).to_json()));
        assert_eq!(host.poll_event().await, Some(PeerEvent::Ready));
        assert_eq!(
            host.poll_event().await,
            Some(PeerEvent::Message(ProtocolMessage::ping(1)))
        );

        // Guest uses its own device so the host's acquisition does not block it.
        let guest_fx = Fixture {
            signaling: fx.signaling.clone(),
            device: Arc::new(FakeDevice::default()),
            clock: fx.clock.clone(),
        };
        let mut guest = guest_fx.session(Role::Guest);
        let (guest_ready, _g) = guest_fx.count_events(&guest, PeerEvent::Ready);
        assert_eq!(guest.join("  abcd23 ").await.unwrap(), code);
        fx.signaling.push(LinkEvent::ChannelOpen);
        assert_eq!(guest.poll_event().await, Some(PeerEvent::Ready));

        assert_eq!(host_ready.load(Ordering::SeqCst), 1);
        assert_eq!(guest_ready.load(Ordering::SeqCst), 1);
    }

    // ==================== Data and media ====================

    #[tokio::test]
    async fn test_send_dropped_until_open() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Host);
        session.host().await.unwrap();

        session.send(&ProtocolMessage::ping(5));
        assert!(fx.signaling.record.sent.lock().unwrap().is_empty());

        fx.signaling.push(LinkEvent::ChannelOpen);
        session.poll_event().await;
        session.send(&ProtocolMessage::ping(6));

        let sent = fx.signaling.record.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            ProtocolMessage::from_json(&sent[0]),
            Some(ProtocolMessage::ping(6))
        );
    }

    #[tokio::test]
    async fn test_non_protocol_frames_are_skipped() {
        let fx = Fixture::new();
        let mut session = open_host(&fx).await;
        fx.signaling.push(LinkEvent::Data(b"garbage".to_vec()));
        fx.signaling.push(LinkEvent::Error("ice hiccup".into()));
        fx.signaling
            .push(LinkEvent::Data(br#"{"type":"FUTURE","payload":{}}"#.to_vec()));

        assert_eq!(
            session.poll_event().await,
            Some(PeerEvent::Message(ProtocolMessage::Unknown {
                kind: "FUTURE".into()
            }))
        );
    }

    #[tokio::test]
    async fn test_incoming_call_is_answered() {
        let fx = Fixture::new();
        let mut session = open_host(&fx).await;
        let stream = RemoteStream {
            tracks: vec![TrackKind::Audio],
        };
        fx.signaling.push(LinkEvent::IncomingCall(stream.clone()));

        assert_eq!(
            session.poll_event().await,
            Some(PeerEvent::RemoteStream(stream))
        );
        assert_eq!(fx.signaling.record.answers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_toggles() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Host);
        assert!(!session.toggle_local_audio());

        session.host().await.unwrap();
        assert!(!session.toggle_local_audio());
        assert!(session.toggle_local_audio());
        assert!(!session.toggle_local_video());
    }

    #[tokio::test]
    async fn test_denied_media_continues_without_tracks() {
        let fx = Fixture::new();
        fx.device.denied.store(true, Ordering::SeqCst);
        let mut session = fx.session(Role::Host);

        session.host().await.unwrap();

        assert!(session.local_media().unwrap().tracks().is_empty());
        assert!(!session.toggle_local_audio());
        assert!(!session.toggle_local_video());
        session.close().await;
        assert_eq!(fx.device.releases.load(Ordering::SeqCst), 0);
    }

    // ==================== Loss and resume ====================

    #[tokio::test]
    async fn test_loss_then_resume_does_not_repeat_ready() {
        let fx = Fixture::new();
        let mut session = open_host(&fx).await;
        let (ready, _r) = fx.count_events(&session, PeerEvent::Ready);
        let (lost, _l) = fx.count_events(&session, PeerEvent::Lost);

        fx.signaling.push(LinkEvent::Disconnected);
        assert_eq!(session.poll_event().await, Some(PeerEvent::Lost));
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        fx.clock.advance(Duration::from_millis(1_999));
        assert_eq!(session.tick().await, None);
        assert_eq!(fx.signaling.record.reconnects.load(Ordering::SeqCst), 0);

        fx.clock.advance(Duration::from_millis(1));
        assert_eq!(session.tick().await, None);
        assert_eq!(fx.signaling.record.reconnects.load(Ordering::SeqCst), 1);

        fx.signaling.push(LinkEvent::ChannelOpen);
        assert_eq!(session.poll_event().await, Some(PeerEvent::Resumed));
        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(ready.load(Ordering::SeqCst), 0);
        assert_eq!(session.reconnect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_failed_resumes_fire_lost_until_budget_spent() {
        let fx = Fixture::new();
        let mut session = open_host(&fx).await;
        {
            let mut results = fx.signaling.record.reconnect_results.lock().unwrap();
            for _ in 0..3 {
                results.push_back(Err(TransportError::Signaling("offline".into())));
            }
        }

        fx.signaling.push(LinkEvent::Disconnected);
        session.poll_event().await;

        for _ in 0..3 {
            fx.clock.advance(Duration::from_secs(16));
            assert_eq!(session.tick().await, Some(PeerEvent::Lost));
        }
        fx.clock.advance(Duration::from_secs(60));
        assert_eq!(session.tick().await, None);

        assert_eq!(fx.signaling.record.reconnects.load(Ordering::SeqCst), 3);
        assert_eq!(session.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_loss_before_open_is_ignored() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Host);
        session.host().await.unwrap();

        fx.signaling.push(LinkEvent::Disconnected);
        fx.signaling.push(LinkEvent::ChannelOpen);

        assert_eq!(session.poll_event().await, Some(PeerEvent::Ready));
    }

    // ==================== Teardown ====================

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = Fixture::new();
        let mut session = open_host(&fx).await;
        fx.signaling.push(LinkEvent::Disconnected);
        session.poll_event().await;

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(fx.signaling.record.closes.load(Ordering::SeqCst), 1);
        assert_eq!(fx.device.releases.load(Ordering::SeqCst), 1);
        assert_eq!(session.poll_event().await, None);

        // Pending resume was cancelled.
        fx.clock.advance(Duration::from_secs(60));
        assert_eq!(session.tick().await, None);
        assert_eq!(fx.signaling.record.reconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_before_start() {
        let fx = Fixture::new();
        let mut session = fx.session(Role::Guest);
        session.close().await;
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(matches!(
            session.join("ABCD23").await,
            Err(SessionError::AlreadyStarted(ConnectionState::Closed))
        ));
    }

    #[tokio::test]
    async fn test_replacing_session_releases_device_first() {
        let fx = Fixture::new();
        let mut first = fx.session(Role::Host);
        first.host().await.unwrap();
        drop(first);

        let mut second = fx.session(Role::Host);
        second.host().await.unwrap();

        // Second session got real tracks, not the busy-device fallback.
        assert_eq!(second.local_media().unwrap().tracks().len(), 2);
        assert_eq!(fx.device.releases.load(Ordering::SeqCst), 1);
    }
}
